//! The sharded key-value layer of the keybus member stack.
//!
//! A [`KvEngine`] is the external storage engine contract. The
//! [`KvTableRegistry`] hands out one [`KvTableHandle`] per distinct database
//! number for the lifetime of the process, and the [`KvOperationAdapter`]
//! wraps the engine's asynchronous operations behind uniform completion
//! messages delivered to the issuing member's reactor loop.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::explicit_iter_loop,
    clippy::todo,
    clippy::use_self,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs
)]

mod adapter;
mod engine;
pub mod mock;
mod registry;

pub use adapter::*;
pub use engine::*;
pub use registry::*;
