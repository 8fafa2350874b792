//! Shard routing for the keybus member stack.
//!
//! A [`ShardDirectory`] maps a canonical binpath (plus a deployment routing
//! salt) to the list of [`ShardDbInfo`] entries backing that key. The
//! [`ShardRouter`] sits in front of a directory and caches resolutions for
//! the lifetime of the process.
//!
//! [`ShardDbInfo`]: keybus_types::ShardDbInfo

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

mod directory;
mod jumphash;
pub mod mock;
mod router;

pub use directory::*;
pub use jumphash::*;
pub use router::*;
