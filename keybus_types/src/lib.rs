//! Shared vocabulary types for the keybus member stack.
//!
//! Everything in this crate is plain data: the hierarchical [`PathKey`]
//! identifier and its canonical binary encoding, the small newtype IDs
//! exchanged between the sharder, KV and member layers, the protocol
//! enums carried on the bus, and the [`Message`] payload contract.

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

mod flags;
mod ids;
mod message;
mod path;
mod protocol;

pub use flags::*;
pub use ids::*;
pub use message::*;
pub use path::*;
pub use protocol::*;
