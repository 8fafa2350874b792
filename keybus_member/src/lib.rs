//! The keybus member client: act as a participant on a distributed,
//! transactional publish/subscribe data bus.
//!
//! A process joins the bus by building a member instance over a
//! [`Transport`], registering interest in subtrees of the hierarchical data
//! model, and servicing queries the central router directs at those
//! subtrees. Registrations carrying the `CACHE` flag additionally persist
//! routed data into a sharded key-value store, with writes driven through a
//! two-phase commit protocol (stage, precommit, commit) by the
//! [`TransactionCoordinator`].
//!
//! # Concurrency
//!
//! Each member instance is a single reactor task: registration callbacks,
//! KV completion handling and bus state changes for one instance never run
//! concurrently with each other. Multiple member instances in one process
//! are independent tasks and may run on separate threads; the one structure
//! they share is the injected [`KvTableRegistry`].
//!
//! [`KvTableRegistry`]: keybus_kv::KvTableRegistry

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

mod builder;
mod coordinator;
mod handle;
pub mod mock;
mod reactor;
mod registration;
mod transport;

pub use builder::*;
pub use coordinator::{CompletedXact, CompletionOutcome, TransactionCoordinator, XactPhase};
pub use handle::*;
pub use registration::*;
pub use transport::*;
