//! Weir is a change feed processor for partitioned document stores.
//!
//! A pool of host instances shares a persisted set of partition leases,
//! rebalances ownership between themselves, reads each partition range's
//! ordered change feed, and delivers batches of changes to a user-supplied
//! observer with at-least-once semantics. Progress is checkpointed back
//! into the owning lease, partition splits are detected and handled, and
//! the remaining backlog can be estimated per lease.
//!
//! The document store itself is an external collaborator behind the
//! [`store::Collection`] trait. An in-memory engine is bundled for tests
//! and single-host embedding.

#[macro_use]
extern crate tracing;

#[macro_use]
mod mac;

pub mod cnf;
pub mod err;
pub mod est;
pub mod feed;
pub mod host;
pub mod lease;
pub mod options;
pub mod store;

pub use self::err::Error;
pub use self::host::manager::{ChangeFeedProcessor, ChangeFeedProcessorBuilder};
pub use self::host::{ChangeFeedObserver, CloseReason, ObserverContext};
pub use self::options::ProcessorOptions;
