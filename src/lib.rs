//! `chronicle` is an embedded event-sourcing commit store: it persists
//! the mutating history of domain aggregates as append-only sequences of
//! commits, reads that history back, takes periodic snapshots, and
//! delivers newly written commits to downstream consumers.
//!
//! Each logical aggregate is represented by a stream identified by a
//! stable identifier; writes to a stream obey optimistic concurrency
//! against the stream's head.
//!
//! The building blocks:
//! - [`store::EventStore`] creates and opens
//!   [`stream::OptimisticEventStream`]s, the per-stream working copies
//!   used to stage and commit events;
//! - [`persist`] defines the pluggable persistence contract, with an
//!   in-memory reference implementation;
//! - [`hook`] lets middleware filter and observe commits around reads
//!   and writes;
//! - [`dispatch`] delivers each persisted commit to a consumer exactly
//!   once;
//! - [`poll`] tail-reads the commit log from a checkpoint and fans the
//!   discovered commits out to subscribers.

#![deny(unsafe_code, unused_qualifications, trivial_casts)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod commit;
pub mod dispatch;
pub mod hook;
pub mod message;
pub mod persist;
pub mod poll;
pub mod serde;
pub mod snapshot;
pub mod store;
pub mod stream;

pub use crate::commit::{Checkpoint, Commit, CommitAttempt, CommitId, CommitSequence, StreamRevision};
pub use crate::message::{EventMessage, Headers};
pub use crate::snapshot::{Snapshot, StreamHead};
pub use crate::store::EventStore;
pub use crate::stream::OptimisticEventStream;
