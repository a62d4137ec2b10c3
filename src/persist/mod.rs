//! Contains the persistence contract the commit store is built against,
//! and the in-memory and hook-aware implementations shipped with the
//! crate.
//!
//! Backends implement [`PersistCommits`] (the commit log, stream-head
//! index and undispatched queue) and [`AccessSnapshots`]; the blanket
//! [`Persistence`] trait combines the two.

pub mod hooked;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::commit::{Checkpoint, Commit, CommitAttempt, StreamRevision};
use crate::snapshot::{Snapshot, StreamHead};

/// A lazy, single-pass sequence of [`Commit`]s read back from
/// persistence.
///
/// Callers must not assume restartability: once consumed, a stream is
/// gone and a fresh read must be issued.
pub type CommitStream<'a, Id, T> = BoxStream<'a, Result<Commit<Id, T>, PersistError>>;

/// A lazy, single-pass sequence of [`StreamHead`]s.
pub type StreamHeadStream<'a, Id> = BoxStream<'a, Result<StreamHead<Id>, PersistError>>;

/// All possible error types returned by persistence implementations.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// A commit with the same identifier has already been persisted for
    /// the stream.
    #[error("a commit with the same identifier has already been persisted for this stream")]
    DuplicateCommit,

    /// Another writer advanced the stream head past the attempted commit
    /// sequence.
    #[error("the stream head has moved past the attempted commit sequence")]
    Conflict,

    /// The backend could not be reached; the caller may retry with
    /// backoff.
    #[error("storage is unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),

    /// Any other persistence fault, wrapping the underlying cause.
    #[error("storage operation failed: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Interface to the durable commit log: appending commits, reading them
/// back, and tracking dispatch of newly persisted ones.
///
/// Implementations must be safe under concurrent calls from many tasks.
/// Reads may be slightly stale on eventually-consistent backends; writes
/// are strongly consistent.
#[async_trait]
pub trait PersistCommits<Id, T>: Send + Sync
where
    Id: Send + Sync,
    T: Send + Sync,
{
    /// Prepares storage for use. Idempotent: second and later calls in
    /// the same process are no-ops, and concurrent calls from multiple
    /// processes must not corrupt state.
    async fn initialize(&self) -> Result<(), PersistError>;

    /// Streams the commits of `stream_id` whose event revision window
    /// intersects `[min_revision, max_revision]`, ordered by commit
    /// sequence ascending.
    fn get_between(
        &self,
        stream_id: &Id,
        min_revision: StreamRevision,
        max_revision: StreamRevision,
    ) -> CommitStream<'_, Id, T>;

    /// Streams all commits stamped at or after `instant`, ordered by
    /// commit stamp then checkpoint.
    fn get_since(&self, instant: DateTime<Utc>) -> CommitStream<'_, Id, T>;

    /// Streams all commits stamped within `[start, end)`, ordered by
    /// commit stamp then checkpoint.
    fn get_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> CommitStream<'_, Id, T>;

    /// Streams all commits with a checkpoint strictly greater than the
    /// given one, ordered by checkpoint. This is the tail-read used by
    /// the [`PollingObserver`][crate::poll::PollingObserver].
    fn get_from_checkpoint(&self, checkpoint: Checkpoint) -> CommitStream<'_, Id, T>;

    /// Durably appends the attempt and returns the persisted [`Commit`]
    /// with the checkpoint the backend allocated.
    ///
    /// # Errors
    ///
    /// - [`PersistError::DuplicateCommit`] when a commit with the same
    ///   `(stream_id, commit_id)` already exists;
    /// - [`PersistError::Conflict`] when a commit with the same
    ///   `(stream_id, commit_sequence)` but a different identifier
    ///   already exists;
    /// - [`PersistError::Unavailable`] on transport failure;
    /// - [`PersistError::Storage`] on any other persistence fault.
    async fn commit(&self, attempt: CommitAttempt<Id, T>) -> Result<Commit<Id, T>, PersistError>;

    /// Streams all commits not yet marked as dispatched, ordered by
    /// checkpoint.
    fn get_undispatched(&self) -> CommitStream<'_, Id, T>;

    /// Marks the commit as delivered to downstream consumers.
    /// Idempotent.
    async fn mark_dispatched(&self, commit: &Commit<Id, T>) -> Result<(), PersistError>;
}

/// Interface to the snapshot store and the stream-head index that feeds
/// snapshot scheduling.
#[async_trait]
pub trait AccessSnapshots<Id, S>: Send + Sync
where
    Id: Send + Sync,
    S: Send + Sync,
{
    /// Returns the most recent snapshot of the stream taken at or below
    /// `max_revision`, if any.
    async fn get_snapshot(
        &self,
        stream_id: &Id,
        max_revision: StreamRevision,
    ) -> Result<Option<Snapshot<Id, S>>, PersistError>;

    /// Stores the snapshot. Returns `true` iff it was newly stored:
    /// adding a second snapshot for the same `(stream_id,
    /// stream_revision)` returns `false`.
    async fn add_snapshot(&self, snapshot: Snapshot<Id, S>) -> Result<bool, PersistError>;

    /// Streams the heads of all streams that accumulated at least
    /// `threshold` events past their latest snapshot.
    fn get_streams_to_snapshot(&self, threshold: u64) -> StreamHeadStream<'_, Id>;
}

/// A full persistence backend: commit log plus snapshot store.
pub trait Persistence<Id, T, S>: PersistCommits<Id, T> + AccessSnapshots<Id, S>
where
    Id: Send + Sync,
    T: Send + Sync,
    S: Send + Sync,
{
}

impl<P, Id, T, S> Persistence<Id, T, S> for P
where
    P: PersistCommits<Id, T> + AccessSnapshots<Id, S>,
    Id: Send + Sync,
    T: Send + Sync,
    S: Send + Sync,
{
}
