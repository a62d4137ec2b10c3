//! Contains the [`EventStore`] façade: the entry point that creates and
//! opens streams, owns the hook chain, and translates backend failures
//! into the error kinds callers program against.

use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;

use crate::commit::{Commit, CommitAttempt, InvalidCommit, StreamRevision};
use crate::dispatch::ScheduleDispatch;
use crate::hook::{HookChain, PipelineHook};
use crate::persist::hooked::Hooked;
use crate::persist::{CommitStream, PersistCommits, PersistError};
use crate::snapshot::Snapshot;
use crate::stream::OptimisticEventStream;

/// All possible error types returned when opening a stream.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// The stream was opened with a minimum revision above zero and
    /// persistence holds no matching commits.
    #[error("no commits found for the requested stream")]
    StreamNotFound,

    /// The read failed in the persistence layer.
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// All possible error types returned when committing through the store
/// or a stream.
#[derive(thiserror::Error)]
pub enum CommitError<Id, T> {
    /// The raw attempt violated a commit invariant.
    #[error("commit attempt failed validation: {0}")]
    InvalidCommit(#[from] InvalidCommit),

    /// A commit with the same identifier has already been persisted for
    /// this stream.
    #[error("a commit with the same identifier has already been persisted for this stream")]
    DuplicateCommit,

    /// Another writer advanced the stream head first. Carries the newly
    /// discovered commits so the caller can rebase.
    #[error("another writer advanced the stream head, {} newer commits discovered", .conflicting.len())]
    Conflict {
        /// The commits persisted by other writers past the head this
        /// attempt expected.
        conflicting: Vec<Commit<Id, T>>,
    },

    /// The commit is durable but delivering it to the dispatch consumer
    /// failed; it stays undispatched and is retried at the next scheduler
    /// startup.
    #[error("commit was persisted but dispatch failed: {0}")]
    Dispatch(#[source] anyhow::Error),

    /// The write failed in the persistence layer.
    #[error(transparent)]
    Persist(PersistError),
}

// Hand-written so the error stays usable for any stream id and payload
// type, not just ones that are themselves Debug.
impl<Id, T> std::fmt::Debug for CommitError<Id, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitError::InvalidCommit(reason) => {
                f.debug_tuple("InvalidCommit").field(reason).finish()
            }
            CommitError::DuplicateCommit => f.write_str("DuplicateCommit"),
            CommitError::Conflict { conflicting } => f
                .debug_struct("Conflict")
                .field("conflicting", &conflicting.len())
                .finish(),
            CommitError::Dispatch(source) => f.debug_tuple("Dispatch").field(source).finish(),
            CommitError::Persist(source) => f.debug_tuple("Persist").field(source).finish(),
        }
    }
}

/// The committing surface an [`OptimisticEventStream`] works against.
///
/// Implemented by [`EventStore`]; kept as a trait so streams can be
/// exercised against test doubles.
#[async_trait]
pub trait CommitEvents<Id, T>: Send + Sync {
    /// Streams the commits of `stream_id` whose event revision window
    /// intersects `[min_revision, max_revision]`, ordered by commit
    /// sequence.
    fn get_between(
        &self,
        stream_id: &Id,
        min_revision: StreamRevision,
        max_revision: StreamRevision,
    ) -> CommitStream<'_, Id, T>;

    /// Validates and persists a raw commit attempt, running the
    /// pre-commit and post-commit hook chains around the write.
    ///
    /// Returns `Ok(None)` when a pre-commit hook vetoed the attempt.
    async fn commit(
        &self,
        attempt: CommitAttempt<Id, T>,
    ) -> Result<Option<Commit<Id, T>>, CommitError<Id, T>>;
}

/// The event store façade.
///
/// Composes a persistence backend with the configured [`PipelineHook`]s
/// and an optional dispatch scheduler, and hands out
/// [`OptimisticEventStream`]s for individual streams.
pub struct EventStore<P, Id, T> {
    persistence: Arc<P>,
    hooks: HookChain<Id, T>,
    scheduler: Option<Arc<dyn ScheduleDispatch<Id, T>>>,
    advanced: Hooked<P, Id, T>,
}

impl<P, Id, T> Clone for EventStore<P, Id, T> {
    fn clone(&self) -> Self {
        Self {
            persistence: self.persistence.clone(),
            hooks: self.hooks.clone(),
            scheduler: self.scheduler.clone(),
            advanced: self.advanced.clone(),
        }
    }
}

impl<P, Id, T> EventStore<P, Id, T>
where
    P: PersistCommits<Id, T>,
    Id: Clone + Eq + Hash + Send + Sync,
    T: Clone + Send + Sync,
{
    /// Creates a store over the given backend, with no hooks and no
    /// dispatch scheduler.
    pub fn new(persistence: P) -> Self {
        let persistence = Arc::new(persistence);

        Self {
            advanced: Hooked::new(persistence.clone(), HookChain::default()),
            persistence,
            hooks: HookChain::default(),
            scheduler: None,
        }
    }

    /// Installs the pipeline hooks, applied in the order given.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Vec<Arc<dyn PipelineHook<Id, T>>>) -> Self {
        self.hooks = HookChain::new(hooks);
        self.advanced = Hooked::new(self.persistence.clone(), self.hooks.clone());
        self
    }

    /// Installs the dispatch scheduler invoked after every successful
    /// commit.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn ScheduleDispatch<Id, T>>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Returns a fresh stream with no prior history.
    pub fn create_stream(&self, stream_id: Id) -> OptimisticEventStream<Id, T, Self> {
        OptimisticEventStream::new(self.clone(), stream_id)
    }

    /// Opens the stream from the commits whose events fall within
    /// `[min_revision, max_revision]`.
    ///
    /// # Errors
    ///
    /// Returns [`OpenError::StreamNotFound`] when `min_revision > 0` and
    /// no commits exist.
    pub async fn open_stream(
        &self,
        stream_id: Id,
        min_revision: StreamRevision,
        max_revision: StreamRevision,
    ) -> Result<OptimisticEventStream<Id, T, Self>, OpenError> {
        OptimisticEventStream::open(self.clone(), stream_id, min_revision, max_revision).await
    }

    /// Opens the stream on top of the given snapshot, applying only the
    /// events recorded past it, up to `max_revision`.
    pub async fn open_stream_from_snapshot<S>(
        &self,
        snapshot: &Snapshot<Id, S>,
        max_revision: StreamRevision,
    ) -> Result<OptimisticEventStream<Id, T, Self>, OpenError> {
        OptimisticEventStream::open_from_snapshot(
            self.clone(),
            snapshot.stream_id.clone(),
            snapshot.stream_revision,
            max_revision,
        )
        .await
    }

    /// The hook-aware persistence surface for cross-stream queries:
    /// commits read through it run through the `select` chain.
    pub fn advanced(&self) -> &Hooked<P, Id, T> {
        &self.advanced
    }
}

#[async_trait]
impl<P, Id, T> CommitEvents<Id, T> for EventStore<P, Id, T>
where
    P: PersistCommits<Id, T>,
    Id: Clone + Eq + Hash + Send + Sync,
    T: Clone + Send + Sync,
{
    fn get_between(
        &self,
        stream_id: &Id,
        min_revision: StreamRevision,
        max_revision: StreamRevision,
    ) -> CommitStream<'_, Id, T> {
        self.persistence
            .get_between(stream_id, min_revision, max_revision)
    }

    async fn commit(
        &self,
        attempt: CommitAttempt<Id, T>,
    ) -> Result<Option<Commit<Id, T>>, CommitError<Id, T>> {
        attempt.validate()?;

        if !self.hooks.pre_commit(&attempt) {
            tracing::debug!("commit attempt vetoed by a pre-commit hook");
            return Ok(None);
        }

        let stream_id = attempt.stream_id.clone();
        let commit_id = attempt.commit_id;
        let from_revision = attempt.starting_revision();

        match self.persistence.commit(attempt).await {
            Ok(commit) => {
                self.hooks.post_commit(&commit);

                if let Some(scheduler) = &self.scheduler {
                    scheduler
                        .schedule(commit.clone())
                        .await
                        .map_err(|err| CommitError::Dispatch(anyhow::Error::new(err)))?;
                }

                Ok(Some(commit))
            }
            Err(PersistError::Conflict) => {
                // Fetch what the other writers persisted past the head
                // this attempt expected: the stream rebases from it, and
                // it tells a concurrency failure apart from a retried
                // commit that already went through.
                let conflicting: Vec<_> = self
                    .persistence
                    .get_between(&stream_id, from_revision, StreamRevision::MAX)
                    .try_collect()
                    .await
                    .map_err(CommitError::Persist)?;

                if conflicting.iter().any(|c| c.commit_id == commit_id) {
                    Err(CommitError::DuplicateCommit)
                } else {
                    Err(CommitError::Conflict { conflicting })
                }
            }
            Err(PersistError::DuplicateCommit) => Err(CommitError::DuplicateCommit),
            Err(err) => Err(CommitError::Persist(err)),
        }
    }
}
