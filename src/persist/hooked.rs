//! Decorator for a persistence backend that runs commits read from the
//! cross-stream query methods through the [`HookChain`]'s `select`
//! filters.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::ready;
use futures::stream::{StreamExt, TryStreamExt};

use crate::commit::{Checkpoint, Commit, CommitAttempt, StreamRevision};
use crate::hook::HookChain;
use crate::persist::{
    AccessSnapshots, CommitStream, PersistCommits, PersistError, StreamHeadStream,
};
use crate::snapshot::Snapshot;

/// Hook-aware decorator around a persistence backend.
///
/// Only [`get_since`][PersistCommits::get_since] and
/// [`get_range`][PersistCommits::get_range] are intercepted: every
/// yielded commit runs through the `select` chain and is re-yielded or
/// dropped. All other operations pass through unchanged; in particular
/// `commit` is not intercepted, so that duplicate and concurrency errors
/// never fire hooks.
pub struct Hooked<P, Id, T> {
    inner: Arc<P>,
    hooks: HookChain<Id, T>,
}

impl<P, Id, T> Hooked<P, Id, T> {
    /// Decorates the given backend with the given chain.
    pub fn new(inner: Arc<P>, hooks: HookChain<Id, T>) -> Self {
        Self { inner, hooks }
    }
}

impl<P, Id, T> Clone for Hooked<P, Id, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            hooks: self.hooks.clone(),
        }
    }
}

impl<P, Id, T> Hooked<P, Id, T>
where
    Id: Send + Sync,
    T: Send + Sync,
{
    fn filter<'a>(&self, commits: CommitStream<'a, Id, T>) -> CommitStream<'a, Id, T>
    where
        Id: 'a,
        T: 'a,
    {
        let hooks = self.hooks.clone();
        commits
            .try_filter_map(move |commit| ready(Ok(hooks.select(commit))))
            .boxed()
    }
}

#[async_trait]
impl<P, Id, T> PersistCommits<Id, T> for Hooked<P, Id, T>
where
    P: PersistCommits<Id, T>,
    Id: Send + Sync,
    T: Send + Sync,
{
    async fn initialize(&self) -> Result<(), PersistError> {
        self.inner.initialize().await
    }

    fn get_between(
        &self,
        stream_id: &Id,
        min_revision: StreamRevision,
        max_revision: StreamRevision,
    ) -> CommitStream<'_, Id, T> {
        self.inner.get_between(stream_id, min_revision, max_revision)
    }

    fn get_since(&self, instant: DateTime<Utc>) -> CommitStream<'_, Id, T> {
        self.filter(self.inner.get_since(instant))
    }

    fn get_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> CommitStream<'_, Id, T> {
        self.filter(self.inner.get_range(start, end))
    }

    fn get_from_checkpoint(&self, checkpoint: Checkpoint) -> CommitStream<'_, Id, T> {
        self.inner.get_from_checkpoint(checkpoint)
    }

    async fn commit(&self, attempt: CommitAttempt<Id, T>) -> Result<Commit<Id, T>, PersistError> {
        self.inner.commit(attempt).await
    }

    fn get_undispatched(&self) -> CommitStream<'_, Id, T> {
        self.inner.get_undispatched()
    }

    async fn mark_dispatched(&self, commit: &Commit<Id, T>) -> Result<(), PersistError> {
        self.inner.mark_dispatched(commit).await
    }
}

#[async_trait]
impl<P, Id, T, S> AccessSnapshots<Id, S> for Hooked<P, Id, T>
where
    P: AccessSnapshots<Id, S>,
    Id: Send + Sync + 'static,
    T: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    async fn get_snapshot(
        &self,
        stream_id: &Id,
        max_revision: StreamRevision,
    ) -> Result<Option<Snapshot<Id, S>>, PersistError> {
        self.inner.get_snapshot(stream_id, max_revision).await
    }

    async fn add_snapshot(&self, snapshot: Snapshot<Id, S>) -> Result<bool, PersistError> {
        self.inner.add_snapshot(snapshot).await
    }

    fn get_streams_to_snapshot(&self, threshold: u64) -> StreamHeadStream<'_, Id> {
        self.inner.get_streams_to_snapshot(threshold)
    }
}
