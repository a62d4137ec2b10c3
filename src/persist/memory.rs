//! In-memory implementation of the persistence contract, backed by a
//! thread-safe commit log behind a [`parking_lot::RwLock`].
//!
//! Used by the crate's own test-suite and useful as a reference for the
//! contract semantics adapters must honor.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{iter, StreamExt};
use parking_lot::RwLock;

use crate::commit::{Checkpoint, Commit, CommitAttempt, StreamRevision};
use crate::persist::{
    AccessSnapshots, CommitStream, PersistCommits, PersistError, StreamHeadStream,
};
use crate::snapshot::{Snapshot, StreamHead};

#[derive(Debug)]
struct Record<Id, T> {
    commit: Commit<Id, T>,
    dispatched: bool,
}

#[derive(Debug)]
struct Backend<Id, T, S> {
    commits: Vec<Record<Id, T>>,
    heads: HashMap<Id, StreamHead<Id>>,
    snapshots: HashMap<Id, Vec<Snapshot<Id, S>>>,
    last_checkpoint: Checkpoint,
}

impl<Id, T, S> Default for Backend<Id, T, S> {
    fn default() -> Self {
        Self {
            commits: Vec::default(),
            heads: HashMap::default(),
            snapshots: HashMap::default(),
            last_checkpoint: 0,
        }
    }
}

/// In-memory persistence backend.
///
/// Commits live in a single insertion-ordered log, which makes the
/// checkpoint allocation trivially monotonic across streams.
#[derive(Debug)]
pub struct InMemoryPersistence<Id, T, S = serde_json::Value> {
    backend: Arc<RwLock<Backend<Id, T, S>>>,
    initialized: Arc<AtomicU32>,
}

impl<Id, T, S> Default for InMemoryPersistence<Id, T, S> {
    fn default() -> Self {
        Self {
            backend: Arc::new(RwLock::new(Backend::default())),
            initialized: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl<Id, T, S> Clone for InMemoryPersistence<Id, T, S> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            initialized: self.initialized.clone(),
        }
    }
}

fn boxed_commits<'a, Id, T>(commits: Vec<Commit<Id, T>>) -> CommitStream<'a, Id, T>
where
    Id: Send + Sync + 'a,
    T: Send + Sync + 'a,
{
    iter(commits).map(Ok).boxed()
}

#[async_trait]
impl<Id, T, S> PersistCommits<Id, T> for InMemoryPersistence<Id, T, S>
where
    Id: Clone + Eq + Hash + Send + Sync,
    T: Clone + Send + Sync,
    S: Send + Sync,
{
    async fn initialize(&self) -> Result<(), PersistError> {
        // Only the first caller across all tasks runs the setup; there is
        // nothing to set up in memory, so the guard is the whole routine.
        self.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_between(
        &self,
        stream_id: &Id,
        min_revision: StreamRevision,
        max_revision: StreamRevision,
    ) -> CommitStream<'_, Id, T> {
        let backend = self.backend.read();

        let commits = backend
            .commits
            .iter()
            .map(|record| &record.commit)
            .filter(|commit| {
                commit.stream_id == *stream_id
                    && commit.stream_revision >= min_revision
                    && commit.starting_revision() <= max_revision
            })
            .cloned()
            .collect();

        boxed_commits(commits)
    }

    fn get_since(&self, instant: DateTime<Utc>) -> CommitStream<'_, Id, T> {
        let backend = self.backend.read();

        let mut commits: Vec<_> = backend
            .commits
            .iter()
            .map(|record| &record.commit)
            .filter(|commit| commit.commit_stamp >= instant)
            .cloned()
            .collect();
        commits.sort_by(|a, b| {
            a.commit_stamp
                .cmp(&b.commit_stamp)
                .then(a.checkpoint.cmp(&b.checkpoint))
        });

        boxed_commits(commits)
    }

    fn get_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> CommitStream<'_, Id, T> {
        let backend = self.backend.read();

        let mut commits: Vec<_> = backend
            .commits
            .iter()
            .map(|record| &record.commit)
            .filter(|commit| commit.commit_stamp >= start && commit.commit_stamp < end)
            .cloned()
            .collect();
        commits.sort_by(|a, b| {
            a.commit_stamp
                .cmp(&b.commit_stamp)
                .then(a.checkpoint.cmp(&b.checkpoint))
        });

        boxed_commits(commits)
    }

    fn get_from_checkpoint(&self, checkpoint: Checkpoint) -> CommitStream<'_, Id, T> {
        let backend = self.backend.read();

        let commits = backend
            .commits
            .iter()
            .map(|record| &record.commit)
            .filter(|commit| commit.checkpoint > checkpoint)
            .cloned()
            .collect();

        boxed_commits(commits)
    }

    async fn commit(&self, attempt: CommitAttempt<Id, T>) -> Result<Commit<Id, T>, PersistError> {
        let mut backend = self.backend.write();

        let head = backend
            .commits
            .iter()
            .map(|record| &record.commit)
            .filter(|commit| commit.stream_id == attempt.stream_id)
            .fold((0, 0), |_, commit| {
                (commit.stream_revision, commit.commit_sequence)
            });
        let (head_revision, head_sequence) = head;

        let duplicate = backend.commits.iter().any(|record| {
            record.commit.stream_id == attempt.stream_id
                && record.commit.commit_id == attempt.commit_id
        });
        if duplicate {
            return Err(PersistError::DuplicateCommit);
        }

        if attempt.commit_sequence != head_sequence + 1
            || attempt.starting_revision() != head_revision + 1
        {
            return Err(PersistError::Conflict);
        }

        backend.last_checkpoint += 1;
        let checkpoint = backend.last_checkpoint;
        let commit = Commit::from_attempt(attempt, checkpoint);

        backend
            .heads
            .entry(commit.stream_id.clone())
            .and_modify(|h| h.head_revision = commit.stream_revision)
            .or_insert_with(|| StreamHead {
                stream_id: commit.stream_id.clone(),
                stream_name: None,
                head_revision: commit.stream_revision,
                snapshot_revision: 0,
            });

        backend.commits.push(Record {
            commit: commit.clone(),
            dispatched: false,
        });

        Ok(commit)
    }

    fn get_undispatched(&self) -> CommitStream<'_, Id, T> {
        let backend = self.backend.read();

        let commits = backend
            .commits
            .iter()
            .filter(|record| !record.dispatched)
            .map(|record| record.commit.clone())
            .collect();

        boxed_commits(commits)
    }

    async fn mark_dispatched(&self, commit: &Commit<Id, T>) -> Result<(), PersistError> {
        let mut backend = self.backend.write();

        if let Some(record) = backend.commits.iter_mut().find(|record| {
            record.commit.stream_id == commit.stream_id
                && record.commit.commit_id == commit.commit_id
        }) {
            record.dispatched = true;
        }

        Ok(())
    }
}

#[async_trait]
impl<Id, T, S> AccessSnapshots<Id, S> for InMemoryPersistence<Id, T, S>
where
    Id: Clone + Eq + Hash + Send + Sync,
    T: Send + Sync,
    S: Clone + Send + Sync,
{
    async fn get_snapshot(
        &self,
        stream_id: &Id,
        max_revision: StreamRevision,
    ) -> Result<Option<Snapshot<Id, S>>, PersistError> {
        let backend = self.backend.read();

        Ok(backend
            .snapshots
            .get(stream_id)
            .and_then(|snapshots| {
                snapshots
                    .iter()
                    .rfind(|snapshot| snapshot.stream_revision <= max_revision)
            })
            .cloned())
    }

    async fn add_snapshot(&self, snapshot: Snapshot<Id, S>) -> Result<bool, PersistError> {
        let mut backend = self.backend.write();
        let backend = &mut *backend;

        let snapshots = backend
            .snapshots
            .entry(snapshot.stream_id.clone())
            .or_default();

        let taken = snapshots
            .iter()
            .any(|existing| existing.stream_revision == snapshot.stream_revision);
        if taken {
            return Ok(false);
        }

        let stream_id = snapshot.stream_id.clone();
        let stream_revision = snapshot.stream_revision;

        snapshots.push(snapshot);
        snapshots.sort_by_key(|snapshot| snapshot.stream_revision);

        backend
            .heads
            .entry(stream_id.clone())
            .and_modify(|head| {
                head.snapshot_revision = head.snapshot_revision.max(stream_revision);
            })
            .or_insert_with(|| StreamHead {
                stream_id,
                stream_name: None,
                head_revision: stream_revision,
                snapshot_revision: stream_revision,
            });

        Ok(true)
    }

    fn get_streams_to_snapshot(&self, threshold: u64) -> StreamHeadStream<'_, Id> {
        let backend = self.backend.read();

        let heads: Vec<_> = backend
            .heads
            .values()
            .filter(|head| head.unsnapshotted() >= threshold)
            .cloned()
            .collect();

        iter(heads).map(Ok).boxed()
    }
}
