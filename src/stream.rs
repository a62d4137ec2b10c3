//! Contains the [`OptimisticEventStream`], the per-stream mutable
//! working copy that mediates reads from and writes to persistence
//! under optimistic-concurrency rules.

use std::collections::HashSet;

use chrono::Utc;
use futures::TryStreamExt;

use crate::commit::{Commit, CommitAttempt, CommitId, CommitSequence, StreamRevision};
use crate::message::{EventMessage, Headers};
use crate::persist::{CommitStream, PersistError};
use crate::store::{CommitError, CommitEvents, OpenError};

/// The populated view of a stream's persisted history: loaded events,
/// the identifiers of every commit seen, and the current head position.
#[derive(Debug)]
struct Working<T> {
    committed: Vec<EventMessage<T>>,
    identifiers: HashSet<CommitId>,
    stream_revision: StreamRevision,
    commit_sequence: CommitSequence,
}

impl<T> Default for Working<T> {
    fn default() -> Self {
        Self {
            committed: Vec::default(),
            identifiers: HashSet::default(),
            stream_revision: 0,
            commit_sequence: 0,
        }
    }
}

impl<T> Working<T>
where
    T: Clone,
{
    /// Merges one commit into the view, honoring the `[min, max]`
    /// revision window. Returns `false` when the window is exhausted and
    /// population must stop entirely.
    fn apply<Id>(&mut self, commit: &Commit<Id, T>, min: StreamRevision, max: StreamRevision) -> bool {
        self.identifiers.insert(commit.commit_id);
        self.commit_sequence = commit.commit_sequence;

        let mut current = commit.starting_revision();
        for event in &commit.events {
            if current > max {
                return false;
            }
            if current >= min {
                self.committed.push(event.clone());
                self.stream_revision = current;
            }
            current += 1;
        }

        true
    }

    /// Drains the single-pass commit sequence into the view, returning
    /// how many commits were consumed.
    async fn populate<Id>(
        &mut self,
        min: StreamRevision,
        max: StreamRevision,
        mut commits: CommitStream<'_, Id, T>,
    ) -> Result<usize, PersistError> {
        let mut seen = 0;
        while let Some(commit) = commits.try_next().await? {
            seen += 1;
            if !self.apply(&commit, min, max) {
                break;
            }
        }

        Ok(seen)
    }
}

/// A per-stream working copy of an append-only commit history.
///
/// The stream exclusively owns its staged events and headers until
/// [`commit_changes`][OptimisticEventStream::commit_changes] succeeds;
/// it is not thread-safe and is meant to be owned by one logical task at
/// a time.
#[derive(Debug)]
pub struct OptimisticEventStream<Id, T, S> {
    store: S,
    stream_id: Id,
    working: Working<T>,
    uncommitted: Vec<EventMessage<T>>,
    uncommitted_headers: Headers,
}

impl<Id, T, S> OptimisticEventStream<Id, T, S>
where
    Id: Clone + Send + Sync,
    T: Clone + Send + Sync,
    S: CommitEvents<Id, T>,
{
    /// A fresh stream with no prior history: revision 0, sequence 0.
    pub(crate) fn new(store: S, stream_id: Id) -> Self {
        Self {
            store,
            stream_id,
            working: Working::default(),
            uncommitted: Vec::default(),
            uncommitted_headers: Headers::default(),
        }
    }

    /// Loads the stream from the commits whose events fall within
    /// `[min_revision, max_revision]`.
    ///
    /// # Errors
    ///
    /// Returns [`OpenError::StreamNotFound`] when `min_revision > 0` and
    /// persistence holds no matching commits.
    pub(crate) async fn open(
        store: S,
        stream_id: Id,
        min_revision: StreamRevision,
        max_revision: StreamRevision,
    ) -> Result<Self, OpenError> {
        let mut stream = Self::new(store, stream_id);

        let seen = {
            let commits = stream
                .store
                .get_between(&stream.stream_id, min_revision, max_revision);
            stream
                .working
                .populate(min_revision, max_revision, commits)
                .await?
        };

        if min_revision > 0 && seen == 0 {
            return Err(OpenError::StreamNotFound);
        }

        Ok(stream)
    }

    /// Loads the stream on top of a snapshot taken at
    /// `snapshot_revision`: only events past the snapshot are applied,
    /// and the head starts at the snapshot revision even when every
    /// loaded commit falls at or below it.
    pub(crate) async fn open_from_snapshot(
        store: S,
        stream_id: Id,
        snapshot_revision: StreamRevision,
        max_revision: StreamRevision,
    ) -> Result<Self, OpenError> {
        let mut stream = Self::new(store, stream_id);

        {
            let commits = stream
                .store
                .get_between(&stream.stream_id, snapshot_revision, max_revision);
            stream
                .working
                .populate(snapshot_revision + 1, max_revision, commits)
                .await?;
        }

        stream.working.stream_revision = stream.working.stream_revision.max(snapshot_revision);

        Ok(stream)
    }

    /// The identifier of the stream.
    pub fn stream_id(&self) -> &Id {
        &self.stream_id
    }

    /// The revision of the latest loaded event, 0 for a fresh stream.
    pub fn stream_revision(&self) -> StreamRevision {
        self.working.stream_revision
    }

    /// The sequence of the latest loaded commit, 0 for a fresh stream.
    pub fn commit_sequence(&self) -> CommitSequence {
        self.working.commit_sequence
    }

    /// Read-only view of the loaded events.
    pub fn committed_events(&self) -> &[EventMessage<T>] {
        &self.working.committed
    }

    /// Read-only view of the staged, not yet committed events.
    pub fn uncommitted_events(&self) -> &[EventMessage<T>] {
        &self.uncommitted
    }

    /// Read-only view of the headers staged for the next commit.
    pub fn uncommitted_headers(&self) -> &Headers {
        &self.uncommitted_headers
    }

    /// Stages a header for the next commit.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.uncommitted_headers.insert(key.into(), value.into());
    }

    /// Stages an event for the next commit.
    pub fn add(&mut self, event: impl Into<EventMessage<T>>) {
        self.uncommitted.push(event.into());
    }

    /// Drops all staged events and headers.
    pub fn clear_changes(&mut self) {
        self.uncommitted.clear();
        self.uncommitted_headers.clear();
    }

    /// Persists the staged events as a single commit identified by
    /// `commit_id`, advancing the working copy on success.
    ///
    /// Returns `Ok(None)` when there was nothing to commit, or when a
    /// pre-commit hook vetoed the write.
    ///
    /// # Errors
    ///
    /// - [`CommitError::DuplicateCommit`] when `commit_id` was already
    ///   seen on this stream; persistence is not called.
    /// - [`CommitError::Conflict`] when another writer advanced the
    ///   head. The working copy is rebased onto the newly discovered
    ///   commits before the error is returned, and the staged events are
    ///   retained: calling `commit_changes` again retries on top of the
    ///   advanced head.
    pub async fn commit_changes(
        &mut self,
        commit_id: CommitId,
    ) -> Result<Option<Commit<Id, T>>, CommitError<Id, T>> {
        if self.working.identifiers.contains(&commit_id) {
            return Err(CommitError::DuplicateCommit);
        }
        if self.uncommitted.is_empty() {
            return Ok(None);
        }

        let attempt = self.build_attempt(commit_id);

        match self.store.commit(attempt).await {
            Ok(Some(commit)) => {
                self.working.apply(&commit, 0, StreamRevision::MAX);
                self.clear_changes();
                Ok(Some(commit))
            }
            Ok(None) => {
                // Vetoed by a pre-commit hook: the write was silently
                // dropped, so the staged state is gone as well.
                self.clear_changes();
                Ok(None)
            }
            Err(CommitError::Conflict { conflicting }) => {
                tracing::debug!(
                    newly_discovered = conflicting.len(),
                    "commit conflicted, rebasing stream onto the advanced head"
                );

                let min = self.working.stream_revision + 1;
                for commit in &conflicting {
                    if !self.working.apply(commit, min, StreamRevision::MAX) {
                        break;
                    }
                }

                Err(CommitError::Conflict { conflicting })
            }
            Err(err) => Err(err),
        }
    }

    fn build_attempt(&self, commit_id: CommitId) -> CommitAttempt<Id, T> {
        CommitAttempt {
            stream_id: self.stream_id.clone(),
            stream_revision: self.working.stream_revision + self.uncommitted.len() as u64,
            commit_id,
            commit_sequence: self.working.commit_sequence + 1,
            commit_stamp: Utc::now(),
            headers: self.uncommitted_headers.clone(),
            events: self.uncommitted.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use futures::stream::{iter, StreamExt};
    use parking_lot::Mutex;
    use uuid::Uuid;

    use super::*;

    type Id = &'static str;
    type Payload = &'static str;

    const STREAM_ID: Id = "stream:test";

    fn commit(
        sequence: CommitSequence,
        revision: StreamRevision,
        events: Vec<Payload>,
        checkpoint: u64,
    ) -> Commit<Id, Payload> {
        Commit {
            stream_id: STREAM_ID,
            stream_revision: revision,
            commit_id: Uuid::new_v4(),
            commit_sequence: sequence,
            commit_stamp: Utc::now(),
            headers: Headers::default(),
            events: events.into_iter().map(EventMessage::new).collect(),
            checkpoint,
        }
    }

    /// Test double for the event store: serves a fixed history and
    /// records every commit attempt it receives.
    struct FakeStore {
        history: Vec<Commit<Id, Payload>>,
        reads: AtomicUsize,
        attempts: Mutex<Vec<CommitAttempt<Id, Payload>>>,
        conflict_with: Mutex<Option<Vec<Commit<Id, Payload>>>>,
    }

    impl FakeStore {
        fn new(history: Vec<Commit<Id, Payload>>) -> Arc<Self> {
            Arc::new(Self {
                history,
                reads: AtomicUsize::new(0),
                attempts: Mutex::new(Vec::new()),
                conflict_with: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl CommitEvents<Id, Payload> for Arc<FakeStore> {
        fn get_between(
            &self,
            _stream_id: &Id,
            min_revision: StreamRevision,
            max_revision: StreamRevision,
        ) -> CommitStream<'_, Id, Payload> {
            self.reads.fetch_add(1, Ordering::SeqCst);

            let commits: Vec<_> = self
                .history
                .iter()
                .filter(|commit| {
                    commit.stream_revision >= min_revision
                        && commit.starting_revision() <= max_revision
                })
                .cloned()
                .collect();

            iter(commits).map(Ok).boxed()
        }

        async fn commit(
            &self,
            attempt: CommitAttempt<Id, Payload>,
        ) -> Result<Option<Commit<Id, Payload>>, CommitError<Id, Payload>> {
            self.attempts.lock().push(attempt.clone());

            if let Some(conflicting) = self.conflict_with.lock().take() {
                return Err(CommitError::Conflict { conflicting });
            }

            Ok(Some(Commit::from_attempt(attempt, 1)))
        }
    }

    #[tokio::test]
    async fn fresh_commit_persists_a_first_revision() {
        let store = FakeStore::new(Vec::new());
        let mut stream = OptimisticEventStream::new(store.clone(), STREAM_ID);

        stream.add("a");
        let commit_id = Uuid::new_v4();
        let persisted = stream
            .commit_changes(commit_id)
            .await
            .expect("commit should not fail")
            .expect("a commit should have been persisted");

        let attempts = store.attempts.lock();
        assert_eq!(1, attempts.len());
        assert_eq!(1, attempts[0].stream_revision);
        assert_eq!(1, attempts[0].commit_sequence);
        assert_eq!(vec![EventMessage::new("a")], attempts[0].events);

        assert_eq!(commit_id, persisted.commit_id);
        assert!(stream.uncommitted_events().is_empty());
        assert_eq!(&[EventMessage::new("a")][..], stream.committed_events());
        assert_eq!(1, stream.stream_revision());
    }

    #[tokio::test]
    async fn opening_an_empty_stream_above_revision_zero_fails() {
        let store = FakeStore::new(Vec::new());

        let error = OptimisticEventStream::open(store, STREAM_ID, 1, StreamRevision::MAX)
            .await
            .expect_err("the stream does not exist");

        assert!(matches!(error, OpenError::StreamNotFound));
    }

    #[tokio::test]
    async fn conflicting_commit_rebases_and_allows_a_retry() {
        let store = FakeStore::new(vec![commit(1, 1, vec!["a"], 1)]);
        let mut stream =
            OptimisticEventStream::open(store.clone(), STREAM_ID, 0, StreamRevision::MAX)
                .await
                .expect("open should not fail");
        assert_eq!(1, stream.stream_revision());

        // Another writer got revision 2 in first.
        *store.conflict_with.lock() = Some(vec![commit(2, 2, vec!["x"], 2)]);

        stream.add("b");
        let error = stream
            .commit_changes(Uuid::new_v4())
            .await
            .expect_err("the first attempt conflicts");
        match error {
            CommitError::Conflict { conflicting } => assert_eq!(1, conflicting.len()),
            other => panic!("expected a conflict, received: {other:?}"),
        }

        // The stream rebased onto the winner and kept the staged event.
        assert_eq!(2, stream.stream_revision());
        assert_eq!(2, stream.commit_sequence());
        assert_eq!(1, stream.uncommitted_events().len());

        let persisted = stream
            .commit_changes(Uuid::new_v4())
            .await
            .expect("the retry should not fail")
            .expect("a commit should have been persisted");
        assert_eq!(3, persisted.stream_revision);
        assert_eq!(3, persisted.commit_sequence);
    }

    #[tokio::test]
    async fn duplicate_commit_ids_fail_without_reaching_persistence() {
        let history = vec![commit(1, 1, vec!["a"], 1)];
        let duplicate_id = history[0].commit_id;
        let store = FakeStore::new(history);

        let mut stream =
            OptimisticEventStream::open(store.clone(), STREAM_ID, 0, StreamRevision::MAX)
                .await
                .expect("open should not fail");

        stream.add("x");
        let error = stream
            .commit_changes(duplicate_id)
            .await
            .expect_err("the commit id has already been used");

        assert!(matches!(error, CommitError::DuplicateCommit));
        assert!(store.attempts.lock().is_empty());
    }

    #[tokio::test]
    async fn opening_from_a_snapshot_at_head_consumes_history_exactly_once() {
        // One commit at the snapshot revision: all of its events fall at
        // or below the snapshot, so nothing is applied.
        let store = FakeStore::new(vec![commit(15, 42, vec!["a"], 1)]);

        let stream = OptimisticEventStream::open_from_snapshot(
            store.clone(),
            STREAM_ID,
            42,
            StreamRevision::MAX,
        )
        .await
        .expect("open should not fail");

        assert_eq!(42, stream.stream_revision());
        assert_eq!(15, stream.commit_sequence());
        assert!(stream.committed_events().is_empty());
        assert_eq!(1, store.reads.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn snapshot_open_applies_only_events_past_the_snapshot() {
        // A commit straddling the snapshot: events at revisions 42 and 43.
        let store = FakeStore::new(vec![commit(15, 43, vec!["a", "b"], 1)]);

        let stream = OptimisticEventStream::open_from_snapshot(
            store.clone(),
            STREAM_ID,
            42,
            StreamRevision::MAX,
        )
        .await
        .expect("open should not fail");

        assert_eq!(43, stream.stream_revision());
        assert_eq!(&[EventMessage::new("b")][..], stream.committed_events());
    }

    #[tokio::test]
    async fn committing_nothing_is_a_no_op() {
        let store = FakeStore::new(Vec::new());
        let mut stream = OptimisticEventStream::new(store.clone(), STREAM_ID);

        let persisted = stream
            .commit_changes(Uuid::new_v4())
            .await
            .expect("an empty commit is a no-op");

        assert!(persisted.is_none());
        assert!(store.attempts.lock().is_empty());
    }

    #[tokio::test]
    async fn populate_stops_at_the_maximum_revision() {
        let store = FakeStore::new(vec![
            commit(1, 2, vec!["a", "b"], 1),
            commit(2, 4, vec!["c", "d"], 2),
            commit(3, 5, vec!["e"], 3),
        ]);

        let stream = OptimisticEventStream::open(store, STREAM_ID, 0, 3)
            .await
            .expect("open should not fail");

        assert_eq!(3, stream.stream_revision());
        assert_eq!(3, stream.committed_events().len());
        assert_eq!(2, stream.commit_sequence());
    }

    #[tokio::test]
    async fn staged_headers_travel_with_the_attempt() {
        let store = FakeStore::new(Vec::new());
        let mut stream = OptimisticEventStream::new(store.clone(), STREAM_ID);

        stream.add("a");
        stream.set_header("origin", "import");
        stream
            .commit_changes(Uuid::new_v4())
            .await
            .expect("commit should not fail");

        let attempts = store.attempts.lock();
        assert_eq!(
            Some(&serde_json::Value::from("import")),
            attempts[0].headers.get("origin")
        );
        assert!(stream.uncommitted_headers().is_empty());
    }
}
