//! Delivery of newly persisted commits to a downstream consumer, with
//! the undispatched backlog caught up at startup.
//!
//! Two scheduler variants share the contract "consume each persisted
//! commit exactly once, mark it dispatched on success":
//! [`ImmediateDispatchScheduler`] delivers inline on the committer's
//! task, [`QueuedDispatchScheduler`] hands commits to a single
//! background worker.

use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::commit::Commit;
use crate::persist::{PersistCommits, PersistError};

/// The downstream consumer of persisted commits, typically a projection
/// or integration publisher.
#[async_trait]
pub trait Dispatcher<Id, T>: Send + Sync {
    /// Delivers one commit. A returned error leaves the commit
    /// undispatched; delivery is retried at the next scheduler startup,
    /// so consumers must be idempotent.
    async fn dispatch(&self, commit: &Commit<Id, T>) -> anyhow::Result<()>;
}

/// All possible error types returned by the dispatch schedulers.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The consumer failed to process a commit.
    #[error("failed to deliver a commit to the consumer: {0}")]
    Deliver(#[source] anyhow::Error),

    /// Reading or marking commits failed in the persistence layer.
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// The background worker is gone and the queue no longer accepts
    /// commits.
    #[error("the dispatch worker is no longer running")]
    WorkerStopped,
}

/// Scheduling surface the [`EventStore`][crate::store::EventStore]
/// invokes after every successful commit.
#[async_trait]
pub trait ScheduleDispatch<Id, T>: Send + Sync {
    /// Takes responsibility for delivering the commit and marking it
    /// dispatched.
    async fn schedule(&self, commit: Commit<Id, T>) -> Result<(), DispatchError>;
}

/// Dispatches inline, on the task that committed.
///
/// Construction initializes persistence and drains the undispatched
/// backlog. A delivery failure after a commit propagates to the caller
/// of the commit: the commit is durable but unmarked, and the next
/// startup retries it.
pub struct ImmediateDispatchScheduler<P, D> {
    persistence: Arc<P>,
    dispatcher: D,
}

impl<P, D> ImmediateDispatchScheduler<P, D> {
    /// Initializes persistence, catches up the undispatched backlog and
    /// returns the ready scheduler.
    ///
    /// # Errors
    ///
    /// Fails when initialization, a backlog read, or a backlog delivery
    /// fails.
    pub async fn start<Id, T>(persistence: Arc<P>, dispatcher: D) -> Result<Self, DispatchError>
    where
        P: PersistCommits<Id, T>,
        D: Dispatcher<Id, T>,
        Id: Send + Sync,
        T: Send + Sync,
    {
        persistence.initialize().await?;

        let scheduler = Self {
            persistence,
            dispatcher,
        };

        {
            let mut undispatched = scheduler.persistence.get_undispatched();
            while let Some(commit) = undispatched.try_next().await? {
                scheduler
                    .dispatcher
                    .dispatch(&commit)
                    .await
                    .map_err(DispatchError::Deliver)?;
                scheduler.persistence.mark_dispatched(&commit).await?;
            }
        }

        Ok(scheduler)
    }
}

#[async_trait]
impl<P, D, Id, T> ScheduleDispatch<Id, T> for ImmediateDispatchScheduler<P, D>
where
    P: PersistCommits<Id, T>,
    D: Dispatcher<Id, T>,
    Id: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    async fn schedule(&self, commit: Commit<Id, T>) -> Result<(), DispatchError> {
        self.dispatcher
            .dispatch(&commit)
            .await
            .map_err(DispatchError::Deliver)?;
        self.persistence.mark_dispatched(&commit).await?;
        Ok(())
    }
}

/// Dispatches through an unbounded in-memory queue owned by a single
/// background worker, preserving per-stream order.
///
/// Delivery failures are logged and the commit is left undispatched for
/// the next startup; the committer is never blocked on the consumer.
pub struct QueuedDispatchScheduler<Id, T> {
    #[allow(clippy::type_complexity)] // It is a complex type but still readable.
    sender: Mutex<Option<mpsc::UnboundedSender<Commit<Id, T>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<Id, T> QueuedDispatchScheduler<Id, T>
where
    Id: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Initializes persistence, enqueues the undispatched backlog ahead
    /// of any live commit, and spawns the worker.
    ///
    /// # Errors
    ///
    /// Fails when initialization or the backlog read fails.
    pub async fn start<P, D>(persistence: Arc<P>, dispatcher: D) -> Result<Self, DispatchError>
    where
        P: PersistCommits<Id, T> + 'static,
        D: Dispatcher<Id, T> + 'static,
    {
        persistence.initialize().await?;

        let (sender, mut receiver) = mpsc::unbounded_channel();

        {
            let mut undispatched = persistence.get_undispatched();
            while let Some(commit) = undispatched.try_next().await? {
                let _ = sender.send(commit);
            }
        }

        let worker = tokio::spawn(async move {
            while let Some(commit) = receiver.recv().await {
                if let Err(error) = dispatcher.dispatch(&commit).await {
                    tracing::error!(
                        %error,
                        "failed to dispatch commit, leaving it undispatched for the next startup"
                    );
                    continue;
                }
                if let Err(error) = persistence.mark_dispatched(&commit).await {
                    tracing::error!(%error, "failed to mark a commit as dispatched");
                }
            }
        });

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stops accepting new commits and waits for the worker to drain
    /// the queue.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());

        let worker = { self.worker.lock().take() };
        if let Some(worker) = worker {
            if let Err(error) = worker.await {
                tracing::error!(%error, "dispatch worker terminated abnormally");
            }
        }
    }
}

#[async_trait]
impl<Id, T> ScheduleDispatch<Id, T> for QueuedDispatchScheduler<Id, T>
where
    Id: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    async fn schedule(&self, commit: Commit<Id, T>) -> Result<(), DispatchError> {
        let sender = { self.sender.lock().clone() };

        match sender {
            Some(sender) => sender.send(commit).map_err(|_| DispatchError::WorkerStopped),
            None => Err(DispatchError::WorkerStopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::commit::{CommitAttempt, CommitId};
    use crate::message::{EventMessage, Headers};
    use crate::persist::memory::InMemoryPersistence;
    use crate::store::EventStore;

    type Id = &'static str;
    type Payload = &'static str;
    type Persistence = InMemoryPersistence<Id, Payload>;

    fn attempt(
        stream_id: Id,
        sequence: u64,
        revision: u64,
        event: Payload,
    ) -> CommitAttempt<Id, Payload> {
        CommitAttempt {
            stream_id,
            stream_revision: revision,
            commit_id: Uuid::new_v4(),
            commit_sequence: sequence,
            commit_stamp: Utc::now(),
            headers: Headers::default(),
            events: vec![EventMessage::new(event)],
        }
    }

    #[derive(Clone, Default)]
    struct Recording {
        delivered: Arc<Mutex<Vec<CommitId>>>,
        fail: bool,
    }

    #[async_trait]
    impl Dispatcher<Id, Payload> for Recording {
        async fn dispatch(&self, commit: &Commit<Id, Payload>) -> anyhow::Result<()> {
            if self.fail {
                return Err(anyhow!("consumer is down"));
            }
            self.delivered.lock().push(commit.commit_id);
            Ok(())
        }
    }

    async fn undispatched_count(persistence: &Persistence) -> usize {
        persistence
            .get_undispatched()
            .try_collect::<Vec<_>>()
            .await
            .expect("read should not fail")
            .len()
    }

    #[tokio::test]
    async fn startup_catches_up_the_undispatched_backlog() {
        let persistence = Arc::new(Persistence::default());
        persistence
            .commit(attempt("stream:a", 1, 1, "a1"))
            .await
            .expect("commit should not fail");
        persistence
            .commit(attempt("stream:b", 1, 1, "b1"))
            .await
            .expect("commit should not fail");

        let recording = Recording::default();
        ImmediateDispatchScheduler::start(persistence.clone(), recording.clone())
            .await
            .expect("startup should not fail");

        assert_eq!(2, recording.delivered.lock().len());
        assert_eq!(0, undispatched_count(&persistence).await);
    }

    #[tokio::test]
    async fn commits_are_dispatched_and_marked_inline() {
        let persistence = Arc::new(Persistence::default());

        let recording = Recording::default();
        let scheduler = ImmediateDispatchScheduler::start(persistence.clone(), recording.clone())
            .await
            .expect("startup should not fail");

        let store: EventStore<_, Id, Payload> = EventStore::new(persistence.as_ref().clone())
            .with_scheduler(Arc::new(scheduler));

        let mut stream = store.create_stream("stream:test");
        stream.add("a");
        let persisted = stream
            .commit_changes(Uuid::new_v4())
            .await
            .expect("commit should not fail")
            .expect("a commit should have been persisted");

        assert_eq!(vec![persisted.commit_id], *recording.delivered.lock());
    }

    #[tokio::test]
    async fn a_failing_consumer_propagates_to_the_committer() {
        let persistence = Arc::new(Persistence::default());

        let scheduler = ImmediateDispatchScheduler::start(
            persistence.clone(),
            Recording {
                fail: true,
                ..Recording::default()
            },
        )
        .await
        .expect("an empty backlog cannot fail");

        let store: EventStore<_, Id, Payload> = EventStore::new(persistence.as_ref().clone())
            .with_scheduler(Arc::new(scheduler));

        let mut stream = store.create_stream("stream:test");
        stream.add("a");
        let error = stream
            .commit_changes(Uuid::new_v4())
            .await
            .expect_err("dispatch fails");

        assert!(matches!(
            error,
            crate::store::CommitError::Dispatch(_)
        ));

        // The commit is durable but stays undispatched for the next
        // startup to retry.
        assert_eq!(1, undispatched_count(&persistence).await);
    }

    #[tokio::test]
    async fn queued_scheduler_preserves_order_and_drains_on_shutdown() {
        let persistence = Arc::new(Persistence::default());

        // A backlog commit persisted before the scheduler starts.
        let backlog = persistence
            .commit(attempt("stream:test", 1, 1, "a"))
            .await
            .expect("commit should not fail");

        let recording = Recording::default();
        let scheduler = QueuedDispatchScheduler::start(persistence.clone(), recording.clone())
            .await
            .expect("startup should not fail");

        let live_one = persistence
            .commit(attempt("stream:test", 2, 2, "b"))
            .await
            .expect("commit should not fail");
        let live_two = persistence
            .commit(attempt("stream:test", 3, 3, "c"))
            .await
            .expect("commit should not fail");

        scheduler
            .schedule(live_one.clone())
            .await
            .expect("scheduling should not fail");
        scheduler
            .schedule(live_two.clone())
            .await
            .expect("scheduling should not fail");

        scheduler.shutdown().await;

        assert_eq!(
            vec![backlog.commit_id, live_one.commit_id, live_two.commit_id],
            *recording.delivered.lock()
        );
        assert_eq!(0, undispatched_count(&persistence).await);

        let error = scheduler
            .schedule(live_two)
            .await
            .expect_err("the worker is gone");
        assert!(matches!(error, DispatchError::WorkerStopped));
    }
}
