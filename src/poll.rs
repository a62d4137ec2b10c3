//! Contains the [`PollingObserver`]: a background tail-read of the
//! commit log from a checkpoint, fanned out to subscribers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::ready;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::commit::{Checkpoint, Commit};
use crate::persist::PersistCommits;

const DEFAULT_BROADCAST_CHANNEL_SIZE: usize = 128;

/// Observes the commit log by polling
/// [`get_from_checkpoint`][PersistCommits::get_from_checkpoint] at a
/// fixed interval, delivering every newly discovered commit to all
/// subscribers in checkpoint order.
///
/// Delivery is at-least-once across restarts: subscribers must be
/// idempotent or deduplicate using the commit checkpoint. A subscriber
/// that falls behind the broadcast buffer misses commits but does not
/// affect the others; dropping a subscription disposes it.
pub struct PollingObserver<P, Id, T> {
    persistence: Arc<P>,
    interval: Duration,
    from_checkpoint: Checkpoint,
    tx: broadcast::Sender<Commit<Id, T>>,
    started: AtomicBool,
    shutdown: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<P, Id, T> PollingObserver<P, Id, T>
where
    P: PersistCommits<Id, T> + 'static,
    Id: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Creates an observer that will poll `persistence` every
    /// `interval`, starting after `from_checkpoint`.
    pub fn new(persistence: Arc<P>, interval: Duration, from_checkpoint: Checkpoint) -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_BROADCAST_CHANNEL_SIZE);

        Self {
            persistence,
            interval,
            from_checkpoint,
            tx,
            started: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            worker: Mutex::new(None),
        }
    }

    /// Opens a subscription to the commits the observer discovers from
    /// now on.
    ///
    /// The returned stream must be consumed promptly: the observer
    /// never blocks on a subscriber, so a lagging one skips ahead past
    /// the commits that fell out of the buffer.
    pub fn subscribe(&self) -> BoxStream<'static, Commit<Id, T>> {
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(|received| ready(received.ok()))
            .boxed()
    }

    /// Spawns the polling task. Idempotent: later calls are no-ops.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let persistence = self.persistence.clone();
        let tx = self.tx.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.interval;
        let mut last = self.from_checkpoint;

        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let mut commits = persistence.get_from_checkpoint(last);
                while let Some(next) = commits.next().await {
                    match next {
                        Ok(commit) => {
                            if commit.checkpoint <= last {
                                // Already consumed; backends are allowed
                                // to be sloppy around the boundary.
                                continue;
                            }

                            let checkpoint = commit.checkpoint;
                            // A send error only means there is no
                            // subscriber right now.
                            let _ = tx.send(commit);
                            last = checkpoint;
                        }
                        Err(error) => {
                            tracing::warn!(%error, "polling read failed, retrying at the next interval");
                            break;
                        }
                    }
                }
            }
        });

        *self.worker.lock() = Some(worker);
    }

    /// The checkpoint the observer resumes from when started.
    pub fn starting_checkpoint(&self) -> Checkpoint {
        self.from_checkpoint
    }

    /// Cancels the polling task and waits for it to wind down.
    /// In-flight subscriber delivery completes first.
    pub async fn stop(&self) {
        self.shutdown.notify_one();

        let worker = { self.worker.lock().take() };
        if let Some(worker) = worker {
            if let Err(error) = worker.await {
                tracing::error!(%error, "polling task terminated abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use futures::stream::iter;
    use uuid::Uuid;

    use super::*;
    use crate::commit::{CommitAttempt, StreamRevision};
    use crate::message::{EventMessage, Headers};
    use crate::persist::{CommitStream, PersistError};

    type Id = &'static str;
    type Payload = &'static str;

    fn commit(checkpoint: Checkpoint) -> Commit<Id, Payload> {
        Commit {
            stream_id: "stream:test",
            stream_revision: checkpoint,
            commit_id: Uuid::new_v4(),
            commit_sequence: checkpoint,
            commit_stamp: Utc::now(),
            headers: Headers::default(),
            events: vec![EventMessage::new("x")],
            checkpoint,
        }
    }

    /// A backend that serves a fixed tail regardless of the requested
    /// checkpoint, including one commit the observer already consumed.
    struct SloppyTail {
        commits: Vec<Commit<Id, Payload>>,
    }

    #[async_trait]
    impl PersistCommits<Id, Payload> for SloppyTail {
        async fn initialize(&self) -> Result<(), PersistError> {
            Ok(())
        }

        fn get_between(
            &self,
            _stream_id: &Id,
            _min_revision: StreamRevision,
            _max_revision: StreamRevision,
        ) -> CommitStream<'_, Id, Payload> {
            unimplemented!()
        }

        fn get_since(&self, _instant: DateTime<Utc>) -> CommitStream<'_, Id, Payload> {
            unimplemented!()
        }

        fn get_range(
            &self,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> CommitStream<'_, Id, Payload> {
            unimplemented!()
        }

        fn get_from_checkpoint(&self, _checkpoint: Checkpoint) -> CommitStream<'_, Id, Payload> {
            iter(self.commits.clone()).map(Ok).boxed()
        }

        async fn commit(
            &self,
            _attempt: CommitAttempt<Id, Payload>,
        ) -> Result<Commit<Id, Payload>, PersistError> {
            unimplemented!()
        }

        fn get_undispatched(&self) -> CommitStream<'_, Id, Payload> {
            unimplemented!()
        }

        async fn mark_dispatched(&self, _commit: &Commit<Id, Payload>) -> Result<(), PersistError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn already_consumed_checkpoints_are_skipped() {
        let persistence = Arc::new(SloppyTail {
            commits: vec![commit(9), commit(11), commit(12)],
        });

        let observer = PollingObserver::new(persistence, Duration::from_millis(5), 10);
        let mut subscription = observer.subscribe();
        observer.start();
        observer.start(); // idempotent

        let first = tokio::time::timeout(Duration::from_secs(1), subscription.next())
            .await
            .expect("a commit should arrive")
            .expect("the subscription is open");
        let second = tokio::time::timeout(Duration::from_secs(1), subscription.next())
            .await
            .expect("a commit should arrive")
            .expect("the subscription is open");

        assert_eq!(11, first.checkpoint);
        assert_eq!(12, second.checkpoint);

        // Later polls serve the same commits again; all of them are at
        // or below the consumed checkpoint now, so nothing else arrives.
        let nothing =
            tokio::time::timeout(Duration::from_millis(50), subscription.next()).await;
        assert!(nothing.is_err());

        observer.stop().await;
    }

    #[tokio::test]
    async fn subscribers_only_see_commits_from_subscription_onwards() {
        let persistence = Arc::new(SloppyTail {
            commits: vec![commit(11), commit(12)],
        });

        let observer = PollingObserver::new(persistence, Duration::from_millis(5), 10);
        assert_eq!(10, observer.starting_checkpoint());

        observer.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The tail was consumed before this subscription existed.
        let mut late = observer.subscribe();
        let nothing = tokio::time::timeout(Duration::from_millis(50), late.next()).await;
        assert!(nothing.is_err());

        observer.stop().await;
    }
}
