//! Contains the [`PostgresPersistence`] implementation of the
//! [`chronicle`] persistence contract.

use std::convert::TryFrom;
use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bb8::{Pool, RunError};
use bb8_postgres::PostgresConnectionManager;
use chrono::{DateTime, Utc};
use futures::stream::{iter, once, try_unfold, StreamExt, TryStreamExt};
use tokio_postgres::{NoTls, Row};

use chronicle::commit::{Checkpoint, Commit, CommitAttempt, StreamRevision};
use chronicle::message::{EventMessage, Headers};
use chronicle::persist::{
    AccessSnapshots, CommitStream, PersistCommits, PersistError, StreamHeadStream,
};
use chronicle::serde::{Json, Serde};
use chronicle::snapshot::{Snapshot, StreamHead};

use crate::dialect::{PostgresDialect, SqlDialect};
use crate::Params;

const DEFAULT_PAGE_SIZE: i64 = 512;

/// The connection pool the store runs on.
pub type ConnectionPool = Pool<PostgresConnectionManager<NoTls>>;

fn translate(error: tokio_postgres::Error) -> PersistError {
    if error.is_closed() {
        PersistError::Unavailable(anyhow::Error::new(error))
    } else {
        PersistError::Storage(anyhow::Error::new(error))
    }
}

fn pool_error(error: RunError<tokio_postgres::Error>) -> PersistError {
    match error {
        RunError::User(error) => translate(error),
        RunError::TimedOut => PersistError::Unavailable(anyhow::anyhow!(
            "timed out waiting for a pooled connection"
        )),
    }
}

fn decode_error(error: impl std::error::Error + Send + Sync + 'static) -> PersistError {
    PersistError::Storage(anyhow::Error::new(error))
}

fn db_param(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn row_to_commit<Id, T, C>(codec: &C, row: &Row) -> Result<Commit<Id, T>, PersistError>
where
    Id: TryFrom<String>,
    <Id as TryFrom<String>>::Error: std::error::Error + Send + Sync + 'static,
    C: Serde<Vec<EventMessage<T>>> + Serde<Headers>,
    <C as Serde<Vec<EventMessage<T>>>>::Error: std::error::Error + Send + Sync + 'static,
    <C as Serde<Headers>>::Error: std::error::Error + Send + Sync + 'static,
{
    let stream_id: String = row.try_get("stream_id").map_err(translate)?;
    let stream_id = Id::try_from(stream_id).map_err(decode_error)?;
    let commit_id = row.try_get("commit_id").map_err(translate)?;
    let commit_sequence: i64 = row.try_get("commit_sequence").map_err(translate)?;
    let stream_revision: i64 = row.try_get("stream_revision").map_err(translate)?;
    let commit_stamp: DateTime<Utc> = row.try_get("commit_stamp").map_err(translate)?;
    let headers: Vec<u8> = row.try_get("headers").map_err(translate)?;
    let payload: Vec<u8> = row.try_get("payload").map_err(translate)?;
    let checkpoint: i64 = row.try_get("checkpoint").map_err(translate)?;

    let headers = Serde::<Headers>::deserialize(codec, headers).map_err(decode_error)?;
    let events = Serde::<Vec<EventMessage<T>>>::deserialize(codec, payload).map_err(decode_error)?;

    Ok(Commit {
        stream_id,
        stream_revision: stream_revision as u64,
        commit_id,
        commit_sequence: commit_sequence as u64,
        commit_stamp,
        headers,
        events,
        checkpoint: checkpoint as u64,
    })
}

fn row_to_stream_head<Id>(row: &Row) -> Result<StreamHead<Id>, PersistError>
where
    Id: TryFrom<String>,
    <Id as TryFrom<String>>::Error: std::error::Error + Send + Sync + 'static,
{
    let stream_id: String = row.try_get("stream_id").map_err(translate)?;
    let stream_name: Option<String> = row.try_get("stream_name").map_err(translate)?;
    let head_revision: i64 = row.try_get("head_revision").map_err(translate)?;
    let snapshot_revision: i64 = row.try_get("snapshot_revision").map_err(translate)?;

    Ok(StreamHead {
        stream_id: Id::try_from(stream_id).map_err(decode_error)?,
        stream_name,
        head_revision: head_revision as u64,
        snapshot_revision: snapshot_revision as u64,
    })
}

/// Persistence implementation using a PostgreSQL backend.
///
/// Stream identifiers are stored as text, so the `Id` type has to
/// implement [`Display`] and be parsed back through
/// [`TryFrom<String>`]. Event collections, commit headers and snapshot
/// payloads travel through the injected [`Serde`] codec; the
/// [`Json`] codec is the default.
pub struct PostgresPersistence<Id, T, S = serde_json::Value, C = Json> {
    pool: ConnectionPool,
    dialect: Arc<dyn SqlDialect>,
    codec: C,
    page_size: i64,
    initialized: Arc<AtomicU32>,
    stream_id_type: PhantomData<Id>,
    event_type: PhantomData<T>,
    snapshot_type: PhantomData<S>,
}

impl<Id, T, S, C> Clone for PostgresPersistence<Id, T, S, C>
where
    C: Clone,
{
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            dialect: self.dialect.clone(),
            codec: self.codec.clone(),
            page_size: self.page_size,
            initialized: self.initialized.clone(),
            stream_id_type: PhantomData,
            event_type: PhantomData,
            snapshot_type: PhantomData,
        }
    }
}

impl<Id, T, S, C> PostgresPersistence<Id, T, S, C> {
    /// Creates a store over the given pool, using the
    /// [`PostgresDialect`].
    pub fn new(pool: ConnectionPool, codec: C) -> Self {
        Self::with_dialect(pool, codec, PostgresDialect)
    }

    /// Creates a store over the given pool with a custom dialect.
    pub fn with_dialect(pool: ConnectionPool, codec: C, dialect: impl SqlDialect + 'static) -> Self {
        Self {
            pool,
            dialect: Arc::new(dialect),
            codec,
            page_size: DEFAULT_PAGE_SIZE,
            initialized: Arc::new(AtomicU32::new(0)),
            stream_id_type: PhantomData,
            event_type: PhantomData,
            snapshot_type: PhantomData,
        }
    }

    /// Caps how many commits each checkpoint tail-read page requests.
    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = i64::from(page_size.max(1));
        self
    }
}

impl<Id, T, S, C> PostgresPersistence<Id, T, S, C>
where
    Id: TryFrom<String> + Display + Send + Sync,
    <Id as TryFrom<String>>::Error: std::error::Error + Send + Sync + 'static,
    T: Send + Sync,
    S: Send + Sync,
    C: Serde<Vec<EventMessage<T>>> + Serde<Headers> + Clone + Send + Sync,
    <C as Serde<Vec<EventMessage<T>>>>::Error: std::error::Error + Send + Sync + 'static,
    <C as Serde<Headers>>::Error: std::error::Error + Send + Sync + 'static,
{
    /// One-shot query returning the decoded commits as a stream.
    fn query_commits<'a>(
        &'a self,
        statement: &'static str,
        params: Vec<OwnedParam>,
    ) -> CommitStream<'a, Id, T> {
        let pool = self.pool.clone();
        let codec = self.codec.clone();

        once(async move {
            let client = pool.get().await.map_err(pool_error)?;
            let params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
                params.iter().map(OwnedParam::borrowed).collect();
            let rows = client
                .query(statement, &params)
                .await
                .map_err(translate)?;
            let commits: Vec<_> = rows
                .iter()
                .map(|row| row_to_commit::<Id, T, C>(&codec, row))
                .collect();
            Ok::<_, PersistError>(iter(commits))
        })
        .try_flatten()
        .boxed()
    }
}

/// Owned statement parameter, kept alive for the duration of a deferred
/// query.
enum OwnedParam {
    Text(String),
    BigInt(i64),
    Instant(DateTime<Utc>),
}

impl OwnedParam {
    fn borrowed(&self) -> &(dyn tokio_postgres::types::ToSql + Sync) {
        match self {
            OwnedParam::Text(value) => value,
            OwnedParam::BigInt(value) => value,
            OwnedParam::Instant(value) => value,
        }
    }
}

#[async_trait]
impl<Id, T, S, C> PersistCommits<Id, T> for PostgresPersistence<Id, T, S, C>
where
    Id: TryFrom<String> + Display + Send + Sync,
    <Id as TryFrom<String>>::Error: std::error::Error + Send + Sync + 'static,
    T: Clone + Send + Sync,
    S: Send + Sync,
    C: Serde<Vec<EventMessage<T>>> + Serde<Headers> + Clone + Send + Sync,
    <C as Serde<Vec<EventMessage<T>>>>::Error: std::error::Error + Send + Sync + 'static,
    <C as Serde<Headers>>::Error: std::error::Error + Send + Sync + 'static,
{
    async fn initialize(&self) -> Result<(), PersistError> {
        if self.initialized.fetch_add(1, Ordering::SeqCst) > 0 {
            return Ok(());
        }

        let result: Result<(), PersistError> = async {
            let client = self.pool.get().await.map_err(pool_error)?;
            client
                .batch_execute(self.dialect.initialize_storage())
                .await
                .map_err(translate)?;
            Ok(())
        }
        .await;

        if result.is_err() {
            // Let the next caller retry the setup.
            self.initialized.store(0, Ordering::SeqCst);
        }

        result
    }

    fn get_between(
        &self,
        stream_id: &Id,
        min_revision: StreamRevision,
        max_revision: StreamRevision,
    ) -> CommitStream<'_, Id, T> {
        self.query_commits(
            self.dialect.get_commits_from_starting_revision(),
            vec![
                OwnedParam::Text(stream_id.to_string()),
                OwnedParam::BigInt(db_param(min_revision)),
                OwnedParam::BigInt(db_param(max_revision)),
            ],
        )
    }

    fn get_since(&self, instant: DateTime<Utc>) -> CommitStream<'_, Id, T> {
        self.query_commits(
            self.dialect.get_commits_from_instant(),
            vec![OwnedParam::Instant(instant)],
        )
    }

    fn get_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> CommitStream<'_, Id, T> {
        self.query_commits(
            self.dialect.get_commits_from_to(),
            vec![OwnedParam::Instant(start), OwnedParam::Instant(end)],
        )
    }

    fn get_from_checkpoint(&self, checkpoint: Checkpoint) -> CommitStream<'_, Id, T> {
        let pool = self.pool.clone();
        let codec = self.codec.clone();
        let statement = self.dialect.get_commits_from_checkpoint();
        let page_size = self.page_size;

        try_unfold(
            (checkpoint, false),
            move |(from, exhausted)| {
                let pool = pool.clone();
                let codec = codec.clone();

                async move {
                    if exhausted {
                        return Ok::<_, PersistError>(None);
                    }

                    let client = pool.get().await.map_err(pool_error)?;
                    let from_param = db_param(from);
                    let params: Params<'_> = &[&from_param, &page_size];
                    let rows = client.query(statement, params).await.map_err(translate)?;

                    let exhausted = (rows.len() as i64) < page_size;
                    let mut last = from;
                    let mut commits = Vec::with_capacity(rows.len());
                    for row in &rows {
                        let commit = row_to_commit::<Id, T, C>(&codec, row)?;
                        last = commit.checkpoint;
                        commits.push(Ok(commit));
                    }

                    if commits.is_empty() {
                        return Ok::<_, PersistError>(None);
                    }

                    Ok(Some((iter(commits), (last, exhausted))))
                }
            },
        )
        .try_flatten()
        .boxed()
    }

    async fn commit(&self, attempt: CommitAttempt<Id, T>) -> Result<Commit<Id, T>, PersistError> {
        let headers = Serde::<Headers>::serialize(&self.codec, attempt.headers.clone());
        let payload = Serde::<Vec<EventMessage<T>>>::serialize(&self.codec, attempt.events.clone());
        let stream_id = attempt.stream_id.to_string();
        let commit_sequence = db_param(attempt.commit_sequence);
        let stream_revision = db_param(attempt.stream_revision);
        let items = attempt.events.len() as i32;

        let mut client = self.pool.get().await.map_err(pool_error)?;
        let tx = client.transaction().await.map_err(translate)?;

        let inserted = tx
            .query_one(
                self.dialect.persist_commit(),
                &[
                    &stream_id,
                    &attempt.commit_id,
                    &commit_sequence,
                    &stream_revision,
                    &items,
                    &attempt.commit_stamp,
                    &headers,
                    &payload,
                ],
            )
            .await;

        let row = match inserted {
            Ok(row) => row,
            Err(error) if self.dialect.is_duplicate(&error) => {
                tx.rollback().await.map_err(translate)?;

                // The unique index fired: either the same commit went
                // through before, or another writer took the sequence.
                let duplicate = client
                    .query_opt(
                        self.dialect.duplicate_commit(),
                        &[&stream_id, &attempt.commit_id],
                    )
                    .await
                    .map_err(translate)?;

                return Err(if duplicate.is_some() {
                    PersistError::DuplicateCommit
                } else {
                    PersistError::Conflict
                });
            }
            Err(error) => return Err(translate(error)),
        };

        let checkpoint: i64 = row.try_get("checkpoint").map_err(translate)?;

        tx.execute(
            self.dialect.update_stream_head(),
            &[&stream_id, &stream_revision],
        )
        .await
        .map_err(translate)?;

        tx.commit().await.map_err(translate)?;

        Ok(Commit::from_attempt(attempt, checkpoint as u64))
    }

    fn get_undispatched(&self) -> CommitStream<'_, Id, T> {
        self.query_commits(self.dialect.get_undispatched_commits(), Vec::new())
    }

    async fn mark_dispatched(&self, commit: &Commit<Id, T>) -> Result<(), PersistError> {
        let stream_id = commit.stream_id.to_string();

        let client = self.pool.get().await.map_err(pool_error)?;
        client
            .execute(
                self.dialect.mark_commit_as_dispatched(),
                &[&stream_id, &commit.commit_id],
            )
            .await
            .map_err(translate)?;

        Ok(())
    }
}

#[async_trait]
impl<Id, T, S, C> AccessSnapshots<Id, S> for PostgresPersistence<Id, T, S, C>
where
    Id: TryFrom<String> + Display + Send + Sync,
    <Id as TryFrom<String>>::Error: std::error::Error + Send + Sync + 'static,
    T: Send + Sync,
    S: Send + Sync,
    C: Serde<S> + Clone + Send + Sync,
    <C as Serde<S>>::Error: std::error::Error + Send + Sync + 'static,
{
    async fn get_snapshot(
        &self,
        stream_id: &Id,
        max_revision: StreamRevision,
    ) -> Result<Option<Snapshot<Id, S>>, PersistError> {
        let client = self.pool.get().await.map_err(pool_error)?;

        let row = client
            .query_opt(
                self.dialect.get_snapshot(),
                &[&stream_id.to_string(), &db_param(max_revision)],
            )
            .await
            .map_err(translate)?;

        row.map(|row| {
            let stream_id: String = row.try_get("stream_id").map_err(translate)?;
            let stream_revision: i64 = row.try_get("stream_revision").map_err(translate)?;
            let payload: Vec<u8> = row.try_get("payload").map_err(translate)?;

            Ok(Snapshot {
                stream_id: Id::try_from(stream_id).map_err(decode_error)?,
                stream_revision: stream_revision as u64,
                payload: Serde::<S>::deserialize(&self.codec, payload).map_err(decode_error)?,
            })
        })
        .transpose()
    }

    async fn add_snapshot(&self, snapshot: Snapshot<Id, S>) -> Result<bool, PersistError> {
        let stream_id = snapshot.stream_id.to_string();
        let stream_revision = db_param(snapshot.stream_revision);
        let payload = Serde::<S>::serialize(&self.codec, snapshot.payload);

        let mut client = self.pool.get().await.map_err(pool_error)?;
        let tx = client.transaction().await.map_err(translate)?;

        let inserted = tx
            .execute(
                self.dialect.append_snapshot_to_commit(),
                &[&stream_id, &stream_revision, &payload],
            )
            .await
            .map_err(translate)?;

        if inserted == 0 {
            tx.commit().await.map_err(translate)?;
            return Ok(false);
        }

        tx.execute(
            self.dialect.update_snapshot_revision(),
            &[&stream_id, &stream_revision],
        )
        .await
        .map_err(translate)?;

        tx.commit().await.map_err(translate)?;

        Ok(true)
    }

    fn get_streams_to_snapshot(&self, threshold: u64) -> StreamHeadStream<'_, Id> {
        let pool = self.pool.clone();
        let statement = self.dialect.get_streams_requiring_snapshots();
        let threshold = db_param(threshold);

        once(async move {
            let client = pool.get().await.map_err(pool_error)?;
            let rows = client
                .query(statement, &[&threshold])
                .await
                .map_err(translate)?;
            let heads: Vec<_> = rows.iter().map(row_to_stream_head::<Id>).collect();
            Ok::<_, PersistError>(iter(heads))
        })
        .try_flatten()
        .boxed()
    }
}
