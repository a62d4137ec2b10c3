//! The SQL dialect abstraction: every statement the store executes is
//! routed through a [`SqlDialect`], together with the classification of
//! the backend's unique-violation condition.

use tokio_postgres::error::SqlState;

/// The catalogue of statements and backend-specific behaviors the
/// [`PostgresPersistence`][crate::store::PostgresPersistence] relies on.
///
/// Statements use positional (`$n`) parameter naming; a dialect for a
/// backend with named parameters would perform the substitution here.
/// Commit identifiers are bound as native `UUID` values; a backend
/// without a native type would coalesce them to bytes in
/// [`SqlDialect::persist_commit`] and the read statements.
pub trait SqlDialect: Send + Sync {
    /// Idempotent DDL preparing the storage schema.
    fn initialize_storage(&self) -> &'static str;

    /// Appends one commit row, returning the allocated checkpoint.
    /// Parameters: stream id, commit id, commit sequence, stream
    /// revision, item count, commit stamp, headers, payload.
    fn persist_commit(&self) -> &'static str;

    /// Probes for a commit with the given stream id and commit id, used
    /// to tell a duplicate apart from a concurrency conflict once the
    /// unique violation fired.
    fn duplicate_commit(&self) -> &'static str;

    /// Upserts the stream head after a persisted commit. Parameters:
    /// stream id, head revision.
    fn update_stream_head(&self) -> &'static str;

    /// Commits of one stream whose revision window intersects the given
    /// range, ordered by commit sequence.
    fn get_commits_from_starting_revision(&self) -> &'static str;

    /// Commits stamped at or after an instant, ordered by stamp then
    /// checkpoint.
    fn get_commits_from_instant(&self) -> &'static str;

    /// Commits stamped within a half-open instant range, ordered by
    /// stamp then checkpoint.
    fn get_commits_from_to(&self) -> &'static str;

    /// One page of commits past a checkpoint, ordered by checkpoint.
    /// The paging clause caps each read; the store keeps requesting
    /// pages until one comes back short.
    fn get_commits_from_checkpoint(&self) -> &'static str;

    /// Commits not yet marked as dispatched, ordered by checkpoint.
    fn get_undispatched_commits(&self) -> &'static str;

    /// Flags one commit as dispatched. Parameters: stream id, commit
    /// id.
    fn mark_commit_as_dispatched(&self) -> &'static str;

    /// Inserts a snapshot row unless one exists for the same stream and
    /// revision. Parameters: stream id, stream revision, payload.
    fn append_snapshot_to_commit(&self) -> &'static str;

    /// Raises the recorded snapshot revision on the stream head.
    /// Parameters: stream id, snapshot revision.
    fn update_snapshot_revision(&self) -> &'static str;

    /// The most recent snapshot at or below a revision.
    fn get_snapshot(&self) -> &'static str;

    /// Heads of streams that accumulated at least the given number of
    /// events past their latest snapshot.
    fn get_streams_requiring_snapshots(&self) -> &'static str;

    /// Whether the error is the backend's unique-violation condition,
    /// the signal behind both duplicate-commit and concurrency
    /// failures.
    fn is_duplicate(&self, error: &tokio_postgres::Error) -> bool;
}

const INITIALIZE_STORAGE: &str = "
    CREATE TABLE IF NOT EXISTS commits (
        checkpoint BIGSERIAL PRIMARY KEY,
        stream_id TEXT NOT NULL,
        commit_id UUID NOT NULL,
        commit_sequence BIGINT NOT NULL,
        stream_revision BIGINT NOT NULL,
        items INT NOT NULL,
        commit_stamp TIMESTAMPTZ NOT NULL,
        headers BYTEA NOT NULL,
        payload BYTEA NOT NULL,
        dispatched BOOLEAN NOT NULL DEFAULT FALSE,
        UNIQUE (stream_id, commit_sequence),
        UNIQUE (stream_id, commit_id)
    );

    CREATE INDEX IF NOT EXISTS ix_commits_undispatched
        ON commits (checkpoint) WHERE dispatched = FALSE;

    CREATE INDEX IF NOT EXISTS ix_commits_stamp
        ON commits (commit_stamp, checkpoint);

    CREATE TABLE IF NOT EXISTS streams (
        stream_id TEXT PRIMARY KEY,
        stream_name TEXT,
        head_revision BIGINT NOT NULL,
        snapshot_revision BIGINT NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS snapshots (
        stream_id TEXT NOT NULL,
        stream_revision BIGINT NOT NULL,
        payload BYTEA NOT NULL,
        PRIMARY KEY (stream_id, stream_revision)
    );
";

const PERSIST_COMMIT: &str = "
    INSERT INTO commits
        (stream_id, commit_id, commit_sequence, stream_revision, items, commit_stamp, headers, payload)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    RETURNING checkpoint
";

const DUPLICATE_COMMIT: &str = "
    SELECT 1 FROM commits WHERE stream_id = $1 AND commit_id = $2
";

const UPDATE_STREAM_HEAD: &str = "
    INSERT INTO streams (stream_id, head_revision, snapshot_revision)
    VALUES ($1, $2, 0)
    ON CONFLICT (stream_id) DO UPDATE
        SET head_revision = GREATEST(streams.head_revision, EXCLUDED.head_revision)
";

const GET_COMMITS_FROM_STARTING_REVISION: &str = "
    SELECT stream_id, commit_id, commit_sequence, stream_revision, commit_stamp, headers, payload, checkpoint
    FROM commits
    WHERE stream_id = $1
      AND stream_revision >= $2
      AND stream_revision - items + 1 <= $3
    ORDER BY commit_sequence ASC
";

const GET_COMMITS_FROM_INSTANT: &str = "
    SELECT stream_id, commit_id, commit_sequence, stream_revision, commit_stamp, headers, payload, checkpoint
    FROM commits
    WHERE commit_stamp >= $1
    ORDER BY commit_stamp ASC, checkpoint ASC
";

const GET_COMMITS_FROM_TO: &str = "
    SELECT stream_id, commit_id, commit_sequence, stream_revision, commit_stamp, headers, payload, checkpoint
    FROM commits
    WHERE commit_stamp >= $1 AND commit_stamp < $2
    ORDER BY commit_stamp ASC, checkpoint ASC
";

const GET_COMMITS_FROM_CHECKPOINT: &str = "
    SELECT stream_id, commit_id, commit_sequence, stream_revision, commit_stamp, headers, payload, checkpoint
    FROM commits
    WHERE checkpoint > $1
    ORDER BY checkpoint ASC
    LIMIT $2
";

const GET_UNDISPATCHED_COMMITS: &str = "
    SELECT stream_id, commit_id, commit_sequence, stream_revision, commit_stamp, headers, payload, checkpoint
    FROM commits
    WHERE dispatched = FALSE
    ORDER BY checkpoint ASC
";

const MARK_COMMIT_AS_DISPATCHED: &str = "
    UPDATE commits SET dispatched = TRUE WHERE stream_id = $1 AND commit_id = $2
";

const APPEND_SNAPSHOT_TO_COMMIT: &str = "
    INSERT INTO snapshots (stream_id, stream_revision, payload)
    VALUES ($1, $2, $3)
    ON CONFLICT (stream_id, stream_revision) DO NOTHING
";

const UPDATE_SNAPSHOT_REVISION: &str = "
    INSERT INTO streams (stream_id, head_revision, snapshot_revision)
    VALUES ($1, $2, $2)
    ON CONFLICT (stream_id) DO UPDATE
        SET snapshot_revision = GREATEST(streams.snapshot_revision, EXCLUDED.snapshot_revision)
";

const GET_SNAPSHOT: &str = "
    SELECT stream_id, stream_revision, payload
    FROM snapshots
    WHERE stream_id = $1 AND stream_revision <= $2
    ORDER BY stream_revision DESC
    LIMIT 1
";

const GET_STREAMS_REQUIRING_SNAPSHOTS: &str = "
    SELECT stream_id, stream_name, head_revision, snapshot_revision
    FROM streams
    WHERE head_revision - snapshot_revision >= $1
";

/// The PostgreSQL dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn initialize_storage(&self) -> &'static str {
        INITIALIZE_STORAGE
    }

    fn persist_commit(&self) -> &'static str {
        PERSIST_COMMIT
    }

    fn duplicate_commit(&self) -> &'static str {
        DUPLICATE_COMMIT
    }

    fn update_stream_head(&self) -> &'static str {
        UPDATE_STREAM_HEAD
    }

    fn get_commits_from_starting_revision(&self) -> &'static str {
        GET_COMMITS_FROM_STARTING_REVISION
    }

    fn get_commits_from_instant(&self) -> &'static str {
        GET_COMMITS_FROM_INSTANT
    }

    fn get_commits_from_to(&self) -> &'static str {
        GET_COMMITS_FROM_TO
    }

    fn get_commits_from_checkpoint(&self) -> &'static str {
        GET_COMMITS_FROM_CHECKPOINT
    }

    fn get_undispatched_commits(&self) -> &'static str {
        GET_UNDISPATCHED_COMMITS
    }

    fn mark_commit_as_dispatched(&self) -> &'static str {
        MARK_COMMIT_AS_DISPATCHED
    }

    fn append_snapshot_to_commit(&self) -> &'static str {
        APPEND_SNAPSHOT_TO_COMMIT
    }

    fn update_snapshot_revision(&self) -> &'static str {
        UPDATE_SNAPSHOT_REVISION
    }

    fn get_snapshot(&self) -> &'static str {
        GET_SNAPSHOT
    }

    fn get_streams_requiring_snapshots(&self) -> &'static str {
        GET_STREAMS_REQUIRING_SNAPSHOTS
    }

    fn is_duplicate(&self, error: &tokio_postgres::Error) -> bool {
        error.code() == Some(&SqlState::UNIQUE_VIOLATION)
    }
}
