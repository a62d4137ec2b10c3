//! Contains the [`Commit`] and [`CommitAttempt`] types: the atomic,
//! durable batch of events a stream appends to persistence.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::message::{EventMessage, Headers};

/// A process-wide position assigned by persistence to each [`Commit`],
/// strictly increasing in insertion order across all streams.
///
/// Opaque to clients: its only meaningful operations are ordering and
/// equality.
pub type Checkpoint = u64;

/// The count of events in a stream, 1-based.
///
/// Used for optimistic concurrency: writes declare the revision they
/// expect to produce and fail if another writer advanced it first.
pub type StreamRevision = u64;

/// The count of commits on a stream, 1-based and dense.
pub type CommitSequence = u64;

/// Globally unique identifier of a single [`Commit`], used for
/// idempotency and duplicate detection.
pub type CommitId = Uuid;

/// All the ways a [`CommitAttempt`] can fail validation before being
/// handed to persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidCommit {
    /// The commit identifier is the nil UUID.
    #[error("commit identifier must not be the nil uuid")]
    NilCommitId,

    /// The commit sequence is below the 1-based minimum.
    #[error("commit sequence must be at least 1")]
    SequenceOutOfRange,

    /// The stream revision is below the 1-based minimum.
    #[error("stream revision must be at least 1")]
    RevisionOutOfRange,

    /// The stream revision is lower than the commit sequence, which is
    /// impossible for a commit carrying at least one event.
    #[error("stream revision cannot be lower than the commit sequence")]
    RevisionBehindSequence,

    /// The attempt carries no events.
    #[error("a commit must carry at least one event")]
    NoEvents,
}

/// A batch of events a stream wants to append to persistence.
///
/// An attempt becomes a [`Commit`] once persistence durably stores it and
/// assigns it a [`Checkpoint`].
#[derive(Debug, Clone)]
pub struct CommitAttempt<Id, T> {
    /// The identifier of the stream this attempt belongs to.
    pub stream_id: Id,

    /// The total count of events in the stream including this attempt.
    pub stream_revision: StreamRevision,

    /// The globally unique identifier of this attempt.
    pub commit_id: CommitId,

    /// The total count of commits on the stream including this attempt.
    pub commit_sequence: CommitSequence,

    /// The instant the attempt was built.
    pub commit_stamp: DateTime<Utc>,

    /// Headers describing the whole batch.
    pub headers: Headers,

    /// The events to append, in order.
    pub events: Vec<EventMessage<T>>,
}

impl<Id, T> CommitAttempt<Id, T> {
    /// Checks the attempt against the commit invariants.
    ///
    /// Performed by the [`EventStore`][crate::store::EventStore] before
    /// delegating a raw attempt to persistence.
    ///
    /// # Errors
    ///
    /// Returns the first [`InvalidCommit`] violation found.
    pub fn validate(&self) -> Result<(), InvalidCommit> {
        if self.commit_id.is_nil() {
            return Err(InvalidCommit::NilCommitId);
        }
        if self.commit_sequence < 1 {
            return Err(InvalidCommit::SequenceOutOfRange);
        }
        if self.stream_revision < 1 {
            return Err(InvalidCommit::RevisionOutOfRange);
        }
        if self.stream_revision < self.commit_sequence {
            return Err(InvalidCommit::RevisionBehindSequence);
        }
        if self.events.is_empty() {
            return Err(InvalidCommit::NoEvents);
        }

        Ok(())
    }

    /// The revision of the first event carried by this attempt.
    pub fn starting_revision(&self) -> StreamRevision {
        (self.stream_revision + 1).saturating_sub(self.events.len() as u64)
    }
}

/// A durable batch of one or more events persisted atomically against a
/// stream's head.
///
/// Commits are shared immutable data once persisted. Equality is
/// deliberately not defined on the whole value: compare commits by
/// `(stream_id, commit_sequence)` or by [`commit_id`][Commit::commit_id]
/// explicitly.
#[derive(Debug, Clone)]
pub struct Commit<Id, T> {
    /// The identifier of the stream this commit belongs to.
    pub stream_id: Id,

    /// The total count of events in the stream including this commit.
    pub stream_revision: StreamRevision,

    /// The globally unique identifier of this commit.
    pub commit_id: CommitId,

    /// The total count of commits on the stream including this one.
    pub commit_sequence: CommitSequence,

    /// The instant the originating attempt was built.
    pub commit_stamp: DateTime<Utc>,

    /// Headers describing the whole batch.
    pub headers: Headers,

    /// The events carried by this commit, in order.
    pub events: Vec<EventMessage<T>>,

    /// The process-wide position persistence assigned to this commit.
    pub checkpoint: Checkpoint,
}

impl<Id, T> Commit<Id, T> {
    /// Builds the persisted view of an attempt, with the [`Checkpoint`]
    /// the backend allocated for it.
    pub fn from_attempt(attempt: CommitAttempt<Id, T>, checkpoint: Checkpoint) -> Self {
        Self {
            stream_id: attempt.stream_id,
            stream_revision: attempt.stream_revision,
            commit_id: attempt.commit_id,
            commit_sequence: attempt.commit_sequence,
            commit_stamp: attempt.commit_stamp,
            headers: attempt.headers,
            events: attempt.events,
            checkpoint,
        }
    }

    /// The revision of the first event carried by this commit.
    pub fn starting_revision(&self) -> StreamRevision {
        (self.stream_revision + 1).saturating_sub(self.events.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::tests::StringPayload;

    fn make_attempt(
        events: Vec<EventMessage<StringPayload>>,
    ) -> CommitAttempt<&'static str, StringPayload> {
        CommitAttempt {
            stream_id: "stream:test",
            stream_revision: events.len() as u64,
            commit_id: Uuid::new_v4(),
            commit_sequence: 1,
            commit_stamp: Utc::now(),
            headers: Headers::default(),
            events,
        }
    }

    #[test]
    fn valid_attempt_passes_validation() {
        let attempt = make_attempt(vec![EventMessage::new(StringPayload("a"))]);
        assert_eq!(Ok(()), attempt.validate());
    }

    #[test]
    fn nil_commit_id_is_rejected() {
        let mut attempt = make_attempt(vec![EventMessage::new(StringPayload("a"))]);
        attempt.commit_id = Uuid::nil();

        assert_eq!(Err(InvalidCommit::NilCommitId), attempt.validate());
    }

    #[test]
    fn zero_sequence_and_revision_are_rejected() {
        let mut attempt = make_attempt(vec![EventMessage::new(StringPayload("a"))]);
        attempt.commit_sequence = 0;
        assert_eq!(Err(InvalidCommit::SequenceOutOfRange), attempt.validate());

        let mut attempt = make_attempt(vec![EventMessage::new(StringPayload("a"))]);
        attempt.stream_revision = 0;
        assert_eq!(Err(InvalidCommit::RevisionOutOfRange), attempt.validate());
    }

    #[test]
    fn revision_behind_sequence_is_rejected() {
        let mut attempt = make_attempt(vec![EventMessage::new(StringPayload("a"))]);
        attempt.commit_sequence = 3;
        attempt.stream_revision = 2;

        assert_eq!(Err(InvalidCommit::RevisionBehindSequence), attempt.validate());
    }

    #[test]
    fn empty_attempt_is_rejected() {
        let mut attempt = make_attempt(vec![EventMessage::new(StringPayload("a"))]);
        attempt.events.clear();

        assert_eq!(Err(InvalidCommit::NoEvents), attempt.validate());
    }

    #[test]
    fn starting_revision_accounts_for_all_carried_events() {
        let mut attempt = make_attempt(vec![
            EventMessage::new(StringPayload("a")),
            EventMessage::new(StringPayload("b")),
        ]);
        attempt.stream_revision = 5;

        assert_eq!(4, attempt.starting_revision());
    }
}
