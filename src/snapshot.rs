//! Contains the [`Snapshot`] and [`StreamHead`] types used to bound
//! event replay when rehydrating long streams.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::commit::StreamRevision;

/// A materialization of stream state at a given revision.
///
/// Snapshots are created out-of-band and never mutated; at most one
/// snapshot exists per `(stream_id, stream_revision)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot<Id, S> {
    /// The identifier of the stream this snapshot summarizes.
    pub stream_id: Id,

    /// The revision as of which the snapshot summarizes state.
    pub stream_revision: StreamRevision,

    /// The materialized state.
    pub payload: S,
}

impl<Id, S> Snapshot<Id, S> {
    /// Creates a new [`Snapshot`] of the given stream as of the given
    /// revision.
    pub fn new(stream_id: Id, stream_revision: StreamRevision, payload: S) -> Self {
        Self {
            stream_id,
            stream_revision,
            payload,
        }
    }
}

/// Advisory record of how far a stream has advanced and how far behind
/// its latest snapshot is.
///
/// Heads are updated on every persisted commit and on snapshot add; they
/// are never a source of truth for reads. Equality and hashing are by
/// [`stream_id`][StreamHead::stream_id] alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamHead<Id> {
    /// The identifier of the stream.
    pub stream_id: Id,

    /// Optional human-readable name of the stream.
    pub stream_name: Option<String>,

    /// The latest persisted revision of the stream.
    pub head_revision: StreamRevision,

    /// The revision of the latest snapshot, 0 if none exists.
    pub snapshot_revision: StreamRevision,
}

impl<Id> StreamHead<Id> {
    /// How many events the stream has accumulated past its latest
    /// snapshot.
    pub fn unsnapshotted(&self) -> u64 {
        self.head_revision.saturating_sub(self.snapshot_revision)
    }
}

impl<Id> PartialEq for StreamHead<Id>
where
    Id: PartialEq,
{
    fn eq(&self, other: &StreamHead<Id>) -> bool {
        self.stream_id == other.stream_id
    }
}

impl<Id> Eq for StreamHead<Id> where Id: Eq {}

impl<Id> Hash for StreamHead<Id>
where
    Id: Hash,
{
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.stream_id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heads_compare_by_stream_id_alone() {
        let head = StreamHead {
            stream_id: "stream:test",
            stream_name: None,
            head_revision: 10,
            snapshot_revision: 4,
        };

        let moved = StreamHead {
            head_revision: 12,
            ..head.clone()
        };

        assert_eq!(head, moved);
        assert_eq!(6, head.unsnapshotted());
    }
}
