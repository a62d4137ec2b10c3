//! Contains the definition of the [`EventMessage`] type, the unit of
//! domain data carried inside a [Commit][crate::commit::Commit].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Headers attached to an [`EventMessage`] or to a whole
/// [Commit][crate::commit::Commit], providing additional context to the
/// payload carried out.
pub type Headers = HashMap<String, serde_json::Value>;

/// A single Domain Event packaged for persistence, carrying the actual
/// payload and optional [`Headers`].
///
/// Event messages are immutable once handed to an
/// [`OptimisticEventStream`][crate::stream::OptimisticEventStream]:
/// use [`EventMessage::with_header`] while building them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage<T> {
    /// Optional headers to provide additional context to the payload.
    pub headers: Headers,

    /// The event payload.
    pub body: T,
}

impl<T> EventMessage<T> {
    /// Wraps the given payload into a new [`EventMessage`] with no headers.
    pub fn new(body: T) -> Self {
        Self {
            headers: Headers::default(),
            body,
        }
    }

    /// Adds a new entry to the message [`Headers`].
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

impl<T> From<T> for EventMessage<T> {
    fn from(body: T) -> Self {
        Self::new(body)
    }
}

impl<T> PartialEq for EventMessage<T>
where
    T: PartialEq,
{
    fn eq(&self, other: &EventMessage<T>) -> bool {
        self.body == other.body
    }
}
