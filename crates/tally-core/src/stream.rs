//! Stream data type.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::event::Event;

/// An ordered, versioned sequence of events belonging to one aggregate.
///
/// Streams are handed out by value; changing a returned stream's `events`
/// has no effect on storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stream {
    /// Stream identifier.
    pub id: Uuid,
    /// Caller-supplied classification (e.g. an aggregate name).
    #[serde(rename = "type")]
    pub stream_type: String,
    /// Number of events appended so far.
    pub version: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last append, `None` until the first one.
    pub updated_at: Option<DateTime<Utc>>,
    /// Events ordered by ascending version. Empty until the stream is loaded.
    pub events: Vec<Event>,
}

impl Stream {
    /// Creates an empty stream at version 0.
    #[must_use]
    pub fn new(id: Uuid, stream_type: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            stream_type: stream_type.into(),
            version: 0,
            created_at,
            updated_at: None,
            events: Vec::new(),
        }
    }

    /// The version the next appended event must carry.
    #[must_use]
    pub fn next_version(&self) -> i64 {
        self.version + 1
    }

    /// Returns `true` when every stored event is loaded and the sequence has
    /// versions `1..=version` with no gaps.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        usize::try_from(self.version).is_ok_and(|v| v == self.events.len())
            && self
                .events
                .iter()
                .zip(1_i64..)
                .all(|(event, expected)| event.version() == expected)
    }

    /// The most recently appended event, if loaded.
    #[must_use]
    pub fn last_event(&self) -> Option<&Event> {
        self.events.last()
    }
}
