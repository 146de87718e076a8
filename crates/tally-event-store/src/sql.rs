//! Helpers shared by the sqlx repositories.

use std::collections::HashMap;

use tally_core::error::StoreError;
use tally_core::event::Event;
use tally_core::stream::Stream;
use uuid::Uuid;

/// Maps a driver error to `StoreError::Storage`.
pub(crate) fn storage(err: sqlx::Error) -> StoreError {
    StoreError::Storage(err.to_string())
}

/// Returns `true` when an insert hit the `(stream_id, version)` unique
/// index, meaning another writer already stored that version.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// The conflict reported when `event`'s version is already taken and the
/// stream row reads `observed`.
pub(crate) fn version_taken(stream_id: Uuid, event: &Event, observed: i64) -> StoreError {
    StoreError::ConcurrencyConflict {
        stream_id,
        expected: event.version().saturating_sub(1),
        observed,
    }
}

/// Attaches each stream's events (already ordered by version) to its row.
pub(crate) fn hydrate(streams: Vec<Stream>, events: Vec<Event>) -> Vec<Stream> {
    let mut by_stream: HashMap<Uuid, Vec<Event>> = HashMap::new();
    for event in events {
        if let Some(stream_id) = event.stream_id() {
            by_stream.entry(stream_id).or_default().push(event);
        }
    }
    streams
        .into_iter()
        .map(|mut stream| {
            stream.events = by_stream.remove(&stream.id).unwrap_or_default();
            stream
        })
        .collect()
}

/// Requires an `UPDATE`/`DELETE` to have touched a row.
pub(crate) fn expect_row(rows_affected: u64, missing: StoreError) -> Result<(), StoreError> {
    if rows_affected == 0 {
        Err(missing)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use tally_core::event::EventRecord;

    use super::*;

    fn recorded(stream_id: Uuid, version: i64) -> Event {
        Event::from(EventRecord {
            id: Uuid::new_v4(),
            stream_id,
            event_type: "Noted".into(),
            payload: tally_core::event::payload_from_value(json!({ "n": version })).unwrap(),
            version,
            occurred_at: Utc::now(),
            recorded_at: Utc::now(),
        })
    }

    #[test]
    fn test_hydrate_attaches_events_to_their_streams() {
        let a = Stream::new(Uuid::new_v4(), "Order", Utc::now());
        let b = Stream::new(Uuid::new_v4(), "Order", Utc::now());
        let events = vec![recorded(a.id, 1), recorded(b.id, 1), recorded(a.id, 2)];

        let streams = hydrate(vec![a.clone(), b.clone()], events);

        assert_eq!(streams[0].id, a.id);
        assert_eq!(streams[0].events.len(), 2);
        assert_eq!(streams[0].events[1].version(), 2);
        assert_eq!(streams[1].events.len(), 1);
    }

    #[test]
    fn test_version_taken_reports_stored_version() {
        let id = Uuid::new_v4();

        let err = version_taken(id, &recorded(id, i64::MIN), 3);

        assert!(matches!(
            err,
            StoreError::ConcurrencyConflict { stream_id, expected: i64::MIN, observed: 3 }
                if stream_id == id
        ));
    }

    #[test]
    fn test_is_unique_violation_ignores_other_errors() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_expect_row_reports_missing() {
        let id = Uuid::new_v4();

        assert!(expect_row(1, StoreError::StreamNotFound(id)).is_ok());
        assert!(matches!(
            expect_row(0, StoreError::StreamNotFound(id)),
            Err(StoreError::StreamNotFound(found)) if found == id
        ));
    }
}
