//! Test repositories — `EventRepository` implementations for tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tally_core::clock::{Clock, SystemClock};
use tally_core::error::StoreError;
use tally_core::event::Event;
use tally_core::repository::{EventRepository, RepositoryTransaction};
use tally_core::stream::Stream;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Default, Clone)]
struct Tables {
    /// Stream rows (no events) in creation order.
    streams: Vec<Stream>,
    /// Event rows in append order.
    events: Vec<Event>,
}

impl Tables {
    fn stream(&self, stream_id: Uuid) -> Result<&Stream, StoreError> {
        self.streams
            .iter()
            .find(|s| s.id == stream_id)
            .ok_or(StoreError::StreamNotFound(stream_id))
    }

    fn stream_mut(&mut self, stream_id: Uuid) -> Result<&mut Stream, StoreError> {
        self.streams
            .iter_mut()
            .find(|s| s.id == stream_id)
            .ok_or(StoreError::StreamNotFound(stream_id))
    }

    fn events_of(&self, stream_id: Uuid) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .events
            .iter()
            .filter(|e| e.stream_id() == Some(stream_id))
            .cloned()
            .collect();
        events.sort_by_key(Event::version);
        events
    }

    fn hydrate(&self, row: &Stream) -> Stream {
        let mut stream = row.clone();
        stream.events = self.events_of(row.id);
        stream
    }
}

/// An in-memory event repository with real transaction semantics: a
/// transaction holds the table lock from `begin` until commit or rollback,
/// so concurrent writers are serialized, and works on a staged copy that
/// only replaces the tables on commit.
#[derive(Debug, Clone)]
pub struct InMemoryEventRepository {
    tables: Arc<Mutex<Tables>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryEventRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventRepository {
    /// Creates an empty repository stamping times from the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty repository stamping times from `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            clock,
        }
    }

    /// Number of stored event rows.
    pub async fn event_count(&self) -> usize {
        self.tables.lock().await.events.len()
    }

    /// Number of stored stream rows.
    pub async fn stream_count(&self) -> usize {
        self.tables.lock().await.streams.len()
    }
}

#[async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn create_stream(&self, stream_type: &str) -> Result<Stream, StoreError> {
        let stream = Stream::new(Uuid::new_v4(), stream_type, self.clock.now());
        self.tables.lock().await.streams.push(stream.clone());
        Ok(stream)
    }

    async fn get_stream(&self, stream_id: Uuid) -> Result<Stream, StoreError> {
        let tables = self.tables.lock().await;
        let row = tables.stream(stream_id)?;
        Ok(tables.hydrate(row))
    }

    async fn get_streams(&self) -> Result<Vec<Stream>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.streams.iter().map(|row| tables.hydrate(row)).collect())
    }

    async fn get_streams_by_type(&self, stream_type: &str) -> Result<Vec<Stream>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .streams
            .iter()
            .filter(|row| row.stream_type == stream_type)
            .map(|row| tables.hydrate(row))
            .collect())
    }

    async fn get_events_by_stream(&self, stream_id: Uuid) -> Result<Vec<Event>, StoreError> {
        let tables = self.tables.lock().await;
        tables.stream(stream_id)?;
        Ok(tables.events_of(stream_id))
    }

    async fn get_events(&self) -> Result<Vec<Event>, StoreError> {
        Ok(self.tables.lock().await.events.clone())
    }

    async fn get_version_for_stream(&self, stream_id: Uuid) -> Result<i64, StoreError> {
        Ok(self.tables.lock().await.stream(stream_id)?.version)
    }

    async fn begin(&self) -> Result<Box<dyn RepositoryTransaction>, StoreError> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let staged = (*guard).clone();
        Ok(Box::new(InMemoryTransaction { guard, staged }))
    }
}

struct InMemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
}

#[async_trait]
impl RepositoryTransaction for InMemoryTransaction {
    async fn lock_stream(&mut self, stream_id: Uuid) -> Result<Stream, StoreError> {
        self.staged.stream(stream_id).cloned()
    }

    async fn push(&mut self, event: &Event) -> Result<(), StoreError> {
        let stream_id = event.stream_id().ok_or_else(|| {
            StoreError::Validation(format!("event {} has no stream", event.id()))
        })?;
        let stream = self.staged.stream(stream_id)?;
        if self.staged.events.iter().any(|e| e.id() == event.id()) {
            return Err(StoreError::Storage(format!(
                "duplicate event id {}",
                event.id()
            )));
        }
        if self
            .staged
            .events
            .iter()
            .any(|e| e.stream_id() == Some(stream_id) && e.version() == event.version())
        {
            return Err(StoreError::ConcurrencyConflict {
                stream_id,
                expected: event.version().saturating_sub(1),
                observed: stream.version,
            });
        }
        self.staged.events.push(event.clone());
        Ok(())
    }

    async fn increment_stream(
        &mut self,
        stream_id: Uuid,
        next_version: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let stream = self.staged.stream_mut(stream_id)?;
        stream.version = next_version;
        stream.updated_at = Some(updated_at);
        Ok(())
    }

    async fn delete_event(&mut self, event_id: Uuid) -> Result<(), StoreError> {
        let index = self
            .staged
            .events
            .iter()
            .position(|e| e.id() == event_id)
            .ok_or(StoreError::EventNotFound(event_id))?;
        self.staged.events.remove(index);
        Ok(())
    }

    async fn delete_stream(&mut self, stream_id: Uuid) -> Result<(), StoreError> {
        self.staged.stream(stream_id)?;
        if self
            .staged
            .events
            .iter()
            .any(|e| e.stream_id() == Some(stream_id))
        {
            return Err(StoreError::Storage(format!(
                "stream {stream_id} still has events"
            )));
        }
        self.staged.streams.retain(|s| s.id != stream_id);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

/// An event repository that always returns a storage error. Useful for
/// testing error-handling paths.
#[derive(Debug)]
pub struct FailingEventRepository;

fn refused<T>() -> Result<T, StoreError> {
    Err(StoreError::Storage("connection refused".into()))
}

#[async_trait]
impl EventRepository for FailingEventRepository {
    async fn create_stream(&self, _stream_type: &str) -> Result<Stream, StoreError> {
        refused()
    }

    async fn get_stream(&self, _stream_id: Uuid) -> Result<Stream, StoreError> {
        refused()
    }

    async fn get_streams(&self) -> Result<Vec<Stream>, StoreError> {
        refused()
    }

    async fn get_streams_by_type(&self, _stream_type: &str) -> Result<Vec<Stream>, StoreError> {
        refused()
    }

    async fn get_events_by_stream(&self, _stream_id: Uuid) -> Result<Vec<Event>, StoreError> {
        refused()
    }

    async fn get_events(&self) -> Result<Vec<Event>, StoreError> {
        refused()
    }

    async fn get_version_for_stream(&self, _stream_id: Uuid) -> Result<i64, StoreError> {
        refused()
    }

    async fn begin(&self) -> Result<Box<dyn RepositoryTransaction>, StoreError> {
        refused()
    }
}
