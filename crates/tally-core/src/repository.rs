//! Event repository abstraction.
//!
//! The repository is pure persistence: it stores and loads streams and
//! events and never checks versions itself. Consistency is the
//! [`EventStore`](crate::store::EventStore)'s job, which runs its checks
//! inside a [`RepositoryTransaction`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::Event;
use crate::stream::Stream;

/// Repository trait for creating streams and loading, appending and deleting
/// events.
///
/// Every lookup by id fails with `StreamNotFound` / `EventNotFound` when the
/// id does not exist rather than returning an empty value.
#[async_trait]
pub trait EventRepository: Send + Sync + std::fmt::Debug {
    /// Allocates and persists a new stream at version 0.
    async fn create_stream(&self, stream_type: &str) -> Result<Stream, StoreError>;

    /// Loads a stream with all of its events ordered by version.
    async fn get_stream(&self, stream_id: Uuid) -> Result<Stream, StoreError>;

    /// Loads every stream, hydrated, in creation order.
    async fn get_streams(&self) -> Result<Vec<Stream>, StoreError>;

    /// Loads every stream of the given type, hydrated, in creation order.
    async fn get_streams_by_type(&self, stream_type: &str) -> Result<Vec<Stream>, StoreError>;

    /// Loads a stream's events ordered by ascending version.
    async fn get_events_by_stream(&self, stream_id: Uuid) -> Result<Vec<Event>, StoreError>;

    /// Loads every event across all streams in global append order.
    async fn get_events(&self) -> Result<Vec<Event>, StoreError>;

    /// Returns the stored version of a stream (0 if it has no events).
    async fn get_version_for_stream(&self, stream_id: Uuid) -> Result<i64, StoreError>;

    /// Opens a storage transaction.
    async fn begin(&self) -> Result<Box<dyn RepositoryTransaction>, StoreError>;

    /// Persists an event row exactly as given.
    async fn push(&self, event: &Event) -> Result<Event, StoreError> {
        let mut tx = self.begin().await?;
        tx.push(event).await?;
        tx.commit().await?;
        Ok(event.clone())
    }

    /// Sets a stream's stored version.
    async fn increment_stream(
        &self,
        stream_id: Uuid,
        next_version: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        tx.increment_stream(stream_id, next_version, updated_at)
            .await?;
        tx.commit().await
    }

    /// Hard-deletes an event row.
    async fn delete_event(&self, event_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        tx.delete_event(event_id).await?;
        tx.commit().await
    }

    /// Hard-deletes a stream row.
    async fn delete_stream(&self, stream_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        tx.delete_stream(stream_id).await?;
        tx.commit().await
    }
}

/// A storage transaction. Dropping it without calling `commit` discards
/// every change made through it.
#[async_trait]
pub trait RepositoryTransaction: Send {
    /// Loads a stream row (without events) and holds the backend's write lock
    /// on it until the transaction ends.
    async fn lock_stream(&mut self, stream_id: Uuid) -> Result<Stream, StoreError>;

    /// Inserts an event row.
    async fn push(&mut self, event: &Event) -> Result<(), StoreError>;

    /// Sets the stream's stored version and `updated_at`.
    async fn increment_stream(
        &mut self,
        stream_id: Uuid,
        next_version: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Deletes an event row.
    async fn delete_event(&mut self, event_id: Uuid) -> Result<(), StoreError>;

    /// Deletes a stream row.
    async fn delete_stream(&mut self, stream_id: Uuid) -> Result<(), StoreError>;

    /// Makes every change durable.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discards every change.
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
