//! `SQLite` implementation of the `EventRepository` trait.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tally_core::clock::{Clock, SystemClock};
use tally_core::error::StoreError;
use tally_core::event::{Event, EventRecord, decode_payload, encode_payload};
use tally_core::repository::{EventRepository, RepositoryTransaction};
use tally_core::stream::Stream;
use uuid::Uuid;

use crate::schema::SQLITE_SCHEMA;
use crate::sql::{expect_row, hydrate, is_unique_violation, storage, version_taken};

const STREAM_COLUMNS: &str = "id, type, version, created_at, updated_at";
const EVENT_COLUMNS: &str = "id, stream_id, type, payload, version, occured_at, recorded_at";

/// SQLite-backed event repository.
///
/// For `sqlite::memory:` the pool must hold exactly one connection that is
/// never recycled, otherwise each connection sees its own empty database.
#[derive(Debug, Clone)]
pub struct SqliteEventRepository {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteEventRepository {
    /// Creates a new `SqliteEventRepository`.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock used to stamp `created_at`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the `streams` and `events` tables and their indexes if they do
    /// not exist. All statements run in one transaction.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Storage` if any statement fails; nothing is
    /// created in that case.
    pub async fn ensure_tables(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        for statement in SQLITE_SCHEMA {
            if let Err(err) = sqlx::query(statement).execute(&mut *tx).await {
                tracing::error!(error = %err, "schema setup failed; rolling back");
                tx.rollback().await.map_err(storage)?;
                return Err(storage(err));
            }
        }
        tx.commit().await.map_err(storage)?;
        tracing::debug!("sqlite schema ready");
        Ok(())
    }
}

async fn find_stream(conn: &mut SqliteConnection, stream_id: Uuid) -> Result<Stream, StoreError> {
    let row = sqlx::query(&format!("SELECT {STREAM_COLUMNS} FROM streams WHERE id = ?"))
        .bind(stream_id)
        .fetch_optional(conn)
        .await
        .map_err(storage)?
        .ok_or(StoreError::StreamNotFound(stream_id))?;
    stream_from_row(&row)
}

async fn load_events(conn: &mut SqliteConnection, stream_id: Uuid) -> Result<Vec<Event>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE stream_id = ? ORDER BY version"
    ))
    .bind(stream_id)
    .fetch_all(conn)
    .await
    .map_err(storage)?;
    rows.iter().map(event_from_row).collect()
}

fn stream_from_row(row: &SqliteRow) -> Result<Stream, StoreError> {
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(storage)?;
    let mut stream = Stream::new(
        row.try_get("id").map_err(storage)?,
        row.try_get::<String, _>("type").map_err(storage)?,
        created_at,
    );
    stream.version = row.try_get("version").map_err(storage)?;
    stream.updated_at = row.try_get("updated_at").map_err(storage)?;
    Ok(stream)
}

fn event_from_row(row: &SqliteRow) -> Result<Event, StoreError> {
    let payload: String = row.try_get("payload").map_err(storage)?;
    Ok(Event::from(EventRecord {
        id: row.try_get("id").map_err(storage)?,
        stream_id: row.try_get("stream_id").map_err(storage)?,
        event_type: row.try_get("type").map_err(storage)?,
        payload: decode_payload(&payload)?,
        version: row.try_get("version").map_err(storage)?,
        occurred_at: row.try_get("occured_at").map_err(storage)?,
        recorded_at: row.try_get("recorded_at").map_err(storage)?,
    }))
}

#[async_trait]
impl EventRepository for SqliteEventRepository {
    async fn create_stream(&self, stream_type: &str) -> Result<Stream, StoreError> {
        let stream = Stream::new(Uuid::new_v4(), stream_type, self.clock.now());
        sqlx::query("INSERT INTO streams (id, type, version, created_at) VALUES (?, ?, 0, ?)")
            .bind(stream.id)
            .bind(&stream.stream_type)
            .bind(stream.created_at)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(stream)
    }

    async fn get_stream(&self, stream_id: Uuid) -> Result<Stream, StoreError> {
        // One read transaction, so the row and its events share a snapshot.
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let mut stream = find_stream(&mut tx, stream_id).await?;
        stream.events = load_events(&mut tx, stream_id).await?;
        tx.commit().await.map_err(storage)?;
        Ok(stream)
    }

    async fn get_streams(&self) -> Result<Vec<Stream>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let rows = sqlx::query(&format!("SELECT {STREAM_COLUMNS} FROM streams ORDER BY rowid"))
            .fetch_all(&mut *tx)
            .await
            .map_err(storage)?;
        let streams = rows
            .iter()
            .map(stream_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events ORDER BY stream_id, version"
        ))
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        let events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(hydrate(streams, events))
    }

    async fn get_streams_by_type(&self, stream_type: &str) -> Result<Vec<Stream>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let rows = sqlx::query(&format!(
            "SELECT {STREAM_COLUMNS} FROM streams WHERE type = ? ORDER BY rowid"
        ))
        .bind(stream_type)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;
        let streams = rows
            .iter()
            .map(stream_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let rows = sqlx::query(
            "SELECT e.id, e.stream_id, e.type, e.payload, e.version, e.occured_at, e.recorded_at \
             FROM events e JOIN streams s ON s.id = e.stream_id \
             WHERE s.type = ? ORDER BY e.stream_id, e.version",
        )
        .bind(stream_type)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        let events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(hydrate(streams, events))
    }

    async fn get_events_by_stream(&self, stream_id: Uuid) -> Result<Vec<Event>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        find_stream(&mut tx, stream_id).await?;
        let events = load_events(&mut tx, stream_id).await?;
        tx.commit().await.map_err(storage)?;
        Ok(events)
    }

    async fn get_events(&self) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY rowid"))
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn get_version_for_stream(&self, stream_id: Uuid) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>("SELECT version FROM streams WHERE id = ?")
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or(StoreError::StreamNotFound(stream_id))
    }

    async fn begin(&self) -> Result<Box<dyn RepositoryTransaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(storage)?;
        Ok(Box::new(SqliteStoreTransaction { tx }))
    }
}

/// A `RepositoryTransaction` over one SQLite transaction.
struct SqliteStoreTransaction {
    tx: Transaction<'static, Sqlite>,
}

impl SqliteStoreTransaction {
    fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }
}

#[async_trait]
impl RepositoryTransaction for SqliteStoreTransaction {
    async fn lock_stream(&mut self, stream_id: Uuid) -> Result<Stream, StoreError> {
        // A no-op write takes the database's reserved lock before the read.
        let touched = sqlx::query("UPDATE streams SET version = version WHERE id = ?")
            .bind(stream_id)
            .execute(self.conn())
            .await
            .map_err(storage)?;
        expect_row(touched.rows_affected(), StoreError::StreamNotFound(stream_id))?;

        find_stream(self.conn(), stream_id).await
    }

    async fn push(&mut self, event: &Event) -> Result<(), StoreError> {
        let stream_id = event.stream_id().ok_or_else(|| {
            StoreError::Validation(format!("event {} has no stream", event.id()))
        })?;
        let recorded_at = event.recorded_at().ok_or_else(|| {
            StoreError::Validation(format!("event {} has not been recorded", event.id()))
        })?;
        let payload = encode_payload(event.payload())?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO events ({EVENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(event.id())
        .bind(stream_id)
        .bind(event.event_type())
        .bind(payload)
        .bind(event.version())
        .bind(event.occurred_at())
        .bind(recorded_at)
        .execute(self.conn())
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                let observed = sqlx::query_scalar::<_, i64>("SELECT version FROM streams WHERE id = ?")
                    .bind(stream_id)
                    .fetch_one(self.conn())
                    .await
                    .map_err(storage)?;
                Err(version_taken(stream_id, event, observed))
            }
            Err(err) => Err(storage(err)),
        }
    }

    async fn increment_stream(
        &mut self,
        stream_id: Uuid,
        next_version: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE streams SET version = ?, updated_at = ? WHERE id = ?")
            .bind(next_version)
            .bind(updated_at)
            .bind(stream_id)
            .execute(self.conn())
            .await
            .map_err(storage)?;
        expect_row(result.rows_affected(), StoreError::StreamNotFound(stream_id))
    }

    async fn delete_event(&mut self, event_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM events WHERE id = ?")
            .bind(event_id)
            .execute(self.conn())
            .await
            .map_err(storage)?;
        expect_row(result.rows_affected(), StoreError::EventNotFound(event_id))
    }

    async fn delete_stream(&mut self, stream_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM streams WHERE id = ?")
            .bind(stream_id)
            .execute(self.conn())
            .await
            .map_err(storage)?;
        expect_row(result.rows_affected(), StoreError::StreamNotFound(stream_id))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self { tx } = *self;
        tx.commit().await.map_err(storage)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let Self { tx } = *self;
        tx.rollback().await.map_err(storage)
    }
}
