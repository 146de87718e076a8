//! `PostgreSQL` implementation of the `EventRepository` trait.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tally_core::clock::{Clock, SystemClock};
use tally_core::error::StoreError;
use tally_core::event::{Event, EventRecord, encode_payload, payload_from_value};
use tally_core::repository::{EventRepository, RepositoryTransaction};
use tally_core::stream::Stream;
use uuid::Uuid;

use crate::schema::POSTGRES_SCHEMA;
use crate::sql::{expect_row, hydrate, is_unique_violation, storage, version_taken};

const STREAM_COLUMNS: &str = "id, type, version, created_at, updated_at";
const EVENT_COLUMNS: &str = "id, stream_id, type, payload, version, occured_at, recorded_at";

/// PostgreSQL-backed event repository.
#[derive(Debug, Clone)]
pub struct PgEventRepository {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgEventRepository {
    /// Creates a new `PgEventRepository`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
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

    /// Creates the `streams` and `events` tables and their indexes if they do
    /// not exist, in one transaction.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Storage` if any statement fails.
    pub async fn ensure_tables(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        for statement in POSTGRES_SCHEMA {
            if let Err(err) = sqlx::query(statement).execute(&mut *tx).await {
                tracing::error!(error = %err, "schema setup failed; rolling back");
                tx.rollback().await.map_err(storage)?;
                return Err(storage(err));
            }
        }
        tx.commit().await.map_err(storage)?;
        tracing::debug!("postgres schema ready");
        Ok(())
    }

    /// Opens a read transaction whose statements all see one snapshot.
    async fn snapshot(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        Ok(tx)
    }
}

async fn find_stream(conn: &mut PgConnection, stream_id: Uuid) -> Result<Stream, StoreError> {
    let row = sqlx::query(&format!("SELECT {STREAM_COLUMNS} FROM streams WHERE id = $1"))
        .bind(stream_id)
        .fetch_optional(conn)
        .await
        .map_err(storage)?
        .ok_or(StoreError::StreamNotFound(stream_id))?;
    stream_from_row(&row)
}

async fn load_events(conn: &mut PgConnection, stream_id: Uuid) -> Result<Vec<Event>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE stream_id = $1 ORDER BY version"
    ))
    .bind(stream_id)
    .fetch_all(conn)
    .await
    .map_err(storage)?;
    rows.iter().map(event_from_row).collect()
}

fn stream_from_row(row: &PgRow) -> Result<Stream, StoreError> {
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

fn event_from_row(row: &PgRow) -> Result<Event, StoreError> {
    let payload: Value = row.try_get("payload").map_err(storage)?;
    Ok(Event::from(EventRecord {
        id: row.try_get("id").map_err(storage)?,
        stream_id: row.try_get("stream_id").map_err(storage)?,
        event_type: row.try_get("type").map_err(storage)?,
        payload: payload_from_value(payload)?,
        version: row.try_get("version").map_err(storage)?,
        occurred_at: row.try_get("occured_at").map_err(storage)?,
        recorded_at: row.try_get("recorded_at").map_err(storage)?,
    }))
}

#[async_trait]
impl EventRepository for PgEventRepository {
    async fn create_stream(&self, stream_type: &str) -> Result<Stream, StoreError> {
        let stream = Stream::new(Uuid::new_v4(), stream_type, self.clock.now());
        sqlx::query("INSERT INTO streams (id, type, version, created_at) VALUES ($1, $2, 0, $3)")
            .bind(stream.id)
            .bind(&stream.stream_type)
            .bind(stream.created_at)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(stream)
    }

    async fn get_stream(&self, stream_id: Uuid) -> Result<Stream, StoreError> {
        let mut tx = self.snapshot().await?;
        let mut stream = find_stream(&mut tx, stream_id).await?;
        stream.events = load_events(&mut tx, stream_id).await?;
        tx.commit().await.map_err(storage)?;
        Ok(stream)
    }

    async fn get_streams(&self) -> Result<Vec<Stream>, StoreError> {
        let mut tx = self.snapshot().await?;
        let rows = sqlx::query(&format!("SELECT {STREAM_COLUMNS} FROM streams ORDER BY seq"))
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
        let mut tx = self.snapshot().await?;
        let rows = sqlx::query(&format!(
            "SELECT {STREAM_COLUMNS} FROM streams WHERE type = $1 ORDER BY seq"
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
             WHERE s.type = $1 ORDER BY e.stream_id, e.version",
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
        let mut tx = self.snapshot().await?;
        find_stream(&mut tx, stream_id).await?;
        let events = load_events(&mut tx, stream_id).await?;
        tx.commit().await.map_err(storage)?;
        Ok(events)
    }

    async fn get_events(&self) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events ORDER BY global_position"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn get_version_for_stream(&self, stream_id: Uuid) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>("SELECT version FROM streams WHERE id = $1")
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or(StoreError::StreamNotFound(stream_id))
    }

    async fn begin(&self) -> Result<Box<dyn RepositoryTransaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(storage)?;
        Ok(Box::new(PgStoreTransaction {
            tx,
            pool: self.pool.clone(),
        }))
    }
}

/// A `RepositoryTransaction` over one PostgreSQL transaction.
struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
    // A failed statement aborts `tx`; follow-up reads go through the pool.
    pool: PgPool,
}

impl PgStoreTransaction {
    fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

#[async_trait]
impl RepositoryTransaction for PgStoreTransaction {
    async fn lock_stream(&mut self, stream_id: Uuid) -> Result<Stream, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STREAM_COLUMNS} FROM streams WHERE id = $1 FOR UPDATE"
        ))
        .bind(stream_id)
        .fetch_optional(self.conn())
        .await
        .map_err(storage)?
        .ok_or(StoreError::StreamNotFound(stream_id))?;
        stream_from_row(&row)
    }

    async fn push(&mut self, event: &Event) -> Result<(), StoreError> {
        let stream_id = event.stream_id().ok_or_else(|| {
            StoreError::Validation(format!("event {} has no stream", event.id()))
        })?;
        let recorded_at = event.recorded_at().ok_or_else(|| {
            StoreError::Validation(format!("event {} has not been recorded", event.id()))
        })?;
        // Validates the payload the same way the SQLite text column does.
        encode_payload(event.payload())?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO events ({EVENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
        ))
        .bind(event.id())
        .bind(stream_id)
        .bind(event.event_type())
        .bind(Value::Object(event.payload().clone()))
        .bind(event.version())
        .bind(event.occurred_at())
        .bind(recorded_at)
        .execute(self.conn())
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                let observed = sqlx::query_scalar::<_, i64>("SELECT version FROM streams WHERE id = $1")
                    .bind(stream_id)
                    .fetch_one(&self.pool)
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
        let result = sqlx::query("UPDATE streams SET version = $1, updated_at = $2 WHERE id = $3")
            .bind(next_version)
            .bind(updated_at)
            .bind(stream_id)
            .execute(self.conn())
            .await
            .map_err(storage)?;
        expect_row(result.rows_affected(), StoreError::StreamNotFound(stream_id))
    }

    async fn delete_event(&mut self, event_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM events WHERE id = $1")
            .bind(event_id)
            .execute(self.conn())
            .await
            .map_err(storage)?;
        expect_row(result.rows_affected(), StoreError::EventNotFound(event_id))
    }

    async fn delete_stream(&mut self, stream_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM streams WHERE id = $1")
            .bind(stream_id)
            .execute(self.conn())
            .await
            .map_err(storage)?;
        expect_row(result.rows_affected(), StoreError::StreamNotFound(stream_id))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self { tx, .. } = *self;
        tx.commit().await.map_err(storage)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let Self { tx, .. } = *self;
        tx.rollback().await.map_err(storage)
    }
}
