//! Event store database schema.
//!
//! Each backend's statements run in order inside one transaction. Every
//! statement is idempotent. The `occured_at` spelling matches existing
//! databases.

/// SQLite tables and indexes. Streams and global event order follow `rowid`.
pub const SQLITE_SCHEMA: &[&str] = &[
    r"
CREATE TABLE IF NOT EXISTS streams (
    id          BLOB PRIMARY KEY NOT NULL,
    type        TEXT NOT NULL,
    version     INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL,
    updated_at  TEXT
)",
    r"
CREATE TABLE IF NOT EXISTS events (
    id           BLOB PRIMARY KEY NOT NULL,
    stream_id    BLOB NOT NULL REFERENCES streams (id),
    type         TEXT NOT NULL,
    payload      TEXT NOT NULL,
    version      INTEGER NOT NULL,
    occured_at   TEXT NOT NULL,
    recorded_at  TEXT NOT NULL,
    UNIQUE (stream_id, version)
)",
    "CREATE INDEX IF NOT EXISTS idx_streams_type ON streams (type)",
    "CREATE INDEX IF NOT EXISTS idx_events_stream_id ON events (stream_id)",
];

/// PostgreSQL tables and indexes. `seq` and `global_position` record
/// creation and append order.
pub const POSTGRES_SCHEMA: &[&str] = &[
    r"
CREATE TABLE IF NOT EXISTS streams (
    id          UUID PRIMARY KEY,
    seq         BIGSERIAL NOT NULL,
    type        VARCHAR(255) NOT NULL,
    version     BIGINT NOT NULL DEFAULT 0,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ
)",
    r"
CREATE TABLE IF NOT EXISTS events (
    id               UUID PRIMARY KEY,
    global_position  BIGSERIAL NOT NULL,
    stream_id        UUID NOT NULL REFERENCES streams (id),
    type             VARCHAR(255) NOT NULL,
    payload          JSONB NOT NULL,
    version          BIGINT NOT NULL,
    occured_at       TIMESTAMPTZ NOT NULL,
    recorded_at      TIMESTAMPTZ NOT NULL,
    UNIQUE (stream_id, version)
)",
    "CREATE INDEX IF NOT EXISTS idx_streams_type ON streams (type)",
    "CREATE INDEX IF NOT EXISTS idx_events_stream_id ON events (stream_id)",
];
