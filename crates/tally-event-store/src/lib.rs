//! Tally — sqlx-backed event repositories.
//!
//! [`SqliteEventRepository`] and [`PgEventRepository`] persist streams and
//! events; [`connect`] picks one from a [`StoreConfig`].

pub mod config;
pub mod pg_event_repository;
pub mod schema;
pub mod sqlite_event_repository;

mod sql;

pub use config::{Backend, ConfigError, StoreConfig, connect};
pub use pg_event_repository::PgEventRepository;
pub use sqlite_event_repository::SqliteEventRepository;
