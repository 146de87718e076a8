//! Tally Core — events, streams, projections and the append protocol.
//!
//! This crate defines the event and stream data types, the repository
//! boundary every storage backend implements, the projection engine, and
//! the `EventStore` that ties them together. It contains no storage driver
//! code; see `tally-event-store` for the sqlx-backed repositories.

pub mod clock;
pub mod error;
pub mod event;
pub mod projection;
pub mod repository;
pub mod store;
pub mod stream;

pub use error::StoreError;
pub use event::{Event, EventRecord, Payload};
pub use projection::{
    HandlerError, LiveProjection, Projection, ProjectionBuilder, ProjectionFailure,
    ProjectionStatus, ProjectionTarget, Replay, Subscriber,
};
pub use repository::{EventRepository, RepositoryTransaction};
pub use store::{EventStore, ReplayReport};
pub use stream::Stream;
