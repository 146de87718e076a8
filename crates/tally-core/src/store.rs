//! The event store: append protocol, corrective operations, and replay.
//!
//! `push` runs the optimistic concurrency check, the event insert and the
//! version bump in one repository transaction, then publishes the recorded
//! event to every matching live projection in registration order.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use indexmap::IndexMap;
use tracing::instrument;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::event::{Event, encode_payload};
use crate::projection::{
    LiveProjection, Projection, ProjectionFailure, ProjectionTarget, Replay, Subscriber,
};
use crate::repository::{EventRepository, RepositoryTransaction};
use crate::stream::Stream;

struct Subscription {
    target: ProjectionTarget,
    subscriber: Arc<dyn Subscriber>,
}

/// Outcome of [`EventStore::replay_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Number of stored events re-driven through the publish path.
    pub events: usize,
    /// Projections that broke during the replay.
    pub failures: Vec<ProjectionFailure>,
}

/// Orchestrates an [`EventRepository`] and the registered projections.
pub struct EventStore {
    repository: Arc<dyn EventRepository>,
    clock: Arc<dyn Clock>,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl EventStore {
    /// Creates a store over `repository` using the system clock.
    #[must_use]
    pub fn new(repository: Arc<dyn EventRepository>) -> Self {
        Self {
            repository,
            clock: Arc::new(SystemClock),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    /// Replaces the clock used to stamp `recorded_at` and `updated_at`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The underlying repository.
    #[must_use]
    pub fn repository(&self) -> &Arc<dyn EventRepository> {
        &self.repository
    }

    /// Registers a projection to receive appended events and returns a handle
    /// for reading its state.
    pub fn subscribe<S>(&self, projection: Projection<S>) -> LiveProjection<S>
    where
        S: Clone + Send + 'static,
    {
        let live = LiveProjection::new(projection);
        self.register(Arc::new(live.clone()));
        live
    }

    /// Registers a custom subscriber.
    pub fn register(&self, subscriber: Arc<dyn Subscriber>) {
        let target = subscriber.target().clone();
        tracing::debug!(subscriber_id = %subscriber.id(), %target, "registered projection");
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription { target, subscriber });
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Creates a new, empty stream.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Storage` if the backend fails.
    #[instrument(skip(self))]
    pub async fn create_stream(&self, stream_type: &str) -> Result<Stream, StoreError> {
        let stream = self.repository.create_stream(stream_type).await?;
        tracing::info!(stream_id = %stream.id, stream_type, "created stream");
        Ok(stream)
    }

    /// Loads a stream with its events.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::StreamNotFound` if the stream does not exist.
    pub async fn get_stream(&self, stream_id: Uuid) -> Result<Stream, StoreError> {
        self.repository.get_stream(stream_id).await
    }

    /// Loads every stream.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Storage` if the backend fails.
    pub async fn get_streams(&self) -> Result<Vec<Stream>, StoreError> {
        self.repository.get_streams().await
    }

    /// Loads every stream of a type in creation order.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Storage` if the backend fails.
    pub async fn get_streams_by_type(&self, stream_type: &str) -> Result<Vec<Stream>, StoreError> {
        self.repository.get_streams_by_type(stream_type).await
    }

    /// Loads a stream's events ordered by version.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::StreamNotFound` if the stream does not exist.
    pub async fn get_events_by_stream(&self, stream_id: Uuid) -> Result<Vec<Event>, StoreError> {
        self.repository.get_events_by_stream(stream_id).await
    }

    /// Loads every event in global append order.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Storage` if the backend fails.
    pub async fn get_events(&self) -> Result<Vec<Event>, StoreError> {
        self.repository.get_events().await
    }

    /// Returns a stream's current version.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::StreamNotFound` if the stream does not exist.
    pub async fn get_version_for_stream(&self, stream_id: Uuid) -> Result<i64, StoreError> {
        self.repository.get_version_for_stream(stream_id).await
    }

    /// Appends `event` to a stream.
    ///
    /// The event must carry `version == current stream version + 1`. The
    /// check, the insert and the version bump commit atomically; afterwards
    /// the recorded event is published to every matching projection. A
    /// projection whose handler fails or panics is marked broken and skipped
    /// from then on; the append itself still succeeds.
    ///
    /// # Errors
    ///
    /// - `StoreError::Validation` if the event was already recorded or its
    ///   version is below 1.
    /// - `StoreError::Serialization` if the payload cannot be encoded.
    /// - `StoreError::StreamNotFound` if the stream does not exist.
    /// - `StoreError::ConcurrencyConflict` if the version is stale or ahead.
    /// - `StoreError::Storage` if the backend fails; nothing is persisted.
    #[instrument(skip(self, event), fields(event_type = event.event_type(), version = event.version()))]
    pub async fn push(&self, stream_id: Uuid, mut event: Event) -> Result<Event, StoreError> {
        if event.is_recorded() {
            return Err(StoreError::Validation(format!(
                "event {} has already been recorded",
                event.id()
            )));
        }
        if event.version() < 1 {
            return Err(StoreError::Validation(format!(
                "event {} has version {}; versions start at 1",
                event.id(),
                event.version()
            )));
        }
        encode_payload(event.payload())?;

        let mut tx = self.repository.begin().await?;
        let stream_type = match self.append(tx.as_mut(), stream_id, &mut event).await {
            Ok(stream_type) => {
                tx.commit().await?;
                stream_type
            }
            Err(err) => {
                discard(tx).await;
                if err.is_conflict() {
                    tracing::warn!(%stream_id, error = %err, "rejected stale append");
                }
                return Err(err);
            }
        };

        tracing::info!(%stream_id, event_id = %event.id(), "appended event");
        self.publish(&event, &stream_type);
        Ok(event)
    }

    async fn append(
        &self,
        tx: &mut dyn RepositoryTransaction,
        stream_id: Uuid,
        event: &mut Event,
    ) -> Result<String, StoreError> {
        let stream = tx.lock_stream(stream_id).await?;
        let expected = event.version().saturating_sub(1);
        if stream.version != expected {
            return Err(StoreError::ConcurrencyConflict {
                stream_id,
                expected,
                observed: stream.version,
            });
        }

        event.record(stream_id, self.clock.now());
        let recorded_at = event.recorded_at().unwrap_or_else(|| self.clock.now());
        tx.push(event).await?;
        tx.increment_stream(stream_id, stream.version + 1, recorded_at)
            .await?;
        Ok(stream.stream_type)
    }

    /// Removes the tail event of a stream and decrements its version.
    ///
    /// Only the most recently appended event may be rolled back. For any
    /// other event this is a no-op and returns `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::StreamNotFound` if the stream does not exist,
    /// `StoreError::EventNotFound` if the tail event is not stored, or
    /// `StoreError::Storage` if the backend fails.
    #[instrument(skip(self, event), fields(event_id = %event.id(), version = event.version()))]
    pub async fn rollback(&self, stream_id: Uuid, event: &Event) -> Result<bool, StoreError> {
        let mut tx = self.repository.begin().await?;
        match self.remove_tail(tx.as_mut(), stream_id, event).await {
            Ok(true) => {
                tx.commit().await?;
                tracing::info!(%stream_id, "rolled back tail event");
                Ok(true)
            }
            Ok(false) => {
                discard(tx).await;
                tracing::warn!(%stream_id, "rollback ignored: event is not the stream's tail");
                Ok(false)
            }
            Err(err) => {
                discard(tx).await;
                Err(err)
            }
        }
    }

    async fn remove_tail(
        &self,
        tx: &mut dyn RepositoryTransaction,
        stream_id: Uuid,
        event: &Event,
    ) -> Result<bool, StoreError> {
        let stream = tx.lock_stream(stream_id).await?;
        if event.stream_id() != Some(stream_id)
            || event.version() != stream.version
            || stream.version < 1
        {
            return Ok(false);
        }
        tx.delete_event(event.id()).await?;
        tx.increment_stream(stream_id, stream.version - 1, self.clock.now())
            .await?;
        Ok(true)
    }

    /// Deletes a stream that has never had an event appended.
    ///
    /// For a stream with a non-zero version this is a no-op returning
    /// `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::StreamNotFound` if the stream does not exist or
    /// `StoreError::Storage` if the backend fails.
    #[instrument(skip(self))]
    pub async fn delete_stream(&self, stream_id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.repository.begin().await?;
        let outcome = remove_empty_stream(tx.as_mut(), stream_id).await;

        match outcome {
            Ok(true) => {
                tx.commit().await?;
                tracing::info!(%stream_id, "deleted stream");
                Ok(true)
            }
            Ok(false) => {
                discard(tx).await;
                tracing::warn!(%stream_id, "delete ignored: stream has events");
                Ok(false)
            }
            Err(err) => {
                discard(tx).await;
                Err(err)
            }
        }
    }

    /// Replays stored events through a fresh fork of `projection` and returns
    /// the resulting state. The projection itself is not modified.
    ///
    /// - `Stream(id)`: the stream's events → `Replay::Single`.
    /// - `StreamType(t)`, merged: each stream's events, streams in creation
    ///   order, into one state → `Replay::Single`.
    /// - `StreamType(t)`, separate: one fork per stream → `Replay::PerStream`.
    /// - `Global`: every event in append order → `Replay::Single`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::StreamNotFound` for an unknown target stream,
    /// `StoreError::HandlerFailure` with the position where folding stopped,
    /// or `StoreError::Storage` if the backend fails.
    #[instrument(skip(self, projection), fields(projection_id = %projection.id(), target = %projection.target()))]
    pub async fn exec<S: Clone>(&self, projection: &Projection<S>) -> Result<Replay<S>, StoreError> {
        match projection.target() {
            ProjectionTarget::Stream(stream_id) => {
                let events = self.repository.get_events_by_stream(*stream_id).await?;
                let mut fold = projection.fork();
                fold.fold(&events)?;
                Ok(Replay::Single(fold.into_state()))
            }
            ProjectionTarget::StreamType(stream_type) => {
                let streams = self.repository.get_streams_by_type(stream_type).await?;
                if projection.is_separate() {
                    let mut states = IndexMap::with_capacity(streams.len());
                    for stream in &streams {
                        let mut fold = projection.fork();
                        fold.fold(&stream.events)?;
                        states.insert(stream.id, fold.into_state());
                    }
                    Ok(Replay::PerStream(states))
                } else {
                    let mut fold = projection.fork();
                    fold.fold(streams.iter().flat_map(|stream| stream.events.iter()))?;
                    Ok(Replay::Single(fold.into_state()))
                }
            }
            ProjectionTarget::Global => {
                let events = self.repository.get_events().await?;
                let mut fold = projection.fork();
                fold.fold(&events)?;
                Ok(Replay::Single(fold.into_state()))
            }
        }
    }

    /// Re-drives every stored event, in global append order, through the
    /// publish path without persisting anything. Intended for cold-starting
    /// freshly subscribed (or reset) projections.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Storage` if the backend fails. Handler failures
    /// do not abort the replay; they are collected in the report.
    #[instrument(skip(self))]
    pub async fn replay_all(&self) -> Result<ReplayReport, StoreError> {
        let stream_types: HashMap<Uuid, String> = self
            .repository
            .get_streams()
            .await?
            .into_iter()
            .map(|stream| (stream.id, stream.stream_type))
            .collect();
        let events = self.repository.get_events().await?;

        let mut report = ReplayReport::default();
        for event in &events {
            let stream_type = event
                .stream_id()
                .and_then(|id| stream_types.get(&id))
                .map_or("", String::as_str);
            report.failures.extend(self.publish(event, stream_type));
            report.events += 1;
        }

        tracing::info!(
            events = report.events,
            failures = report.failures.len(),
            "replayed event log"
        );
        Ok(report)
    }

    /// Folds a recorded event into every matching subscriber in registration
    /// order. A failing subscriber is logged and left broken; the rest still
    /// receive the event.
    fn publish(&self, event: &Event, stream_type: &str) -> Vec<ProjectionFailure> {
        let Some(stream_id) = event.stream_id() else {
            return Vec::new();
        };
        let subscriptions = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut failures = Vec::new();
        for subscription in subscriptions
            .iter()
            .filter(|s| s.target.matches(stream_id, stream_type))
        {
            if let Err(err) = subscription.subscriber.project(event) {
                tracing::error!(
                    subscriber_id = %subscription.subscriber.id(),
                    event_id = %event.id(),
                    error = %err,
                    "projection failed; marking it broken"
                );
                if let StoreError::HandlerFailure {
                    projection_id,
                    event_id,
                    position,
                    message,
                } = err
                {
                    failures.push(ProjectionFailure {
                        projection_id,
                        event_id,
                        position,
                        message,
                    });
                }
            }
        }
        failures
    }
}

async fn remove_empty_stream(
    tx: &mut dyn RepositoryTransaction,
    stream_id: Uuid,
) -> Result<bool, StoreError> {
    let stream = tx.lock_stream(stream_id).await?;
    if stream.version != 0 {
        return Ok(false);
    }
    tx.delete_stream(stream_id).await?;
    Ok(true)
}

/// Rolls back a transaction whose work is being abandoned. A rollback
/// failure is logged; the original outcome is what the caller sees.
async fn discard(tx: Box<dyn RepositoryTransaction>) {
    if let Err(err) = tx.rollback().await {
        tracing::warn!(error = %err, "transaction rollback failed");
    }
}

impl fmt::Debug for EventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStore")
            .field("repository", &self.repository)
            .field("clock", &self.clock)
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}
