//! Projections: pure folds deriving state from event sequences.
//!
//! A [`Projection`] maps event types to reducers and folds events into an
//! accumulated state. It is addressed by stream id, by stream type, or
//! globally through its [`ProjectionTarget`]. Event types without a handler
//! are skipped and do not advance the position.
//!
//! Handler failures, including panics, mark the projection
//! [`ProjectionStatus::Broken`]; a broken projection skips every later event
//! until it is reset.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;
use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::Event;

/// Error type returned by fallible handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Handler<S> = Arc<dyn Fn(&S, &Event) -> Result<S, HandlerError> + Send + Sync>;

/// Selects which events a projection receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ProjectionTarget {
    /// Events of one stream.
    Stream(Uuid),
    /// Events of every stream with this type.
    StreamType(String),
    /// Every event.
    Global,
}

impl ProjectionTarget {
    /// Returns `true` if an event of the given stream should reach this target.
    #[must_use]
    pub fn matches(&self, stream_id: Uuid, stream_type: &str) -> bool {
        match self {
            Self::Stream(id) => *id == stream_id,
            Self::StreamType(name) => name == stream_type,
            Self::Global => true,
        }
    }
}

impl fmt::Display for ProjectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream(id) => write!(f, "stream:{id}"),
            Self::StreamType(name) => write!(f, "type:{name}"),
            Self::Global => f.write_str("global"),
        }
    }
}

/// Lifecycle of a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProjectionStatus {
    /// Constructed or reset; nothing folded yet.
    Ready,
    /// Folding normally.
    Ok,
    /// A handler failed; later events are skipped until reset.
    Broken,
}

/// Where and why a projection broke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionFailure {
    /// The failing projection.
    pub projection_id: Uuid,
    /// The event whose handler failed.
    pub event_id: Uuid,
    /// Events folded successfully before the failure.
    pub position: u64,
    /// The handler's error message.
    pub message: String,
}

impl From<ProjectionFailure> for StoreError {
    fn from(failure: ProjectionFailure) -> Self {
        Self::HandlerFailure {
            projection_id: failure.projection_id,
            event_id: failure.event_id,
            position: failure.position,
            message: failure.message,
        }
    }
}

/// A fold over events, dispatching on the event type.
pub struct Projection<S> {
    id: Uuid,
    target: ProjectionTarget,
    separate: bool,
    handlers: Arc<HashMap<String, Handler<S>>>,
    initial_state: S,
    state: S,
    position: u64,
    status: ProjectionStatus,
    failure: Option<ProjectionFailure>,
}

impl<S: Clone + Default> Projection<S> {
    /// Starts building a projection over one stream.
    #[must_use]
    pub fn for_stream(stream_id: Uuid) -> ProjectionBuilder<S> {
        ProjectionBuilder::new(ProjectionTarget::Stream(stream_id))
    }

    /// Starts building a projection over every stream of a type.
    #[must_use]
    pub fn for_stream_type(stream_type: impl Into<String>) -> ProjectionBuilder<S> {
        ProjectionBuilder::new(ProjectionTarget::StreamType(stream_type.into()))
    }

    /// Starts building a projection over every event.
    #[must_use]
    pub fn global() -> ProjectionBuilder<S> {
        ProjectionBuilder::new(ProjectionTarget::Global)
    }
}

impl<S: Clone> Projection<S> {
    /// Folds one event. Returns `Ok(true)` if a handler ran and `Ok(false)`
    /// if the event was skipped (no handler, or the projection is broken).
    ///
    /// # Errors
    ///
    /// Returns `StoreError::HandlerFailure` if the handler fails or panics;
    /// the projection is then `Broken` and its state is left as it was
    /// before the failing event.
    pub fn apply(&mut self, event: &Event) -> Result<bool, StoreError> {
        if self.status == ProjectionStatus::Broken {
            return Ok(false);
        }
        let Some(handler) = self.handlers.get(event.event_type()) else {
            return Ok(false);
        };

        // Handlers only read the state, so a panic leaves it untouched.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&self.state, event)))
            .unwrap_or_else(|payload| Err(panic_message(&*payload).into()));

        match outcome {
            Ok(next) => {
                self.state = next;
                self.position += 1;
                self.status = ProjectionStatus::Ok;
                tracing::debug!(
                    projection_id = %self.id,
                    event_type = event.event_type(),
                    position = self.position,
                    "projected event"
                );
                Ok(true)
            }
            Err(err) => {
                let failure = ProjectionFailure {
                    projection_id: self.id,
                    event_id: event.id(),
                    position: self.position,
                    message: err.to_string(),
                };
                self.status = ProjectionStatus::Broken;
                self.failure = Some(failure.clone());
                Err(failure.into())
            }
        }
    }

    /// Folds a sequence of events in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::HandlerFailure` carrying the position at which
    /// the fold stopped.
    pub fn fold<'a, I>(&mut self, events: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = &'a Event>,
    {
        for event in events {
            self.apply(event)?;
        }
        Ok(())
    }

    /// Returns a fresh copy at the initial state that shares only the
    /// handler table with `self`.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            id: self.id,
            target: self.target.clone(),
            separate: self.separate,
            handlers: Arc::clone(&self.handlers),
            initial_state: self.initial_state.clone(),
            state: self.initial_state.clone(),
            position: 0,
            status: ProjectionStatus::Ready,
            failure: None,
        }
    }

    /// Returns the projection to its initial state and `Ready`.
    pub fn reset(&mut self) {
        self.state = self.initial_state.clone();
        self.position = 0;
        self.status = ProjectionStatus::Ready;
        self.failure = None;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned());
    match detail {
        Some(detail) => format!("handler panicked: {detail}"),
        None => "handler panicked".to_string(),
    }
}

impl<S> Projection<S> {
    /// Projection identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The events this projection receives.
    #[must_use]
    pub fn target(&self) -> &ProjectionTarget {
        &self.target
    }

    /// Whether a type-targeted replay keeps one state per stream.
    #[must_use]
    pub fn is_separate(&self) -> bool {
        self.separate
    }

    /// Returns `true` if some handler is registered for `event_type`.
    #[must_use]
    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Consumes the projection, returning its state.
    #[must_use]
    pub fn into_state(self) -> S {
        self.state
    }

    /// Number of events folded so far.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ProjectionStatus {
        self.status
    }

    /// The failure that broke the projection, if any.
    #[must_use]
    pub fn failure(&self) -> Option<&ProjectionFailure> {
        self.failure.as_ref()
    }
}

impl<S: fmt::Debug> fmt::Debug for Projection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handled: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        handled.sort_unstable();
        f.debug_struct("Projection")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("separate", &self.separate)
            .field("handles", &handled)
            .field("state", &self.state)
            .field("position", &self.position)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Projection`]. The handler table is frozen by `build`.
pub struct ProjectionBuilder<S> {
    target: ProjectionTarget,
    separate: bool,
    initial_state: S,
    handlers: HashMap<String, Handler<S>>,
}

impl<S: Clone + Default> ProjectionBuilder<S> {
    fn new(target: ProjectionTarget) -> Self {
        Self {
            target,
            separate: false,
            initial_state: S::default(),
            handlers: HashMap::new(),
        }
    }
}

impl<S: Clone> ProjectionBuilder<S> {
    /// For type-targeted projections: keep one state per stream instead of
    /// one merged state. Ignored for other targets.
    #[must_use]
    pub fn separate(mut self, separate: bool) -> Self {
        self.separate = separate;
        self
    }

    /// Sets the initial state (defaults to `S::default()`).
    #[must_use]
    pub fn initial_state(mut self, state: S) -> Self {
        self.initial_state = state;
        self
    }

    /// Registers an infallible reducer for `event_type`, replacing any
    /// previous one.
    #[must_use]
    pub fn on<F>(mut self, event_type: impl Into<String>, reducer: F) -> Self
    where
        F: Fn(&S, &Event) -> S + Send + Sync + 'static,
    {
        self.handlers.insert(
            event_type.into(),
            Arc::new(move |state: &S, event: &Event| {
                Ok::<S, HandlerError>(reducer(state, event))
            }),
        );
        self
    }

    /// Registers a fallible reducer for `event_type`.
    #[must_use]
    pub fn try_on<F, E>(mut self, event_type: impl Into<String>, reducer: F) -> Self
    where
        F: Fn(&S, &Event) -> Result<S, E> + Send + Sync + 'static,
        E: Into<HandlerError>,
    {
        self.handlers.insert(
            event_type.into(),
            Arc::new(move |state: &S, event: &Event| {
                reducer(state, event).map_err(Into::<HandlerError>::into)
            }),
        );
        self
    }

    /// Builds the projection with a fresh id.
    #[must_use]
    pub fn build(self) -> Projection<S> {
        Projection {
            id: Uuid::new_v4(),
            target: self.target,
            separate: self.separate,
            handlers: Arc::new(self.handlers),
            state: self.initial_state.clone(),
            initial_state: self.initial_state,
            position: 0,
            status: ProjectionStatus::Ready,
            failure: None,
        }
    }
}

/// Receives appended events from the store's publish step.
pub trait Subscriber: Send + Sync {
    /// Subscriber identifier.
    fn id(&self) -> Uuid;

    /// The events this subscriber receives.
    fn target(&self) -> &ProjectionTarget;

    /// Folds one event.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::HandlerFailure` if folding fails.
    fn project(&self, event: &Event) -> Result<bool, StoreError>;
}

/// A projection registered with the store and kept current as events are
/// appended. Cloning yields another handle to the same projection; folds
/// are serialized by an internal mutex.
pub struct LiveProjection<S> {
    id: Uuid,
    target: ProjectionTarget,
    inner: Arc<Mutex<Projection<S>>>,
}

impl<S> Clone for LiveProjection<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            target: self.target.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Clone> LiveProjection<S> {
    /// Wraps a projection for live use.
    #[must_use]
    pub fn new(projection: Projection<S>) -> Self {
        Self {
            id: projection.id(),
            target: projection.target().clone(),
            inner: Arc::new(Mutex::new(projection)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Projection<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> S {
        self.lock().state().clone()
    }

    /// Number of events folded so far.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.lock().position()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ProjectionStatus {
        self.lock().status()
    }

    /// The failure that broke the projection, if any.
    #[must_use]
    pub fn failure(&self) -> Option<ProjectionFailure> {
        self.lock().failure().cloned()
    }

    /// Returns the projection to its initial state, e.g. before a
    /// `replay_all` rebuild.
    pub fn reset(&self) {
        self.lock().reset();
    }

    /// A fresh fork of the underlying projection, suitable for `exec`.
    #[must_use]
    pub fn fork(&self) -> Projection<S> {
        self.lock().fork()
    }
}

impl<S> fmt::Debug for LiveProjection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveProjection")
            .field("id", &self.id)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl<S: Clone + Send + 'static> Subscriber for LiveProjection<S> {
    fn id(&self) -> Uuid {
        self.id
    }

    fn target(&self) -> &ProjectionTarget {
        &self.target
    }

    fn project(&self, event: &Event) -> Result<bool, StoreError> {
        self.lock().apply(event)
    }
}

/// Result of replaying a projection.
#[derive(Debug, Clone, PartialEq)]
pub enum Replay<S> {
    /// One accumulated state (stream, merged type, or global replay).
    Single(S),
    /// One state per stream, in stream creation order (separate type replay).
    PerStream(IndexMap<Uuid, S>),
}

impl<S> Replay<S> {
    /// The single state, if this was not a per-stream replay.
    #[must_use]
    pub fn into_single(self) -> Option<S> {
        match self {
            Self::Single(state) => Some(state),
            Self::PerStream(_) => None,
        }
    }

    /// The per-stream states, if this was a separate replay.
    #[must_use]
    pub fn into_per_stream(self) -> Option<IndexMap<Uuid, S>> {
        match self {
            Self::Single(_) => None,
            Self::PerStream(states) => Some(states),
        }
    }
}
