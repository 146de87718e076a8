//! Command parsing and execution.

use serde_json::{Value, json};
use tally_core::error::StoreError;
use tally_core::event::Event;
use tally_core::store::EventStore;
use uuid::Uuid;

use crate::error::CliError;

/// Help text printed by `tally help`.
pub const USAGE: &str = "\
usage: tally <command> [args]

commands:
  init                                         create tables if missing
  create-stream <type>                         create an empty stream
  push <stream-id> <type> <version> <json>     append an event
  stream <stream-id>                           show a stream with its events
  streams [<type>]                             list streams, optionally by type
  events [<stream-id>]                         list events, globally or per stream
  version <stream-id>                          show a stream's version
  rollback <stream-id> <event-id>              remove a stream's tail event
  delete-stream <stream-id>                    delete a stream with no events
  help                                         show this text

environment:
  DATABASE_URL            sqlite:… or postgres://… (default sqlite::memory:)
  TALLY_MAX_CONNECTIONS   pool size (default 5)
  RUST_LOG                log filter (default info)";

/// A parsed `tally` invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Create tables if missing.
    Init,
    /// Create an empty stream.
    CreateStream {
        /// Stream type.
        stream_type: String,
    },
    /// Append an event.
    Push {
        /// Target stream.
        stream_id: Uuid,
        /// Event type.
        event_type: String,
        /// Expected new version.
        version: i64,
        /// JSON object payload.
        payload: Value,
    },
    /// Show one stream with its events.
    Stream {
        /// Stream to show.
        stream_id: Uuid,
    },
    /// List streams.
    Streams {
        /// Only streams of this type.
        stream_type: Option<String>,
    },
    /// List events.
    Events {
        /// Only this stream's events.
        stream_id: Option<Uuid>,
    },
    /// Show a stream's version.
    Version {
        /// Stream to inspect.
        stream_id: Uuid,
    },
    /// Roll back a stream's tail event.
    Rollback {
        /// Stream to modify.
        stream_id: Uuid,
        /// The event to remove.
        event_id: Uuid,
    },
    /// Delete a stream with no events.
    DeleteStream {
        /// Stream to delete.
        stream_id: Uuid,
    },
    /// Print usage.
    Help,
}

impl Command {
    /// Parses arguments (without the program name).
    ///
    /// # Errors
    ///
    /// Returns `CliError::Usage` for unknown commands, wrong arity or
    /// malformed ids and versions, and `CliError::Json` for an unparsable
    /// payload.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self, CliError> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        let Some((name, rest)) = args.split_first() else {
            return Err(CliError::Usage("no command given".into()));
        };

        match (*name, rest) {
            ("init", []) => Ok(Self::Init),
            ("create-stream", [stream_type]) => Ok(Self::CreateStream {
                stream_type: (*stream_type).to_string(),
            }),
            ("push", [stream_id, event_type, version, payload]) => Ok(Self::Push {
                stream_id: parse_id("stream-id", stream_id)?,
                event_type: (*event_type).to_string(),
                version: version.parse().map_err(|_| {
                    CliError::Usage(format!("<version> must be an integer, got {version:?}"))
                })?,
                payload: serde_json::from_str(payload)?,
            }),
            ("stream", [stream_id]) => Ok(Self::Stream {
                stream_id: parse_id("stream-id", stream_id)?,
            }),
            ("streams", []) => Ok(Self::Streams { stream_type: None }),
            ("streams", [stream_type]) => Ok(Self::Streams {
                stream_type: Some((*stream_type).to_string()),
            }),
            ("events", []) => Ok(Self::Events { stream_id: None }),
            ("events", [stream_id]) => Ok(Self::Events {
                stream_id: Some(parse_id("stream-id", stream_id)?),
            }),
            ("version", [stream_id]) => Ok(Self::Version {
                stream_id: parse_id("stream-id", stream_id)?,
            }),
            ("rollback", [stream_id, event_id]) => Ok(Self::Rollback {
                stream_id: parse_id("stream-id", stream_id)?,
                event_id: parse_id("event-id", event_id)?,
            }),
            ("delete-stream", [stream_id]) => Ok(Self::DeleteStream {
                stream_id: parse_id("stream-id", stream_id)?,
            }),
            ("help" | "--help" | "-h", _) => Ok(Self::Help),
            (
                "init" | "create-stream" | "push" | "stream" | "streams" | "events" | "version"
                | "rollback" | "delete-stream",
                _,
            ) => Err(CliError::Usage(format!(
                "wrong number of arguments for {name}"
            ))),
            (other, _) => Err(CliError::Usage(format!("unknown command {other:?}"))),
        }
    }

    /// Runs the command and returns the JSON document to print.
    ///
    /// # Errors
    ///
    /// Returns `CliError::Store` if the store rejects the operation, or
    /// `CliError::Json` if a payload is not a JSON object.
    pub async fn execute(self, store: &EventStore) -> Result<Value, CliError> {
        match self {
            // Tables are created when the store connects.
            Self::Init => Ok(json!({ "status": "ok" })),
            Self::Help => Ok(Value::String(USAGE.to_string())),
            Self::CreateStream { stream_type } => {
                let stream = store.create_stream(&stream_type).await?;
                Ok(serde_json::to_value(stream)?)
            }
            Self::Push {
                stream_id,
                event_type,
                version,
                payload,
            } => {
                let event = Event::from_json(event_type, payload, version)?;
                let recorded = store.push(stream_id, event).await?;
                Ok(serde_json::to_value(recorded)?)
            }
            Self::Stream { stream_id } => {
                let stream = store.get_stream(stream_id).await?;
                Ok(serde_json::to_value(stream)?)
            }
            Self::Streams { stream_type } => {
                let streams = match stream_type {
                    Some(stream_type) => store.get_streams_by_type(&stream_type).await?,
                    None => store.get_streams().await?,
                };
                Ok(serde_json::to_value(streams)?)
            }
            Self::Events { stream_id } => {
                let events = match stream_id {
                    Some(stream_id) => store.get_events_by_stream(stream_id).await?,
                    None => store.get_events().await?,
                };
                Ok(serde_json::to_value(events)?)
            }
            Self::Version { stream_id } => {
                let version = store.get_version_for_stream(stream_id).await?;
                Ok(json!({ "stream_id": stream_id, "version": version }))
            }
            Self::Rollback {
                stream_id,
                event_id,
            } => {
                let event = store
                    .get_events_by_stream(stream_id)
                    .await?
                    .into_iter()
                    .find(|e| e.id() == event_id)
                    .ok_or(StoreError::EventNotFound(event_id))?;
                let rolled_back = store.rollback(stream_id, &event).await?;
                Ok(json!({ "rolled_back": rolled_back }))
            }
            Self::DeleteStream { stream_id } => {
                let deleted = store.delete_stream(stream_id).await?;
                Ok(json!({ "deleted": deleted }))
            }
        }
    }
}

fn parse_id(name: &str, raw: &str) -> Result<Uuid, CliError> {
    Uuid::parse_str(raw).map_err(|e| CliError::Usage(format!("<{name}> is not a UUID: {e}")))
}
