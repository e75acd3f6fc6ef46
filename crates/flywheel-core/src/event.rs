//! Typed build events and their wire envelopes.
//!
//! Every unit of build output (log line, status change, ...) is a
//! [`BuildEvent`]. The event store persists them as [`Envelope`]s: a
//! `{event, version, data}` triple where `data` is the schema-versioned JSON
//! payload. Envelopes are immutable once written.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::build::BuildStatus;

/// Wire tag identifying an event's schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(transparent)]
#[display("{_0}")]
pub struct EventType(String);

impl EventType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// A build event as it travels through the store and over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: EventType,
    pub version: String,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(event: &BuildEvent) -> Self {
        Self {
            event: event.event_type(),
            version: event.version().to_string(),
            data: event.data(),
        }
    }

    /// Reconstruct the typed event. Fails on an unknown event type or a
    /// payload that doesn't match the type's schema.
    pub fn decode(&self) -> Result<BuildEvent, EventDecodeError> {
        fn parse<T: serde::de::DeserializeOwned>(
            data: &serde_json::Value,
        ) -> Result<T, EventDecodeError> {
            serde_json::from_value(data.clone()).map_err(EventDecodeError::Payload)
        }

        match self.event.as_str() {
            "start" => {
                #[derive(Deserialize)]
                struct Data {
                    time: i64,
                }
                let d: Data = parse(&self.data)?;
                Ok(BuildEvent::Start { time: d.time })
            }
            "log" => {
                #[derive(Deserialize)]
                struct Data {
                    payload: String,
                    time: i64,
                }
                let d: Data = parse(&self.data)?;
                Ok(BuildEvent::Log {
                    payload: d.payload,
                    time: d.time,
                })
            }
            "status" => {
                #[derive(Deserialize)]
                struct Data {
                    status: BuildStatus,
                    time: i64,
                }
                let d: Data = parse(&self.data)?;
                Ok(BuildEvent::Status {
                    status: d.status,
                    time: d.time,
                })
            }
            "error" => {
                #[derive(Deserialize)]
                struct Data {
                    message: String,
                    time: i64,
                }
                let d: Data = parse(&self.data)?;
                Ok(BuildEvent::Error {
                    message: d.message,
                    time: d.time,
                })
            }
            "finish" => {
                #[derive(Deserialize)]
                struct Data {
                    time: i64,
                    succeeded: bool,
                }
                let d: Data = parse(&self.data)?;
                Ok(BuildEvent::Finish {
                    time: d.time,
                    succeeded: d.succeeded,
                })
            }
            other => Err(EventDecodeError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("unknown event type: {0}")]
    UnknownType(String),

    #[error("malformed event payload: {0}")]
    Payload(#[source] serde_json::Error),
}

/// The event vocabulary a build can emit.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    /// The build began executing.
    Start { time: i64 },
    /// One line of build output.
    Log { payload: String, time: i64 },
    /// The build transitioned to a new status.
    Status { status: BuildStatus, time: i64 },
    /// The build hit an error outside its own steps' control.
    Error { message: String, time: i64 },
    /// The build finished.
    Finish { time: i64, succeeded: bool },
}

impl BuildEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            BuildEvent::Start { .. } => "start".into(),
            BuildEvent::Log { .. } => "log".into(),
            BuildEvent::Status { .. } => "status".into(),
            BuildEvent::Error { .. } => "error".into(),
            BuildEvent::Finish { .. } => "finish".into(),
        }
    }

    pub fn version(&self) -> &'static str {
        match self {
            BuildEvent::Start { .. } => "1.0",
            BuildEvent::Log { .. } => "1.0",
            BuildEvent::Status { .. } => "1.0",
            BuildEvent::Error { .. } => "1.0",
            BuildEvent::Finish { .. } => "1.0",
        }
    }

    /// The schema-versioned JSON payload, without the type tag.
    pub fn data(&self) -> serde_json::Value {
        match self {
            BuildEvent::Start { time } => json!({ "time": time }),
            BuildEvent::Log { payload, time } => json!({ "payload": payload, "time": time }),
            BuildEvent::Status { status, time } => json!({ "status": status, "time": time }),
            BuildEvent::Error { message, time } => json!({ "message": message, "time": time }),
            BuildEvent::Finish { time, succeeded } => {
                json!({ "time": time, "succeeded": succeeded })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_type_version_and_payload() {
        let event = BuildEvent::Log {
            payload: "hello".to_string(),
            time: 1234,
        };

        let envelope = Envelope::new(&event);

        assert_eq!(envelope.event.as_str(), "log");
        assert_eq!(envelope.version, "1.0");
        assert_eq!(envelope.data, json!({ "payload": "hello", "time": 1234 }));
        assert_eq!(envelope.decode().unwrap(), event);
    }

    #[test]
    fn decoding_an_unknown_type_fails() {
        let envelope = Envelope {
            event: "telemetry".into(),
            version: "1.0".to_string(),
            data: json!({}),
        };

        assert!(matches!(
            envelope.decode(),
            Err(EventDecodeError::UnknownType(t)) if t == "telemetry"
        ));
    }

    #[test]
    fn status_payload_uses_snake_case_statuses() {
        let envelope = Envelope::new(&BuildEvent::Status {
            status: BuildStatus::Succeeded,
            time: 99,
        });

        assert_eq!(envelope.data["status"], json!("succeeded"));
    }
}
