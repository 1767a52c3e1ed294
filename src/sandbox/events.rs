//! Line-delimited event protocol spoken by the in-container entrypoint.
//!
//! Every stdout line is one JSON object discriminated by `type`. The known
//! types get typed variants; anything else is carried through as
//! [`Event::Other`] so newer workloads don't break older hosts.

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};

use crate::error::Error;

/// Codes on error events synthesized by the host (never by the workload).
pub mod codes {
    use crate::error::ErrorKind;

    pub const TIMEOUT: &str = ErrorKind::ExecTimeout.code();
    pub const OOM: &str = ErrorKind::OomKilled.code();
    pub const EXEC_FAILED: &str = ErrorKind::ExecFailed.code();
    pub const WORKLOAD_EXIT: &str = ErrorKind::WorkloadExit.code();
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Log {
        message: String,
        level: Option<String>,
    },
    Result {
        payload: Map<String, Value>,
    },
    Error {
        message: String,
        code: Option<String>,
    },
    Other {
        kind: String,
        payload: Map<String, Value>,
    },
}

impl Event {
    /// Parse one stdout line. Returns `None` for anything that is not a JSON
    /// object with a string `type`.
    pub fn parse(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line.trim()).ok()?;
        let Value::Object(mut obj) = value else {
            return None;
        };
        let kind = match obj.remove("type") {
            Some(Value::String(s)) => s,
            _ => return None,
        };

        let event = match kind.as_str() {
            "log" => Event::Log {
                message: take_string(&mut obj, "message").unwrap_or_default(),
                level: take_string(&mut obj, "level"),
            },
            "result" => Event::Result { payload: obj },
            "error" => Event::Error {
                message: take_string(&mut obj, "message")
                    .unwrap_or_else(|| "workload reported an error".to_string()),
                code: take_string(&mut obj, "code"),
            },
            _ => Event::Other { kind, payload: obj },
        };
        Some(event)
    }

    /// Host-synthesized terminal error.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Event::Error {
            message: message.into(),
            code: Some(code.to_string()),
        }
    }

    /// Terminal error event for a failure the host detected during a turn.
    pub fn from_error(err: &Error) -> Self {
        Event::error(err.kind().code(), err.to_string())
    }

    pub fn kind(&self) -> &str {
        match self {
            Event::Log { .. } => "log",
            Event::Result { .. } => "result",
            Event::Error { .. } => "error",
            Event::Other { kind, .. } => kind,
        }
    }

    /// `result` and `error` end a turn from the workload's point of view.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Result { .. } | Event::Error { .. })
    }

    pub fn error_code(&self) -> Option<&str> {
        match self {
            Event::Error { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

fn take_string(obj: &mut Map<String, Value>, key: &str) -> Option<String> {
    match obj.remove(key) {
        Some(Value::String(s)) => Some(s),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", self.kind())?;
        match self {
            Event::Log { message, level } => {
                map.serialize_entry("message", message)?;
                if let Some(level) = level {
                    map.serialize_entry("level", level)?;
                }
            }
            Event::Error { message, code } => {
                map.serialize_entry("message", message)?;
                if let Some(code) = code {
                    map.serialize_entry("code", code)?;
                }
            }
            Event::Result { payload } | Event::Other { payload, .. } => {
                for (k, v) in payload {
                    if k != "type" {
                        map.serialize_entry(k, v)?;
                    }
                }
            }
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_known_types() {
        assert_eq!(
            Event::parse(r#"{"type":"log","message":"installing","level":"info"}"#),
            Some(Event::Log {
                message: "installing".into(),
                level: Some("info".into())
            })
        );

        let result = Event::parse(r#"{"type":"result","text":"done","usage":{"tokens":3}}"#).unwrap();
        match result {
            Event::Result { payload } => {
                assert_eq!(payload["text"], "done");
                assert_eq!(payload["usage"]["tokens"], 3);
            }
            other => panic!("unexpected {:?}", other),
        }

        let err = Event::parse(r#"{"type":"error","message":"bad tool"}"#).unwrap();
        assert!(err.is_terminal());
        assert_eq!(err.error_code(), None);
    }

    #[test]
    fn unknown_types_pass_through() {
        let event = Event::parse(r#"{"type":"tool_use","name":"bash"}"#).unwrap();
        assert_eq!(event.kind(), "tool_use");
        assert!(!event.is_terminal());
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "tool_use", "name": "bash"})
        );
    }

    #[test]
    fn rejects_non_events() {
        assert_eq!(Event::parse("not json"), None);
        assert_eq!(Event::parse("[1,2]"), None);
        assert_eq!(Event::parse(r#"{"message":"no type"}"#), None);
        assert_eq!(Event::parse(r#"{"type":7}"#), None);
        assert_eq!(Event::parse(""), None);
    }

    #[test]
    fn synthesized_error_serializes_with_code() {
        let event = Event::error(codes::TIMEOUT, "turn timed out after 5s");
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "error", "message": "turn timed out after 5s", "code": "timeout"})
        );
    }

    #[test]
    fn host_errors_become_coded_events() {
        let event = Event::from_error(&Error::ExecTimeout { secs: 30 });
        assert!(event.is_terminal());
        assert_eq!(event.error_code(), Some(codes::TIMEOUT));
        match event {
            Event::Error { message, .. } => assert!(message.contains("30s")),
            other => panic!("unexpected {:?}", other),
        }

        let event = Event::from_error(&Error::OomKilled {
            name: "agentbox-a".into(),
        });
        assert_eq!(event.error_code(), Some(codes::OOM));
    }
}
