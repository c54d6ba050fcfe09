//! Wire protocol types for host-bridge communication.
//!
//! One channel (stdin/stdout), one JSON value per line:
//! - **Inbound**: `{command, data, id}` commands from the host
//! - **Outbound**: responses correlated by `id`, plus uncorrelated
//!   `ready`/`event`/`error` notices

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::version::VersionInfo;

/// Command frame sent by the host.
#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    /// Command name. A missing name is routed like any unknown command.
    #[serde(default)]
    pub command: Option<String>,
    /// Command payload; absent or `null` is treated as an empty object.
    #[serde(default = "empty_object", deserialize_with = "deserialize_data")]
    pub data: Value,
    /// Correlation token, echoed verbatim on the response.
    #[serde(default)]
    pub id: Option<Value>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn deserialize_data<'de, D>(deserializer: D) -> Result<Value, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(if value.is_null() {
        empty_object()
    } else {
        value
    })
}

impl Command {
    /// Interpret a decoded frame as a command.
    ///
    /// On failure the frame's `id` (if any could be read) is returned with the
    /// error so the caller can still correlate its error response.
    pub fn from_frame(frame: Value) -> Result<Self, (Option<Value>, serde_json::Error)> {
        let id = frame.get("id").filter(|id| !id.is_null()).cloned();
        serde_json::from_value(frame).map_err(|e| (id, e))
    }

    pub fn name(&self) -> &str {
        self.command.as_deref().unwrap_or("None")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Result of running a command handler, before correlation.
///
/// Serializes as `{status, message?, error?, ...fields}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: Status,
    pub message: Option<String>,
    pub error: Option<String>,
    pub fields: Map<String, Value>,
}

impl Outcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: Status::Success,
            message: Some(message.into()),
            error: None,
            fields: Map::new(),
        }
    }

    /// Success carrying only payload fields, no message.
    pub fn success_fields() -> Self {
        Self {
            status: Status::Success,
            message: None,
            error: None,
            fields: Map::new(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: None,
            error: Some(error.into()),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            "status".to_string(),
            serde_json::to_value(self.status).unwrap_or(Value::Null),
        );
        if let Some(ref message) = self.message {
            map.insert("message".to_string(), Value::String(message.clone()));
        }
        if let Some(ref error) = self.error {
            map.insert("error".to_string(), Value::String(error.clone()));
        }
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map)
    }

    /// Correlate with a command: `result` is the message when there is one,
    /// otherwise the whole outcome object.
    pub fn into_response(self, id: Option<Value>) -> Response {
        let result = match self.message {
            Some(ref message) => Value::String(message.clone()),
            None => self.to_value(),
        };
        Response {
            id,
            status: self.status,
            result: Some(result),
            error: self.error,
            traceback: None,
        }
    }

    /// Correlate with a command, always reporting the whole outcome object.
    pub fn into_full_response(self, id: Option<Value>) -> Response {
        Response {
            id,
            status: self.status,
            result: Some(self.to_value()),
            error: self.error,
            traceback: None,
        }
    }
}

/// Response correlated to exactly one inbound command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl Response {
    /// Error response with no `result`: a line that never became a command, or
    /// a handler that panicked.
    pub fn rejected(id: Option<Value>, error: impl Into<String>) -> Self {
        Self {
            id,
            status: Status::Error,
            result: None,
            error: Some(error.into()),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }
}

/// Uncorrelated messages from bridge to host. Never carry an `id`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    /// Sent exactly once, before any command is read.
    Ready {
        message: String,
        version: VersionInfo,
    },

    /// Asynchronous report, e.g. from a background server task.
    Event { name: String, data: Value },

    /// A frame that could not be serialized.
    Error { error: String },
}

/// Anything written to the output stream.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Response(Response),
    Notice(Notice),
}

impl From<Response> for Outbound {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<Notice> for Outbound {
    fn from(notice: Notice) -> Self {
        Self::Notice(notice)
    }
}
