use serde_json::Value;

use crate::sanitize::quote_bare_keys;

/// Prefix marking a data event in the response stream.
pub const DATA_PREFIX: &str = "data:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Message,
    MessageEnd,
    Other(String),
}

impl EventKind {
    fn parse(kind: &str) -> Self {
        match kind {
            "message" => EventKind::Message,
            "message_end" => EventKind::MessageEnd,
            other => EventKind::Other(other.to_string()),
        }
    }
}

/// One decoded data event. Empty strings count as absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub kind: EventKind,
    pub conversation_id: Option<String>,
    pub answer: Option<String>,
    pub message_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl StreamEvent {
    /// Decodes the JSON payload of a data event. A payload that fails strict
    /// parsing gets one retry with bare keys quoted.
    pub fn parse(payload: &str) -> Result<Self, EventError> {
        let payload = payload.trim();
        if !payload.starts_with('{') || !payload.ends_with('}') {
            return Err(EventError::NotAnObject);
        }
        let value = match serde_json::from_str::<Value>(payload) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(error = %err, "event payload is not strict JSON; retrying with quoted keys");
                serde_json::from_str::<Value>(&quote_bare_keys(payload))?
            }
        };
        Ok(Self::from_value(&value))
    }

    fn from_value(value: &Value) -> Self {
        let text = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
        };
        Self {
            kind: EventKind::parse(value.get("event").and_then(Value::as_str).unwrap_or("")),
            conversation_id: text("conversation_id"),
            answer: text("answer"),
            message_id: text("message_id"),
        }
    }
}
