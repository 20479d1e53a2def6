// src/core/protocol.rs

//! The JSON message envelope shared by bots, workers, and subscribers.
//!
//! The gateway only interprets the handful of fields it needs for routing and
//! correlation (`post_type`, `self_id`, `echo`, `action`, ...). Everything else
//! is opaque platform payload and is forwarded untouched.

use crate::core::NexusError;
use serde_json::{Value, json};

/// Retcode reported when an API call has no live target to go to.
pub const RETCODE_NO_TARGET: i64 = 1404;
/// Retcode reported when an API call timed out waiting for its response.
pub const RETCODE_TIMEOUT: i64 = 1408;

/// A parsed message envelope. Wraps the raw JSON object so unknown
/// platform-specific fields survive a round trip through the gateway.
#[derive(Debug, Clone)]
pub struct Envelope {
    raw: Value,
}

impl Envelope {
    /// Parses a text frame into an envelope. The frame must be a JSON object.
    pub fn parse(text: &str) -> Result<Self, NexusError> {
        let raw: Value = serde_json::from_str(text)
            .map_err(|e| NexusError::InvalidFrame(format!("invalid JSON: {e}")))?;
        Self::from_value(raw)
    }

    /// Wraps an already-deserialized JSON value.
    pub fn from_value(raw: Value) -> Result<Self, NexusError> {
        if !raw.is_object() {
            return Err(NexusError::InvalidFrame(
                "envelope must be a JSON object".to_string(),
            ));
        }
        Ok(Self { raw })
    }

    /// Returns a routing/identity field normalized to a string.
    ///
    /// Platforms disagree on whether ids are JSON numbers or strings, and some
    /// exceed 2^53, so numbers are rendered from the raw token rather than
    /// going through an f64.
    fn id_field(&self, key: &str) -> Option<String> {
        match self.raw.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.raw.get(key).and_then(Value::as_str)
    }

    pub fn post_type(&self) -> Option<&str> {
        self.str_field("post_type")
    }

    pub fn message_type(&self) -> Option<&str> {
        self.str_field("message_type")
    }

    pub fn notice_type(&self) -> Option<&str> {
        self.str_field("notice_type")
    }

    pub fn request_type(&self) -> Option<&str> {
        self.str_field("request_type")
    }

    pub fn self_id(&self) -> Option<String> {
        self.id_field("self_id")
    }

    pub fn user_id(&self) -> Option<String> {
        self.id_field("user_id")
    }

    pub fn group_id(&self) -> Option<String> {
        self.id_field("group_id")
    }

    /// The correlation token. Its presence means "must be correlated";
    /// absence means fire-and-forget.
    pub fn echo(&self) -> Option<String> {
        self.id_field("echo")
    }

    /// The API action name on outbound calls.
    pub fn action(&self) -> Option<&str> {
        self.str_field("action")
    }

    /// Gateway-level control frames (`{"meta": "register" | "heartbeat"}`).
    pub fn meta(&self) -> Option<&str> {
        self.str_field("meta")
    }

    /// An API response: carries a correlation token but is not an event
    /// and not an outbound call.
    pub fn is_api_response(&self) -> bool {
        self.echo().is_some() && self.post_type().is_none() && self.action().is_none()
    }

    /// An outbound API call (`{"action": ..., "params": ...}`).
    pub fn is_api_request(&self) -> bool {
        self.action().is_some()
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    /// Serializes the envelope back into a text frame.
    pub fn to_frame(&self) -> String {
        self.raw.to_string()
    }
}

/// Builds a synthetic failure response for a correlated API call.
pub fn failed_response(echo: &str, retcode: i64, message: &str) -> Envelope {
    Envelope {
        raw: json!({
            "status": "failed",
            "retcode": retcode,
            "message": message,
            "echo": echo,
        }),
    }
}
