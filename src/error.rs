//! Error taxonomy for everything that crosses the bridge boundary.
//!
//! Raw transport and parse failures never reach application code as-is –
//! they are converted into [`SdkError`] at the point where they surface.
//! The one exception is a broken invariant inside this crate itself (a call
//! slot resolved twice), which is logged at error level and flagged rather
//! than silently overwriting the first resolution.

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// The single error type exposed to application code.
#[derive(Debug, Error)]
pub enum SdkError {
    /// The engine replied with an error envelope instead of a result.
    #[error("engine error: {message}")]
    Engine {
        message: String,
        /// Engine-side stack trace, when the envelope carried one.
        js_stack: Option<String>,
    },

    /// A reply or push payload could not be decoded into the expected shape.
    #[error("malformed payload: {0}")]
    Parse(String),

    /// The command never left the process (argument serialization or
    /// transport dispatch failed).
    #[error("transport failure: {0}")]
    Transport(String),

    /// An opt-in call deadline elapsed before the engine replied.
    ///
    /// The engine protocol itself has no timeouts; this variant only occurs
    /// through [`CallRegistry::call_with_timeout`](crate::CallRegistry::call_with_timeout).
    #[error("command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// The reply channel was torn down before a result arrived, e.g. the
    /// bridge instance was dropped with the call still pending.
    #[error("reply channel closed for `{0}`")]
    ChannelClosed(String),
}

impl SdkError {
    /// Detect the engine's error envelope in a raw reply.
    ///
    /// Two shapes are recognised, matching what the engine actually sends:
    ///
    /// - `{"__error": {"message": "...", "jsStack": "..."}}`
    /// - `{"error": "..."}`
    ///
    /// Returns `None` for anything else, including non-object replies.
    /// Envelope detection runs before success parsing, so a reply that is
    /// both an envelope and a plausible success value still fails the call.
    pub fn from_reply(raw: &str) -> Option<SdkError> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let obj = value.as_object()?;

        if let Some(inner) = obj.get("__error") {
            let message = inner
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown engine error")
                .to_string();
            let js_stack = inner
                .get("jsStack")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Some(SdkError::Engine { message, js_stack });
        }

        if let Some(message) = obj.get("error").and_then(Value::as_str) {
            return Some(SdkError::Engine {
                message: message.to_string(),
                js_stack: None,
            });
        }

        None
    }

    /// Shorthand for a plain engine-side error message.
    pub fn engine(message: impl Into<String>) -> SdkError {
        SdkError::Engine {
            message: message.into(),
            js_stack: None,
        }
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(e: serde_json::Error) -> Self {
        SdkError::Parse(e.to_string())
    }
}

/// Extract a human-readable message from a lifecycle payload that may be a
/// bare string, an error envelope, or an object carrying a `reason` or
/// `message` field (in that precedence).
pub(crate) fn payload_message(payload: &str) -> String {
    if let Some(SdkError::Engine { message, .. }) = SdkError::from_reply(payload) {
        return message;
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::String(s)) => s,
        Ok(Value::Object(map)) => map
            .get("reason")
            .or_else(|| map.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(map).to_string()),
        Ok(other) => other.to_string(),
        Err(_) => payload.trim().to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
