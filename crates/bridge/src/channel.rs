//! Raw-result classification for host script calls.
//!
//! The host engine reports every outcome as a bare string. Two literal
//! sentinels mean the engine itself failed; everything else is either
//! JSON (success, or a remote error when the object carries an `error`
//! field) or an opaque scalar from a diagnostic probe.

use std::sync::Arc;

use serde_json::Value;

use crate::host::ScriptHost;

/// Returned by the engine when script evaluation throws.
pub const EVAL_ERROR_SENTINEL: &str = "EvalScript error.";

/// Returned when no scripting engine is attached to the panel.
pub const NO_ENGINE_SENTINEL: &str = "undefined";

/// Errors crossing the bridge boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// The engine failed to evaluate the command (or is not attached).
    #[error("host scripting engine failed to evaluate the command")]
    EngineFailure,

    /// The host-side function ran and reported an error of its own.
    #[error("host error: {0}")]
    Remote(String),

    /// A data-bearing command returned a payload that does not decode
    /// into the expected shape. Opaque payloads are acceptable for
    /// diagnostic probes only.
    #[error("command '{command}' returned an unexpected payload: {detail}")]
    UnexpectedPayload { command: String, detail: String },
}

/// Stateless channel executing commands against the injected host.
///
/// Safe to clone and reuse across runs; holds no per-run state.
#[derive(Clone)]
pub struct BridgeChannel {
    host: Arc<dyn ScriptHost>,
}

impl BridgeChannel {
    pub fn new(host: Arc<dyn ScriptHost>) -> Self {
        Self { host }
    }

    /// Execute a command and classify its raw string result.
    ///
    /// A result that is not a sentinel and does not parse as JSON is
    /// returned as an opaque [`Value::String`]; callers issuing
    /// data-bearing commands must go through the typed wrappers in
    /// [`crate::commands`], which reject opaque payloads.
    pub async fn call(&self, command: &str) -> Result<Value, BridgeError> {
        tracing::debug!(command, "Executing host command");
        let raw = self.host.eval(command).await;
        classify(&raw)
    }
}

/// Classify a raw engine result string.
///
/// Sentinels are checked before any JSON parsing is attempted.
pub fn classify(raw: &str) -> Result<Value, BridgeError> {
    if raw == EVAL_ERROR_SENTINEL || raw == NO_ENGINE_SENTINEL {
        return Err(BridgeError::EngineFailure);
    }

    match serde_json::from_str::<Value>(raw) {
        Ok(value) => {
            if let Some(message) = value.get("error").and_then(Value::as_str) {
                return Err(BridgeError::Remote(message.to_string()));
            }
            Ok(value)
        }
        // Diagnostic probes may legitimately return a bare scalar.
        Err(_) => Ok(Value::String(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn eval_error_sentinel_is_engine_failure() {
        assert_matches!(classify("EvalScript error."), Err(BridgeError::EngineFailure));
    }

    #[test]
    fn undefined_sentinel_is_engine_failure() {
        assert_matches!(classify("undefined"), Err(BridgeError::EngineFailure));
    }

    #[test]
    fn error_field_maps_to_remote() {
        let err = classify(r#"{"error":"No active composition"}"#).unwrap_err();
        assert_eq!(err, BridgeError::Remote("No active composition".to_string()));
    }

    #[test]
    fn valid_json_passes_through() {
        let value = classify(r#"{"loaded":true,"version":"1.0"}"#).unwrap();
        assert_eq!(value["loaded"], Value::Bool(true));
    }

    #[test]
    fn non_json_becomes_opaque_scalar() {
        let value = classify("ready").unwrap();
        assert_eq!(value, Value::String("ready".to_string()));
    }

    #[test]
    fn non_string_error_field_is_not_remote() {
        // Only a string-typed `error` field denotes a remote failure.
        let value = classify(r#"{"error":null,"ok":1}"#).unwrap();
        assert_eq!(value["ok"], Value::from(1));
    }
}
