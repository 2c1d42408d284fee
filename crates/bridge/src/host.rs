//! Host scripting capability.

use async_trait::async_trait;

/// Capability to execute script text inside the host application.
///
/// The embedding application injects an implementation at construction
/// time. The engine always resolves with a string -- evaluation
/// failures and detached-engine conditions are reported in-band as
/// sentinel strings, which [`crate::BridgeChannel`] classifies.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    /// Execute `script` in the host engine and return its raw string
    /// result.
    async fn eval(&self, script: &str) -> String;
}
