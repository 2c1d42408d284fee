//! Request/response bridge to the host application's scripting engine.
//!
//! The host engine executes arbitrary script text and returns exactly
//! one string; it has no native notion of promises, JSON, or errors.
//! This crate turns that surface into a typed contract:
//!
//! - [`ScriptHost`] — the injected capability that evaluates script
//!   text (the core never assumes ambient global state on the host).
//! - [`BridgeChannel`] — classifies raw result strings into structured
//!   values or [`BridgeError`]s.
//! - [`commands`] — command text builders and typed wrappers for the
//!   operations the pipeline needs.

pub mod channel;
pub mod commands;
pub mod host;

pub use channel::{BridgeChannel, BridgeError};
pub use commands::{ImportedLayer, ProjectInfo};
pub use host::ScriptHost;
