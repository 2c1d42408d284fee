//! Shared domain types for the retouch orchestration core.
//!
//! This crate holds the data model exchanged between the bridge, the
//! backend client, and the pipeline: project/selection snapshots taken
//! from the host application, inference parameters, and the filesystem
//! layout rules for artifact exchange. It performs no I/O.

pub mod paths;
pub mod types;

pub use types::{
    ExportArtifacts, InferenceResult, InpaintParams, InvalidParams, LayerSelection,
    ProjectContext,
};
