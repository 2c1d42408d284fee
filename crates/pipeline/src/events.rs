//! Events emitted by the pipeline for the presentation layer.

use std::path::PathBuf;

use serde::Serialize;
use uuid::Uuid;

use crate::run::RunStage;

/// A state change the embedding application cares about.
///
/// Broadcast over a `tokio::sync::broadcast` channel; subscribe via
/// [`crate::InpaintPipeline::subscribe`].
#[derive(Debug, Clone, Serialize)]
pub enum PipelineEvent {
    /// The active run entered a new stage.
    StageChanged { run_id: Uuid, stage: RunStage },

    /// The run finished end to end.
    RunCompleted {
        run_id: Uuid,
        result_path: PathBuf,
        /// Name of the layer created in the host.
        layer_name: String,
        /// The service answered from its cache -- worth surfacing to
        /// the user, identical handling otherwise.
        cached: bool,
    },

    /// The run aborted with an error.
    RunFailed {
        run_id: Uuid,
        /// The stage that was executing when the run aborted.
        stage: RunStage,
        /// Every stage reached before the failure, in order.
        stages_reached: Vec<RunStage>,
        /// Human-readable cause, naming the failing collaborator.
        error: String,
    },

    /// The run was cancelled by explicit request.
    RunCancelled { run_id: Uuid, stage: RunStage },
}
