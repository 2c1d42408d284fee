//! Per-run state machine bookkeeping.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::events::PipelineEvent;

/// Stages of one pipeline run, in execution order.
///
/// A run visits each stage at most once and never revisits a prior
/// one; `Aborted` is reachable from every non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStage {
    Idle,
    /// Project snapshot, parameter validation, backend readiness.
    Preparing,
    /// Selection discovery and host-side export.
    Exporting,
    /// Race-tolerant artifact reads.
    Loading,
    /// Remote inference call.
    Inferring,
    /// Result written to the deterministic output path.
    Saving,
    /// Result imported back into the host as a new layer.
    Importing,
    Done,
    Aborted,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    /// Where the result artifact was saved.
    pub result_path: PathBuf,
    /// Name of the layer created in the host.
    pub layer_name: String,
    /// The service served a cached artifact for this request.
    pub cached: bool,
    /// Every stage entered, in order, ending with [`RunStage::Done`].
    pub stages: Vec<RunStage>,
}

/// Records the stage trail of an in-flight run and broadcasts each
/// transition. The trail is retained for diagnostics: a failure event
/// names every stage reached before the abort.
pub(crate) struct RunTrace {
    pub run_id: Uuid,
    stages: Vec<RunStage>,
    event_tx: broadcast::Sender<PipelineEvent>,
}

impl RunTrace {
    pub fn new(run_id: Uuid, event_tx: broadcast::Sender<PipelineEvent>) -> Self {
        Self {
            run_id,
            stages: Vec::new(),
            event_tx,
        }
    }

    /// Enter the next stage: record it, log it, broadcast it.
    pub fn advance(&mut self, stage: RunStage) {
        tracing::info!(run_id = %self.run_id, ?stage, "Pipeline stage");
        self.stages.push(stage);
        let _ = self.event_tx.send(PipelineEvent::StageChanged {
            run_id: self.run_id,
            stage,
        });
    }

    /// The stage currently executing.
    pub fn current(&self) -> RunStage {
        self.stages.last().copied().unwrap_or(RunStage::Idle)
    }

    pub fn stages(&self) -> &[RunStage] {
        &self.stages
    }

    pub fn into_stages(self) -> Vec<RunStage> {
        self.stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_records_stages_in_order() {
        let (tx, mut rx) = broadcast::channel(8);
        let mut trace = RunTrace::new(Uuid::new_v4(), tx);
        assert_eq!(trace.current(), RunStage::Idle);

        trace.advance(RunStage::Preparing);
        trace.advance(RunStage::Exporting);

        assert_eq!(trace.current(), RunStage::Exporting);
        assert_eq!(trace.stages(), &[RunStage::Preparing, RunStage::Exporting]);

        assert!(matches!(
            rx.try_recv().unwrap(),
            PipelineEvent::StageChanged { stage: RunStage::Preparing, .. },
        ));
    }
}
