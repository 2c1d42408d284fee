//! The inference request pipeline.
//!
//! [`InpaintPipeline`] sequences one run end to end: project snapshot
//! -> backend readiness -> selection discovery -> host export ->
//! artifact load -> remote inference -> result save -> host import.
//! Stages run strictly in order; every suspension point is raced
//! against the run's cancellation token; at most one run is active.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use retouch_backend::{
    BackendApi, BackendApiError, BackendSupervisor, InpaintRequest, SupervisorError,
};
use retouch_bridge::{BridgeChannel, BridgeError};
use retouch_core::paths;
use retouch_core::{
    ExportArtifacts, InferenceResult, InpaintParams, LayerSelection, ProjectContext,
};

use crate::artifacts::{self, ArtifactError, ArtifactExchange};
use crate::events::PipelineEvent;
use crate::run::{RunStage, RunSummary, RunTrace};

/// Broadcast capacity for pipeline events.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Name given to the imported result layer.
const RESULT_LAYER_NAME: &str = "Inpaint Result";

/// User-facing inputs for one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub prompt: String,
    pub params: InpaintParams,
}

impl RunRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            params: InpaintParams::default(),
        }
    }
}

/// Errors aborting a pipeline run. Each stage maps its collaborator's
/// failure into exactly one of these; there is no partial-stage
/// recovery.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A run is already active; the new request was rejected before
    /// any state transition.
    #[error("a run is already in progress")]
    RunInProgress,

    /// No open composition, or the host document has never been saved.
    #[error("no open composition or the project has not been saved")]
    NoDocument,

    /// No eligible layer/mask selection in the current composition.
    #[error("no usable selection: {0}")]
    NoSelection(String),

    /// A parameter knob is outside its documented bound.
    #[error("invalid parameters: {0}")]
    InvalidParameters(#[from] retouch_core::InvalidParams),

    /// The host-side export reported an error.
    #[error("export failed: {0}")]
    ExportFailed(String),

    /// The inference call exceeded its upper-bound timeout.
    #[error("inference timed out")]
    InferenceTimeout,

    /// The host failed to import the result as a layer.
    #[error("import failed: {0}")]
    ImportFailed(String),

    /// The run was cancelled by explicit request.
    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Backend(#[from] BackendApiError),
}

/// Single-flight bookkeeping for the active run.
struct ActiveRun {
    run_id: Uuid,
    cancel: CancellationToken,
}

/// Orchestrates inpaint runs against the injected collaborators.
pub struct InpaintPipeline {
    bridge: BridgeChannel,
    api: BackendApi,
    supervisor: Arc<BackendSupervisor>,
    artifacts: ArtifactExchange,
    event_tx: broadcast::Sender<PipelineEvent>,
    active: Mutex<Option<ActiveRun>>,
}

impl InpaintPipeline {
    pub fn new(
        bridge: BridgeChannel,
        api: BackendApi,
        supervisor: Arc<BackendSupervisor>,
        artifacts: ArtifactExchange,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            bridge,
            api,
            supervisor,
            artifacts,
            event_tx,
            active: Mutex::new(None),
        }
    }

    /// Subscribe to pipeline events.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.event_tx.subscribe()
    }

    /// Drive one full run. Rejected with
    /// [`PipelineError::RunInProgress`] while another run is active.
    pub async fn run(&self, request: RunRequest) -> Result<RunSummary, PipelineError> {
        let (run_id, cancel) = self.begin().await?;
        tracing::info!(%run_id, prompt = %request.prompt, "Starting inpaint run");

        let mut trace = RunTrace::new(run_id, self.event_tx.clone());
        let outcome = self.execute(&mut trace, &cancel, &request).await;
        self.active.lock().await.take();

        match outcome {
            Ok((result_path, layer_name, cached)) => {
                tracing::info!(%run_id, path = %result_path.display(), cached, "Run completed");
                let _ = self.event_tx.send(PipelineEvent::RunCompleted {
                    run_id,
                    result_path: result_path.clone(),
                    layer_name: layer_name.clone(),
                    cached,
                });
                Ok(RunSummary {
                    run_id,
                    result_path,
                    layer_name,
                    cached,
                    stages: trace.into_stages(),
                })
            }
            Err(PipelineError::Cancelled) => {
                let stage = trace.current();
                tracing::info!(%run_id, ?stage, "Run cancelled");
                trace.advance(RunStage::Aborted);
                let _ = self.event_tx.send(PipelineEvent::RunCancelled { run_id, stage });
                Err(PipelineError::Cancelled)
            }
            Err(error) => {
                let stage = trace.current();
                tracing::error!(%run_id, ?stage, %error, "Run aborted");
                let stages_reached = trace.stages().to_vec();
                trace.advance(RunStage::Aborted);
                let _ = self.event_tx.send(PipelineEvent::RunFailed {
                    run_id,
                    stage,
                    stages_reached,
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Cancel the active run, if any.
    ///
    /// The only guaranteed side effect is stopping the supervised
    /// backend, which makes an in-flight remote call fail promptly
    /// instead of waiting out its full timeout.
    pub async fn cancel(&self) {
        let active = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|run| (run.run_id, run.cancel.clone()));

        let Some((run_id, cancel)) = active else {
            tracing::debug!("Cancel requested with no active run");
            return;
        };

        tracing::info!(%run_id, "Cancelling run");
        cancel.cancel();
        self.supervisor.stop().await;
    }

    /// Run the export stages only (no inference) and return the
    /// artifact paths the host produced. Shares the single-flight
    /// guard with [`run`](Self::run).
    pub async fn debug_export(&self) -> Result<ExportArtifacts, PipelineError> {
        let (run_id, cancel) = self.begin().await?;
        tracing::info!(%run_id, "Starting debug export");

        let mut trace = RunTrace::new(run_id, self.event_tx.clone());
        let outcome = async {
            trace.advance(RunStage::Preparing);
            let ctx = self.prepare_context(&cancel).await?;
            trace.advance(RunStage::Exporting);
            let selection = self.discover_selection(&cancel).await?;
            let exported = self.request_export(&cancel, &ctx, &selection).await?;
            trace.advance(RunStage::Done);
            Ok(exported)
        }
        .await;
        self.active.lock().await.take();

        match outcome {
            Ok(exported) => Ok(exported),
            Err(PipelineError::Cancelled) => {
                let stage = trace.current();
                trace.advance(RunStage::Aborted);
                let _ = self.event_tx.send(PipelineEvent::RunCancelled { run_id, stage });
                Err(PipelineError::Cancelled)
            }
            Err(error) => {
                let stage = trace.current();
                tracing::error!(%run_id, ?stage, %error, "Debug export aborted");
                let stages_reached = trace.stages().to_vec();
                trace.advance(RunStage::Aborted);
                let _ = self.event_tx.send(PipelineEvent::RunFailed {
                    run_id,
                    stage,
                    stages_reached,
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Drop the service's cached results for the current project.
    pub async fn clear_cache(&self) -> Result<(), PipelineError> {
        let cancel = CancellationToken::new();
        let ctx = self.prepare_context(&cancel).await?;
        self.api.clear_cache(&ctx.root_path).await?;
        tracing::info!(root = %ctx.root_path.display(), "Cache cleared");
        Ok(())
    }

    // ---- stage implementations ----

    async fn execute(
        &self,
        trace: &mut RunTrace,
        cancel: &CancellationToken,
        request: &RunRequest,
    ) -> Result<(PathBuf, String, bool), PipelineError> {
        trace.advance(RunStage::Preparing);
        request.params.validate()?;
        let ctx = self.prepare_context(cancel).await?;
        guard(cancel, self.supervisor.ensure_ready()).await??;

        trace.advance(RunStage::Exporting);
        let selection = self.discover_selection(cancel).await?;
        let exported = self.request_export(cancel, &ctx, &selection).await?;

        trace.advance(RunStage::Loading);
        let image = guard(cancel, self.artifacts.load(&exported.image_path)).await??;
        let mask = guard(cancel, self.artifacts.load(&exported.mask_path)).await??;

        trace.advance(RunStage::Inferring);
        let inference = InpaintRequest::new(
            artifacts::to_wire(&image),
            artifacts::to_wire(&mask),
            request.prompt.trim(),
            &request.params,
            Some(&ctx.root_path),
        );
        drop(image);
        drop(mask);

        // Biased so an explicit cancel wins over the backend-exit
        // signal its own teardown produces.
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            _ = self.supervisor.exited() => return Err(SupervisorError::BackendExited.into()),
            outcome = self.api.inpaint(&inference) => outcome,
        };
        let response = match outcome {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return Err(PipelineError::InferenceTimeout),
            Err(e) => return Err(e.into()),
        };
        if response.cached {
            tracing::info!(run_id = %trace.run_id, "Inference result served from cache");
        } else {
            tracing::info!(run_id = %trace.run_id, "Inference completed");
        }
        let result = InferenceResult {
            result_bytes: artifacts::from_wire(&response.result)
                .map_err(|e| BackendApiError::InvalidPayload(format!("result image: {e}")))?,
            cached: response.cached,
        };

        trace.advance(RunStage::Saving);
        let result_path =
            paths::result_path(&ctx.root_path, &ctx.composition_name, ctx.frame_index);
        guard(cancel, self.artifacts.store(&result.result_bytes, &result_path)).await??;

        trace.advance(RunStage::Importing);
        let imported = match guard(
            cancel,
            self.bridge
                .import_result_as_layer(&result_path, selection.layer_index, RESULT_LAYER_NAME),
        )
        .await?
        {
            Ok(layer) => layer,
            Err(BridgeError::Remote(message)) => {
                return Err(PipelineError::ImportFailed(message))
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            run_id = %trace.run_id,
            layer = %imported.layer_name,
            "Result imported",
        );

        trace.advance(RunStage::Done);
        Ok((result_path, imported.layer_name, result.cached))
    }

    /// Take the per-run project snapshot. A host-side error or an
    /// unsaved document both mean there is nothing to run against.
    async fn prepare_context(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ProjectContext, PipelineError> {
        let info = match guard(cancel, self.bridge.project_info()).await? {
            Ok(info) => info,
            Err(BridgeError::Remote(message)) => {
                tracing::warn!(%message, "No usable project context");
                return Err(PipelineError::NoDocument);
            }
            Err(e) => return Err(e.into()),
        };
        info.into_context().ok_or(PipelineError::NoDocument)
    }

    async fn discover_selection(
        &self,
        cancel: &CancellationToken,
    ) -> Result<LayerSelection, PipelineError> {
        match guard(cancel, self.bridge.selected_layer_with_mask()).await? {
            Ok(selection) => {
                tracing::info!(
                    layer = %selection.layer_name,
                    mask = %selection.mask_name,
                    mask_count = selection.mask_count,
                    "Source selection",
                );
                Ok(selection)
            }
            Err(BridgeError::Remote(message)) => Err(PipelineError::NoSelection(message)),
            Err(e) => Err(e.into()),
        }
    }

    async fn request_export(
        &self,
        cancel: &CancellationToken,
        ctx: &ProjectContext,
        selection: &LayerSelection,
    ) -> Result<ExportArtifacts, PipelineError> {
        let out_dir = paths::cache_dir(&ctx.root_path);
        match guard(
            cancel,
            self.bridge
                .export_for_inpaint(selection.layer_index, selection.mask_index, &out_dir),
        )
        .await?
        {
            Ok(exported) => {
                tracing::info!(image = %exported.image_path.display(), "Frame exported");
                Ok(exported)
            }
            Err(BridgeError::Remote(message)) => Err(PipelineError::ExportFailed(message)),
            Err(e) => Err(e.into()),
        }
    }

    /// Claim the single-flight slot, rejecting when a run is active.
    async fn begin(&self) -> Result<(Uuid, CancellationToken), PipelineError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(PipelineError::RunInProgress);
        }
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        *active = Some(ActiveRun {
            run_id,
            cancel: cancel.clone(),
        });
        Ok((run_id, cancel))
    }
}

/// Race an operation against the run's cancellation token.
///
/// Cancellation abandons the awaited operation (its future is
/// dropped); resources already committed are torn down separately by
/// [`InpaintPipeline::cancel`].
async fn guard<T>(
    cancel: &CancellationToken,
    operation: impl std::future::Future<Output = T>,
) -> Result<T, PipelineError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        value = operation => Ok(value),
    }
}
