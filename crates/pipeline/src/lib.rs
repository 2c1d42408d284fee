//! The inference request pipeline: artifact exchange, the per-run
//! state machine, and its event stream.
//!
//! One [`InpaintPipeline`] instance drives the whole per-frame
//! workflow: project snapshot over the bridge, host-side export,
//! race-tolerant artifact loading, remote inference, result save, and
//! import back into the host -- strictly sequential, cancellable at
//! every suspension point, at most one run in flight.

pub mod artifacts;
pub mod events;
pub mod pipeline;
pub mod run;

pub use artifacts::{ArtifactError, ArtifactExchange, ReadRetryPolicy};
pub use events::PipelineEvent;
pub use pipeline::{InpaintPipeline, PipelineError, RunRequest};
pub use run::{RunStage, RunSummary};
