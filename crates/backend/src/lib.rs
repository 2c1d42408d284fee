//! Inference backend integration: HTTP client, process supervision,
//! and background status polling.
//!
//! The backend is a locally addressable HTTP service with a cold-start
//! delay measured in tens of seconds (interpreter boot + model load).
//! [`BackendApi`] wraps its HTTP surface, [`BackendSupervisor`] owns
//! its process lifecycle, and [`poller`] keeps the presentation layer's
//! view of service health fresh independent of any in-flight request.

pub mod api;
pub mod poller;
pub mod supervisor;

pub use api::{BackendApi, BackendApiError, HealthResponse, InpaintRequest, InpaintResponse};
pub use poller::{ServiceStatus, StatusPoller};
pub use supervisor::{BackendSupervisor, SupervisorConfig, SupervisorError, SupervisorState};
