//! Background service-health polling.
//!
//! A fixed-interval loop, independent of any in-flight pipeline run,
//! that probes `GET /health` and publishes the presentation-facing
//! status over a [`watch`] channel. Probe failures are not retried
//! within a tick -- the next tick naturally retries. The poller never
//! touches the pipeline's single-flight state.

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::api::{BackendApi, BackendApiError, HealthResponse};

/// Default interval between health probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Presentation-facing service status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// No probe has completed yet.
    Unknown,
    /// Service is up and the model is resident in memory.
    OnlineReady,
    /// Service is up but the first request will pay the model load.
    OnlineModelNotLoaded,
    /// Probe failed (connection refused, timeout, or error status).
    Offline,
}

/// Map one probe outcome to a published status.
fn status_from(outcome: Result<HealthResponse, BackendApiError>) -> ServiceStatus {
    match outcome {
        Ok(health) if health.engine_loaded => ServiceStatus::OnlineReady,
        Ok(_) => ServiceStatus::OnlineModelNotLoaded,
        Err(_) => ServiceStatus::Offline,
    }
}

/// Periodic health prober publishing over a `watch` channel.
///
/// `watch` rather than `broadcast`: consumers want the current status,
/// not a backlog of transitions.
pub struct StatusPoller {
    api: BackendApi,
    interval: Duration,
    status_tx: watch::Sender<ServiceStatus>,
}

impl StatusPoller {
    pub fn new(api: BackendApi, interval: Duration) -> Self {
        let (status_tx, _) = watch::channel(ServiceStatus::Unknown);
        Self {
            api,
            interval,
            status_tx,
        }
    }

    /// Subscribe to status updates. The receiver's initial value is
    /// [`ServiceStatus::Unknown`] until the first tick completes.
    pub fn subscribe(&self) -> watch::Receiver<ServiceStatus> {
        self.status_tx.subscribe()
    }

    /// Latest published status.
    pub fn status(&self) -> ServiceStatus {
        *self.status_tx.borrow()
    }

    /// Poll until `cancel` is triggered. The first probe fires
    /// immediately, then once per interval.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Status poller stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let status = status_from(self.api.health().await);
                    self.status_tx.send_if_modified(|current| {
                        if *current == status {
                            return false;
                        }
                        tracing::info!(from = ?*current, to = ?status, "Service status change");
                        *current = status;
                        true
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(engine_loaded: bool) -> HealthResponse {
        HealthResponse {
            status: "ok".to_string(),
            engine: "diffusers".to_string(),
            engine_loaded,
            device: "cpu".to_string(),
        }
    }

    #[test]
    fn loaded_engine_maps_to_ready() {
        assert_eq!(status_from(Ok(health(true))), ServiceStatus::OnlineReady);
    }

    #[test]
    fn unloaded_engine_maps_to_model_not_loaded() {
        assert_eq!(
            status_from(Ok(health(false))),
            ServiceStatus::OnlineModelNotLoaded,
        );
    }

    #[test]
    fn probe_failure_maps_to_offline() {
        let err = BackendApiError::Api {
            status: 500,
            detail: "boom".to_string(),
        };
        assert_eq!(status_from(Err(err)), ServiceStatus::Offline);
    }
}
