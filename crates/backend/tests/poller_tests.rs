//! Status poller behavior against a loopback health endpoint.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use retouch_backend::{BackendApi, ServiceStatus, StatusPoller};

/// Serve `GET /health` reporting the given engine state.
async fn serve_health(engine_loaded: bool) -> String {
    let app = axum::Router::new().route(
        "/health",
        axum::routing::get(move || async move {
            axum::Json(serde_json::json!({
                "status": "ok",
                "engine": "diffusers",
                "engine_loaded": engine_loaded,
                "device": "cpu",
            }))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn api(base_url: String) -> BackendApi {
    BackendApi::new(base_url).with_timeouts(Duration::from_millis(500), Duration::from_secs(5))
}

async fn first_published_status(poller: StatusPoller) -> ServiceStatus {
    let mut rx = poller.subscribe();
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let handle = tokio::spawn(async move { poller.run(cancel_clone).await });

    tokio::time::timeout(Duration::from_secs(5), rx.changed())
        .await
        .expect("poller published no status")
        .unwrap();
    let status = *rx.borrow();

    cancel.cancel();
    handle.await.unwrap();
    status
}

#[tokio::test]
async fn loaded_engine_reports_online_ready() {
    let base_url = serve_health(true).await;
    let poller = StatusPoller::new(api(base_url), Duration::from_millis(50));
    assert_eq!(first_published_status(poller).await, ServiceStatus::OnlineReady);
}

#[tokio::test]
async fn unloaded_engine_reports_model_not_loaded() {
    let base_url = serve_health(false).await;
    let poller = StatusPoller::new(api(base_url), Duration::from_millis(50));
    assert_eq!(
        first_published_status(poller).await,
        ServiceStatus::OnlineModelNotLoaded,
    );
}

#[tokio::test]
async fn refused_connection_reports_offline() {
    // Bind-then-drop leaves a loopback port with no listener.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let poller = StatusPoller::new(
        api(format!("http://127.0.0.1:{port}")),
        Duration::from_millis(50),
    );
    assert_eq!(first_published_status(poller).await, ServiceStatus::Offline);
}

#[tokio::test]
async fn poller_starts_unknown() {
    let base_url = serve_health(true).await;
    let poller = StatusPoller::new(api(base_url), Duration::from_secs(10));
    assert_eq!(poller.status(), ServiceStatus::Unknown);
}
