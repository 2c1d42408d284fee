//! REST client for the inference service HTTP endpoints.
//!
//! Wraps the service surface (health, model load/unload, inpaint,
//! cache clearing) using [`reqwest`]. Two very different timeouts
//! apply: health probes answer within seconds, while an inpaint call
//! may legitimately take most of an hour when it triggers a cold model
//! load.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use retouch_core::InpaintParams;

/// Default service address (loopback only, fixed port).
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:7860";

/// Upper bound for health probes.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for an inpaint call, sized for cold-start inference.
pub const INFERENCE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// HTTP client for the inference service.
#[derive(Clone)]
pub struct BackendApi {
    client: reqwest::Client,
    base_url: String,
    health_timeout: Duration,
    inference_timeout: Duration,
}

/// `GET /health` response.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub engine: String,
    pub engine_loaded: bool,
    pub device: String,
}

/// `POST /inpaint` request body. Image and mask are base64 PNG text.
#[derive(Debug, Clone, Serialize)]
pub struct InpaintRequest {
    pub image: String,
    pub mask: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub strength: f64,
    pub guidance_scale: f64,
    pub num_steps: u32,
    pub controlnet_scale: f64,
    pub feather: u32,
    pub expand: u32,
    pub seed: Option<u64>,
    /// Project root used by the service as its cache key root. Opaque
    /// to this client; cache hit/miss decisions belong to the service.
    pub cache_dir: Option<String>,
}

impl InpaintRequest {
    /// Assemble a request from encoded artifacts and parameter knobs.
    pub fn new(
        image: String,
        mask: String,
        prompt: &str,
        params: &InpaintParams,
        cache_dir: Option<&Path>,
    ) -> Self {
        Self {
            image,
            mask,
            prompt: prompt.to_string(),
            negative_prompt: params.negative_prompt.clone().unwrap_or_default(),
            strength: params.strength,
            guidance_scale: params.guidance,
            num_steps: params.steps,
            controlnet_scale: params.controlnet_scale,
            feather: params.feather,
            expand: params.expand,
            seed: params.seed,
            cache_dir: cache_dir.map(|p| p.to_string_lossy().into_owned()),
        }
    }
}

/// `POST /inpaint` response.
#[derive(Debug, Clone, Deserialize)]
pub struct InpaintResponse {
    /// Base64 PNG result.
    pub result: String,
    /// The service served a previously computed artifact.
    #[serde(default)]
    pub cached: bool,
    pub width: u32,
    pub height: u32,
}

/// Non-2xx responses carry `{"detail": "..."}`.
#[derive(Debug, Deserialize)]
struct ErrorDetail {
    detail: String,
}

#[derive(Debug, Deserialize)]
struct StatusReply {
    status: String,
}

/// Errors from the inference service REST layer.
#[derive(Debug, thiserror::Error)]
pub enum BackendApiError {
    /// The HTTP request itself failed (connect, timeout, reset).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service returned a non-2xx status code.
    #[error("backend error ({status}): {detail}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// The service's `detail` message, or the raw body when the
        /// error payload itself did not parse.
        detail: String,
    },

    /// A 2xx response whose body did not decode as expected.
    #[error("backend returned an invalid payload: {0}")]
    InvalidPayload(String),
}

impl BackendApiError {
    /// True when the underlying request timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(e) if e.is_timeout())
    }
}

impl BackendApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            health_timeout: HEALTH_TIMEOUT,
            inference_timeout: INFERENCE_TIMEOUT,
        }
    }

    /// Override the default timeouts (tests shrink them aggressively).
    pub fn with_timeouts(mut self, health: Duration, inference: Duration) -> Self {
        self.health_timeout = health;
        self.inference_timeout = inference;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /health` -- service liveness plus whether the model is
    /// resident in memory.
    pub async fn health(&self) -> Result<HealthResponse, BackendApiError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(self.health_timeout)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// `POST /load` -- load the model into memory ahead of time.
    pub async fn load_model(&self) -> Result<String, BackendApiError> {
        let response = self
            .client
            .post(format!("{}/load", self.base_url))
            .timeout(self.inference_timeout)
            .send()
            .await?;

        let reply: StatusReply = Self::parse_response(response).await?;
        Ok(reply.status)
    }

    /// `POST /unload` -- release the model's memory.
    pub async fn unload_model(&self) -> Result<String, BackendApiError> {
        let response = self
            .client
            .post(format!("{}/unload", self.base_url))
            .timeout(self.health_timeout)
            .send()
            .await?;

        let reply: StatusReply = Self::parse_response(response).await?;
        Ok(reply.status)
    }

    /// `POST /inpaint` -- submit an inference request.
    ///
    /// Applies the long inference timeout; the caller maps a timeout
    /// here to its own taxonomy.
    pub async fn inpaint(&self, request: &InpaintRequest) -> Result<InpaintResponse, BackendApiError> {
        let response = self
            .client
            .post(format!("{}/inpaint", self.base_url))
            .timeout(self.inference_timeout)
            .json(request)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// `POST /clear-cache?cache_dir=<path>` -- drop cached results for
    /// a project.
    pub async fn clear_cache(&self, cache_dir: &Path) -> Result<(), BackendApiError> {
        let response = self
            .client
            .post(format!("{}/clear-cache", self.base_url))
            .query(&[("cache_dir", &*cache_dir.to_string_lossy())])
            .timeout(self.health_timeout)
            .send()
            .await?;

        Self::ensure_success(response).await?;
        Ok(())
    }

    // ---- private helpers ----

    /// Return the response unchanged on success, or map a non-2xx
    /// status to [`BackendApiError::Api`] with the extracted `detail`.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, BackendApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            let detail = serde_json::from_str::<ErrorDetail>(&body)
                .map(|e| e.detail)
                .unwrap_or(body);
            return Err(BackendApiError::Api {
                status: status.as_u16(),
                detail,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BackendApiError> {
        let response = Self::ensure_success(response).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| BackendApiError::InvalidPayload(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_matches_wire_contract() {
        let params = InpaintParams::default();
        let request = InpaintRequest::new(
            "aW1n".to_string(),
            "bXNr".to_string(),
            "clean plate",
            &params,
            Some(Path::new("/work/demo")),
        );
        let body = serde_json::to_value(&request).unwrap();

        assert_eq!(body["image"], "aW1n");
        assert_eq!(body["mask"], "bXNr");
        assert_eq!(body["prompt"], "clean plate");
        assert_eq!(body["negative_prompt"], "");
        assert_eq!(body["strength"], 0.85);
        assert_eq!(body["guidance_scale"], 7.5);
        assert_eq!(body["num_steps"], 30);
        assert_eq!(body["controlnet_scale"], 0.5);
        assert_eq!(body["seed"], serde_json::Value::Null);
        assert_eq!(body["cache_dir"], "/work/demo");
    }

    #[test]
    fn health_response_decodes() {
        let health: HealthResponse = serde_json::from_str(
            r#"{"status":"ok","engine":"diffusers","engine_loaded":false,"device":"mps"}"#,
        )
        .unwrap();
        assert!(!health.engine_loaded);
        assert_eq!(health.engine, "diffusers");
    }

    #[test]
    fn inpaint_response_defaults_cached_to_false() {
        let reply: InpaintResponse =
            serde_json::from_str(r#"{"result":"cGF5bG9hZA==","width":8,"height":8}"#).unwrap();
        assert!(!reply.cached);
    }
}
