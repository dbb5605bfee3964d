use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ServerConfig;

/// Upper bound for one readiness check.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest response body kept in error messages.
const MAX_ERROR_BODY: usize = 2048;

/// Callback type for recording completion request metrics.
/// Receives (outcome, duration).
pub type MetricsCallback = Box<dyn Fn(&str, Duration) + Send + Sync>;

/// Why a completion request did not produce a JSON response.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("response is not JSON: {error}")]
    Decode {
        status: u16,
        body: String,
        error: String,
    },

    #[error("cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Short outcome label used in records and metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            DispatchError::Timeout(_) => "timeout",
            DispatchError::Connect(_) => "connection",
            DispatchError::Status { .. } => "http_status",
            DispatchError::Decode { .. } => "decode",
            DispatchError::Cancelled => "cancelled",
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            DispatchError::Status { status, .. } | DispatchError::Decode { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// Body of a completion request.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub n_predict: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ignore_eos: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logit_bias: Vec<Value>,
}

/// A successful completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub status: u16,
    pub body: Value,
}

/// Inference server API.
pub trait InferenceClient: Send + Sync {
    /// Send one completion request, bounded by `timeout`.
    fn complete(
        &self,
        req: &CompletionRequest,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<Completion, DispatchError>> + Send;

    /// Query the readiness endpoint once.
    fn health(&self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Lets several windows borrow one client in turn.
impl<C: InferenceClient> InferenceClient for &C {
    fn complete(
        &self,
        req: &CompletionRequest,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<Completion, DispatchError>> + Send {
        (**self).complete(req, timeout)
    }

    fn health(&self) -> impl std::future::Future<Output = Result<()>> + Send {
        (**self).health()
    }
}

/// HTTP inference server client.
pub struct HttpClient {
    http: reqwest::Client,
    completion_url: String,
    health_url: String,
    metrics: Option<MetricsCallback>,
}

impl HttpClient {
    /// Create a new inference server client.
    pub fn new(cfg: &ServerConfig) -> Result<Self> {
        let base = cfg.endpoint.trim_end_matches('/');

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            completion_url: format!("{base}{}", cfg.completion_path),
            health_url: format!("{base}{}", cfg.health_path),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, outcome: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(outcome, duration);
        }
    }

    async fn send(&self, req: &CompletionRequest) -> Result<Completion, DispatchError> {
        let response = self
            .http
            .post(&self.completion_url)
            .header("Accept", "application/json")
            .json(req)
            .send()
            .await
            .map_err(|e| DispatchError::Connect(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| DispatchError::Connect(format!("reading body: {e}")))?;

        if !status.is_success() {
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body: truncate(text),
            });
        }

        match serde_json::from_str::<Value>(&text) {
            Ok(body) => Ok(Completion {
                status: status.as_u16(),
                body,
            }),
            Err(e) => Err(DispatchError::Decode {
                status: status.as_u16(),
                body: text,
                error: e.to_string(),
            }),
        }
    }
}

impl InferenceClient for HttpClient {
    async fn complete(
        &self,
        req: &CompletionRequest,
        timeout: Duration,
    ) -> Result<Completion, DispatchError> {
        let start = Instant::now();

        let result = match tokio::time::timeout(timeout, self.send(req)).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(timeout)),
        };

        let outcome = match &result {
            Ok(_) => "completed",
            Err(e) => e.outcome(),
        };
        self.record_request(outcome, start.elapsed());

        result
    }

    async fn health(&self) -> Result<()> {
        let response = self
            .http
            .get(&self.health_url)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("requesting {}", self.health_url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("health endpoint returned {status}");
        }

        Ok(())
    }
}

/// Poll the health endpoint until it answers 2xx or `timeout` passes.
pub async fn wait_ready<C: InferenceClient>(
    client: &C,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let last_error = match client.health().await {
            Ok(()) => {
                info!(attempts, "inference server ready");
                return Ok(());
            }
            Err(e) => e,
        };
        debug!(attempts, error = %last_error, "server not ready yet");

        if Instant::now() + poll_interval > deadline {
            return Err(last_error.context(format!(
                "server not ready after {timeout:?} ({attempts} attempts)"
            )));
        }

        tokio::select! {
            _ = cancel.cancelled() => bail!("cancelled while waiting for server"),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let req = CompletionRequest {
            prompt: "hello".into(),
            n_predict: 50,
            ignore_eos: true,
            logit_bias: vec![serde_json::json!([2, -100.0])],
        };
        assert_eq!(
            serde_json::to_value(&req).expect("serialize"),
            serde_json::json!({
                "prompt": "hello",
                "n_predict": 50,
                "ignore_eos": true,
                "logit_bias": [[2, -100.0]],
            })
        );

        let minimal = CompletionRequest {
            ignore_eos: false,
            logit_bias: Vec::new(),
            ..req
        };
        assert_eq!(
            serde_json::to_value(&minimal).expect("serialize"),
            serde_json::json!({"prompt": "hello", "n_predict": 50})
        );
    }

    #[test]
    fn test_error_outcomes() {
        assert_eq!(DispatchError::Timeout(Duration::from_secs(1)).outcome(), "timeout");
        assert_eq!(DispatchError::Connect("refused".into()).outcome(), "connection");
        let status = DispatchError::Status {
            status: 503,
            body: "loading".into(),
        };
        assert_eq!(status.outcome(), "http_status");
        assert_eq!(status.status_code(), Some(503));
        assert_eq!(DispatchError::Cancelled.status_code(), None);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let body = "é".repeat(MAX_ERROR_BODY);
        let cut = truncate(body);
        assert!(cut.len() <= MAX_ERROR_BODY);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_urls_join_without_double_slash() {
        let cfg = ServerConfig {
            endpoint: "http://localhost:8000/".into(),
            ..Default::default()
        };
        let client = HttpClient::new(&cfg).expect("client");
        assert_eq!(client.completion_url, "http://localhost:8000/completion");
        assert_eq!(client.health_url, "http://localhost:8000/health");
    }

    struct FlakyHealth {
        ready_after: u32,
        calls: std::sync::atomic::AtomicU32,
    }

    impl InferenceClient for FlakyHealth {
        async fn complete(
            &self,
            _req: &CompletionRequest,
            _timeout: Duration,
        ) -> Result<Completion, DispatchError> {
            Err(DispatchError::Cancelled)
        }

        async fn health(&self) -> Result<()> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if n >= self.ready_after {
                Ok(())
            } else {
                bail!("loading model")
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_polls_until_healthy() {
        let client = FlakyHealth {
            ready_after: 3,
            calls: Default::default(),
        };
        wait_ready(
            &client,
            Duration::from_secs(5),
            Duration::from_millis(500),
            &CancellationToken::new(),
        )
        .await
        .expect("ready");
        assert_eq!(client.calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_times_out() {
        let client = FlakyHealth {
            ready_after: u32::MAX,
            calls: Default::default(),
        };
        let err = wait_ready(
            &client,
            Duration::from_secs(2),
            Duration::from_millis(500),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("server not ready"));
        assert!(format!("{err:#}").contains("loading model"));
    }
}
