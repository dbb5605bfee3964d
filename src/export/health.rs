use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::clock::Phase;

const NAMESPACE: &str = "substrate";

const PHASES: &[Phase] = &[
    Phase::Idle,
    Phase::Baseline,
    Phase::PromptPhase,
    Phase::Tail,
    Phase::Finalizing,
    Phase::Done,
];

/// Prometheus metrics describing the progress of the current run.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Rows written per source and status (ok/partial/missed).
    pub samples: CounterVec,
    /// Whether a source is degraded (1) or healthy (0).
    pub source_degraded: GaugeVec,
    /// Finished prompts by outcome.
    pub prompts: CounterVec,
    /// Completion request duration by outcome (100ms-60s buckets).
    pub prompt_duration: HistogramVec,
    /// 1 for the current phase, 0 for every other.
    pub phase: GaugeVec,
}

impl HealthMetrics {
    /// Creates the registry with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let samples = CounterVec::new(
            Opts::new("samples_total", "Rows written by source and status.").namespace(NAMESPACE),
            &["source", "status"],
        )?;
        let source_degraded = GaugeVec::new(
            Opts::new(
                "source_degraded",
                "Whether a source is degraded after repeated failures (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
            &["source"],
        )?;
        let prompts = CounterVec::new(
            Opts::new("prompts_total", "Finished prompts by outcome.").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let prompt_duration = HistogramVec::new(
            HistogramOpts::new(
                "prompt_duration_seconds",
                "Completion request duration by outcome.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 60.0]),
            &["outcome"],
        )?;
        let phase = GaugeVec::new(
            Opts::new("run_phase", "Current run phase (1 for the active phase).")
                .namespace(NAMESPACE),
            &["phase"],
        )?;

        registry.register(Box::new(samples.clone()))?;
        registry.register(Box::new(source_degraded.clone()))?;
        registry.register(Box::new(prompts.clone()))?;
        registry.register(Box::new(prompt_duration.clone()))?;
        registry.register(Box::new(phase.clone()))?;

        let metrics = Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            samples,
            source_degraded,
            prompts,
            prompt_duration,
            phase,
        };
        metrics.set_phase(Phase::Idle);

        Ok(metrics)
    }

    /// Mark `current` as the active phase.
    pub fn set_phase(&self, current: Phase) {
        for p in PHASES {
            let v = if *p == current { 1.0 } else { 0.0 };
            self.phase.with_label_values(&[p.as_str()]).set(v);
        }
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz; returns the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "progress metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "progress metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_gauge_is_one_hot() {
        let m = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        m.set_phase(Phase::PromptPhase);

        let text = m.render().expect("render");
        assert!(text.contains("substrate_run_phase{phase=\"prompt_phase\"} 1"));
        assert!(text.contains("substrate_run_phase{phase=\"baseline\"} 0"));
    }

    #[tokio::test]
    async fn test_server_serves_metrics() {
        let m = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        m.samples.with_label_values(&["system", "ok"]).inc_by(3.0);

        let addr = m.start().await.expect("start");
        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .expect("request")
            .text()
            .await
            .expect("body");
        assert!(body.contains("substrate_samples_total{source=\"system\",status=\"ok\"} 3"));

        let health = reqwest::get(format!("http://{addr}/healthz"))
            .await
            .expect("request")
            .text()
            .await
            .expect("body");
        assert_eq!(health, "ok");

        m.stop();
    }
}
