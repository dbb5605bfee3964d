//! Optional live-progress endpoint. Wiring helpers turn run events into
//! metric updates; the run never depends on the endpoint being up.

pub mod health;

use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::client::MetricsCallback;
use crate::dispatch::{PromptRecord, RecordCallback};
use crate::sampler::{LoopEvent, ProgressCallback};

pub use health::HealthMetrics;

/// Progress callback feeding sampling-loop events into `metrics`.
pub fn loop_progress(metrics: &Arc<HealthMetrics>) -> ProgressCallback {
    let metrics = Arc::clone(metrics);
    Arc::new(move |source: &str, event: LoopEvent| match event {
        LoopEvent::Row(status) => metrics
            .samples
            .with_label_values(&[source, status.as_str()])
            .inc(),
        LoopEvent::Degraded => metrics
            .source_degraded
            .with_label_values(&[source])
            .set(1.0),
    })
}

/// Record callback counting finished prompts by outcome.
pub fn prompt_records(metrics: &Arc<HealthMetrics>) -> RecordCallback {
    let metrics = Arc::clone(metrics);
    Arc::new(move |record: &PromptRecord| {
        metrics
            .prompts
            .with_label_values(&[record.outcome.as_str()])
            .inc();
    })
}

/// Request-duration callback for the HTTP client.
pub fn request_durations(metrics: &Arc<HealthMetrics>) -> MetricsCallback {
    let metrics = Arc::clone(metrics);
    Box::new(move |outcome: &str, duration: Duration| {
        metrics
            .prompt_duration
            .with_label_values(&[outcome])
            .observe(duration.as_secs_f64());
    })
}
