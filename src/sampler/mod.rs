//! Sampling loop: drives one [`Source`] on a fixed wake-up schedule until the
//! run deadline or cancellation, appending every tick to the source's file.

pub mod writer;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{RunContext, Schedule};
use crate::sample::{Sample, SampleStatus, Source};

pub use writer::SeriesWriter;

/// Progress notifications emitted by a sampling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    /// A row was written with this status.
    Row(SampleStatus),
    /// The source crossed the consecutive-failure threshold.
    Degraded,
}

/// Callback receiving `(source name, event)`.
pub type ProgressCallback = Arc<dyn Fn(&str, LoopEvent) + Send + Sync>;

/// Timing knobs for one loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub interval: Duration,
    pub flush_interval: Duration,
    /// Consecutive failures that mark the source degraded.
    pub degrade_after: u32,
}

/// Per-source summary recorded in run metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SourceReport {
    pub name: String,
    pub file: String,
    pub interval_ms: f64,
    /// Rows with data (`ok` or `partial`).
    pub samples: u64,
    /// `missed` rows, including failed reads and skipped ticks.
    pub missed: u64,
    /// Failed reads.
    pub failures: u64,
    pub degraded: bool,
    pub unavailable: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl SourceReport {
    pub fn new(name: &str, file: &str, interval: Duration) -> Self {
        Self {
            name: name.to_string(),
            file: file.to_string(),
            interval_ms: interval.as_nanos() as f64 / 1e6,
            ..Default::default()
        }
    }
}

/// Intervals below this are driven from a dedicated thread; tokio's timer
/// wheel only resolves whole milliseconds.
pub const DEDICATED_THREAD_BELOW: Duration = Duration::from_millis(10);

/// One data source, its output file, and its schedule.
pub struct SamplingLoop<S: Source> {
    source: S,
    writer: SeriesWriter,
    ctx: Arc<RunContext>,
    settings: LoopSettings,
    progress: Option<ProgressCallback>,
    consecutive: u32,
    write_failed: bool,
    /// Tick of the last sample that carried data.
    last_data: Option<u64>,
}

impl<S: Source + 'static> SamplingLoop<S> {
    /// Run until the deadline or `cancel`, then flush and close the file.
    ///
    /// Sub-10 ms sources sample on a blocking thread that sleeps to absolute
    /// deadlines; slower ones share the async runtime.
    pub async fn run(self, cancel: CancellationToken) -> SourceReport {
        if self.settings.interval >= DEDICATED_THREAD_BELOW {
            return self.run_async(cancel).await;
        }

        let fallback =
            SourceReport::new(self.source.name(), self.source.file_name(), self.settings.interval);
        match tokio::task::spawn_blocking(move || self.run_blocking(cancel)).await {
            Ok(report) => report,
            Err(e) => {
                warn!(source = %fallback.name, error = %e, "sampling thread failed");
                SourceReport {
                    degraded: true,
                    error: Some(e.to_string()),
                    ..fallback
                }
            }
        }
    }
}

impl<S: Source> SamplingLoop<S> {
    /// Create the loop and its output file inside `dir`.
    pub fn new(source: S, dir: &Path, ctx: Arc<RunContext>, settings: LoopSettings) -> Result<Self> {
        anyhow::ensure!(
            !settings.interval.is_zero(),
            "{}: sampling interval must be > 0",
            source.name()
        );

        let writer = SeriesWriter::create(
            &dir.join(source.file_name()),
            source.layout(),
            settings.flush_interval,
        )?;

        Ok(Self {
            source,
            writer,
            ctx,
            settings,
            progress: None,
            consecutive: 0,
            write_failed: false,
            last_data: None,
        })
    }

    /// Set a progress callback.
    pub fn with_progress(mut self, cb: ProgressCallback) -> Self {
        self.progress = Some(cb);
        self
    }

    fn notify(&self, event: LoopEvent) {
        if let Some(ref cb) = self.progress {
            cb(self.source.name(), event);
        }
    }

    fn begin(&self) -> SourceReport {
        let mut report =
            SourceReport::new(self.source.name(), self.source.file_name(), self.settings.interval);
        report.unavailable = self.source.unavailable();
        debug!(source = %report.name, interval = ?self.settings.interval, "sampling loop started");
        report
    }

    /// Drive the schedule on tokio's timer.
    pub async fn run_async(mut self, cancel: CancellationToken) -> SourceReport {
        let mut report = self.begin();
        let deadline = self.ctx.deadline();
        let mut schedule = match Schedule::new(Instant::now(), self.settings.interval) {
            Ok(s) => s,
            Err(e) => return self.abort(report, e),
        };

        loop {
            let due = schedule.next_due();
            if due >= deadline {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(due) => {}
            }

            self.tick(&mut schedule, deadline, Instant::now, &mut report);
        }

        self.close(report)
    }

    /// Drive the schedule from the calling thread with `thread::sleep`.
    /// Blocks; call from a dedicated or blocking-pool thread.
    pub fn run_blocking(mut self, cancel: CancellationToken) -> SourceReport {
        let now = || Instant::from_std(std::time::Instant::now());

        let mut report = self.begin();
        let deadline = self.ctx.deadline();
        let mut schedule = match Schedule::new(now(), self.settings.interval) {
            Ok(s) => s,
            Err(e) => return self.abort(report, e),
        };

        loop {
            let due = schedule.next_due();
            if due >= deadline || cancel.is_cancelled() {
                break;
            }

            let wait = due.saturating_duration_since(now());
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
            if cancel.is_cancelled() {
                break;
            }

            self.tick(&mut schedule, deadline, now, &mut report);
        }

        self.close(report)
    }

    /// Sample the due tick, then record every tick whose wake-up passed
    /// meanwhile as missed.
    fn tick(
        &mut self,
        schedule: &mut Schedule,
        deadline: Instant,
        now: impl Fn() -> Instant,
        report: &mut SourceReport,
    ) {
        let tick = schedule.next_index();
        let ts = self.ctx.timestamp_ns(now());

        let sample = match self.source.sample() {
            Ok(fields) => {
                self.consecutive = 0;
                let span = self.last_data.map_or(1, |last| tick - last);
                self.last_data = Some(tick);
                Sample::new(ts, tick, fields).with_span(span)
            }
            Err(e) => {
                self.consecutive += 1;
                report.failures += 1;
                debug!(source = %report.name, tick, error = %e, "sample failed");

                if self.consecutive >= self.settings.degrade_after && !report.degraded {
                    report.degraded = true;
                    warn!(
                        source = %report.name,
                        consecutive = self.consecutive,
                        error = %e,
                        "source degraded after repeated failures"
                    );
                    self.notify(LoopEvent::Degraded);
                }
                Sample::missed(ts, tick)
            }
        };

        self.record(&sample, report);

        for skipped in schedule.advance(now()) {
            if schedule.tick_at(skipped) >= deadline {
                break;
            }
            let marker = Sample::missed(self.ctx.timestamp_ns(now()), skipped);
            self.record(&marker, report);
        }
    }

    fn record(&mut self, sample: &Sample, report: &mut SourceReport) {
        match sample.status {
            SampleStatus::Missed => report.missed += 1,
            _ => report.samples += 1,
        }

        if let Err(e) = self.writer.write(sample) {
            if !self.write_failed {
                self.write_failed = true;
                report.degraded = true;
                report.error = Some(format!("{e:#}"));
                warn!(source = %self.source.name(), error = %e, "writing sample failed");
                self.notify(LoopEvent::Degraded);
            }
        }

        self.notify(LoopEvent::Row(sample.status));
    }

    fn abort(self, mut report: SourceReport, err: anyhow::Error) -> SourceReport {
        report.error = Some(err.to_string());
        report.degraded = true;
        self.close(report)
    }

    fn close(self, mut report: SourceReport) -> SourceReport {
        match self.writer.finish() {
            Ok(rows) => {
                info!(
                    source = %report.name,
                    rows,
                    samples = report.samples,
                    missed = report.missed,
                    degraded = report.degraded,
                    "source finished"
                );
            }
            Err(e) => {
                warn!(source = %report.name, error = %e, "closing output failed");
                report.error.get_or_insert_with(|| format!("{e:#}"));
            }
        }
        report
    }
}
