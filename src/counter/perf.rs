//! System-wide `perf stat -I` interval counters.
//!
//! perf prints one CSV line per event per interval on stderr; lines are read
//! as they arrive and grouped by their interval timestamp into one sample.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::RunContext;
use crate::sample::{Layout, Reading, Sample};
use crate::sampler::{LoopEvent, ProgressCallback, SeriesWriter, SourceReport};

pub const SOURCE_NAME: &str = "perf_stat";
pub const FILE_NAME: &str = "perf_stat.csv";

/// Kernel tracepoints and power/thermal PMU events sampled by default.
pub const DEFAULT_EVENTS: &[&str] = &[
    "irq:irq_handler_entry",
    "irq:irq_handler_exit",
    "irq:softirq_entry",
    "irq:softirq_exit",
    "irq:softirq_raise",
    "irq:tasklet_entry",
    "irq:tasklet_exit",
    "tlb:tlb_flush",
    "core_power.throttle",
    "msr/cpu_thermal_margin/",
    "power/energy-pkg/",
    "power/energy-ram/",
];

/// How to invoke perf.
#[derive(Debug, Clone)]
pub struct PerfPlan {
    pub binary: String,
    pub sudo: bool,
    pub interval: Duration,
    pub events: Vec<String>,
    /// CPU list for `taskset -c`.
    pub cpus: Option<String>,
}

impl PerfPlan {
    /// Full argv for a window of `duration`.
    pub fn command(&self, duration: Duration) -> Vec<String> {
        let mut argv = Vec::with_capacity(16);
        if self.sudo {
            argv.push("sudo".to_string());
            argv.push("-n".to_string());
        }
        if let Some(cpus) = &self.cpus {
            argv.extend(["taskset".to_string(), "-c".to_string(), cpus.clone()]);
        }
        argv.push(self.binary.clone());
        argv.extend(
            [
                "stat".to_string(),
                "-a".to_string(),
                "-I".to_string(),
                self.interval.as_millis().max(1).to_string(),
                "-x".to_string(),
                ",".to_string(),
                "-e".to_string(),
                self.events.join(","),
                "--".to_string(),
                "sleep".to_string(),
                format!("{:.3}", duration.as_secs_f64()),
            ],
        );
        argv
    }
}

/// One parsed interval line.
#[derive(Debug, Clone, PartialEq)]
pub struct PerfLine {
    /// Seconds since perf started counting.
    pub time_s: f64,
    pub event: String,
    pub reading: Reading,
}

/// Parse a `perf stat -I -x ,` line: `time,value,unit,event,...`.
/// Comments and blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<PerfLine> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut cols = line.split(',');
    let time_s = cols.next()?.trim().parse::<f64>().ok()?;
    let value = cols.next()?.trim();
    let _unit = cols.next()?;
    let event = cols.next()?.trim();
    if event.is_empty() {
        return None;
    }

    let reading = match value {
        "<not supported>" | "<not counted>" => Reading::Unavailable,
        v => match v.parse::<f64>() {
            Ok(n) => Reading::Value(n),
            Err(_) => Reading::Missing,
        },
    };

    Some(PerfLine {
        time_s,
        event: event.to_string(),
        reading,
    })
}

/// Streams perf's output into `perf_stat.csv` until perf exits or the run
/// is cancelled.
pub struct PerfStatReader {
    plan: PerfPlan,
    writer: SeriesWriter,
    ctx: Arc<RunContext>,
    progress: Option<ProgressCallback>,
}

impl PerfStatReader {
    pub fn new(
        plan: PerfPlan,
        dir: &Path,
        ctx: Arc<RunContext>,
        flush_interval: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(!plan.events.is_empty(), "perf: no events configured");
        let writer = SeriesWriter::create(
            &dir.join(FILE_NAME),
            Layout::Long { key: "event" },
            flush_interval,
        )?;

        Ok(Self {
            plan,
            writer,
            ctx,
            progress: None,
        })
    }

    /// Set a progress callback.
    pub fn with_progress(mut self, cb: ProgressCallback) -> Self {
        self.progress = Some(cb);
        self
    }

    fn notify(&self, event: LoopEvent) {
        if let Some(ref cb) = self.progress {
            cb(SOURCE_NAME, event);
        }
    }

    fn spawn(&self, duration: Duration) -> Result<Child> {
        let argv = self.plan.command(duration);
        let (program, args) = argv.split_first().context("empty perf command")?;

        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", argv.join(" ")))
    }

    /// Run perf for the rest of the run window.
    pub async fn run(mut self, cancel: CancellationToken) -> SourceReport {
        let mut report = SourceReport::new(SOURCE_NAME, FILE_NAME, self.plan.interval);

        let remaining = self.ctx.remaining();
        let anchor_ns = self.ctx.now_ns();

        let mut child = match self.spawn(remaining) {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "perf stat unavailable, continuing without it");
                return self.fail(report, format!("{e:#}"));
            }
        };

        let Some(stderr) = child.stderr.take() else {
            let _ = child.start_kill();
            return self.fail(report, "perf stderr not captured".to_string());
        };
        let mut lines = BufReader::new(stderr).lines();

        info!(events = self.plan.events.len(), interval = ?self.plan.interval, "perf stat started");

        let mut pending: Option<Sample> = None;
        let mut tick = 0u64;
        let mut cancelled = false;
        let mut last_ts = anchor_ns;
        let mut diagnostics: Vec<String> = Vec::new();

        // perf is started with `sleep <remaining>`; the deadline bounds it too.
        let deadline = self.ctx.deadline() + Duration::from_millis(500);

        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    cancelled = true;
                    break;
                }
                line = lines.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "reading perf output");
                    break;
                }
            };

            let Some(parsed) = parse_line(&line) else {
                if !line.trim().is_empty() && !line.starts_with('#') && diagnostics.len() < 8 {
                    diagnostics.push(line.trim().to_string());
                }
                continue;
            };

            let offset_ns = (parsed.time_s * 1e9) as u64;
            // Never step backwards even if perf's clock and ours disagree.
            let ts = anchor_ns.saturating_add(offset_ns).max(last_ts);

            let same_interval = pending.as_ref().is_some_and(|p| p.timestamp_ns == ts);
            if !same_interval {
                if let Some(done) = pending.take() {
                    self.record(&done, &mut report);
                    tick += 1;
                }
                last_ts = ts;
                pending = Some(Sample::new(ts, tick, Vec::with_capacity(self.plan.events.len())));
            }

            if let Some(p) = pending.as_mut() {
                if parsed.reading.is_unavailable() && !report.unavailable.contains(&parsed.event) {
                    report.unavailable.push(parsed.event.clone());
                }
                p.fields.push((parsed.event, parsed.reading));
            }
        }

        if let Some(done) = pending.take() {
            self.record(&done, &mut report);
        }

        if cancelled {
            let _ = child.start_kill();
        }

        let started = Instant::now();
        match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
            Ok(Ok(status)) if status.success() || cancelled => {}
            Ok(Ok(status)) => {
                let detail = if diagnostics.is_empty() {
                    format!("perf exited with {status}")
                } else {
                    format!("perf exited with {status}: {}", diagnostics.join(" | "))
                };
                warn!(error = %detail, "perf stat failed");
                report.degraded = true;
                report.error = Some(detail);
                self.notify(LoopEvent::Degraded);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "waiting for perf");
                report.degraded = true;
                report.error = Some(e.to_string());
            }
            Err(_) => {
                warn!(waited = ?started.elapsed(), "perf did not exit, killing");
                let _ = child.start_kill();
                report.degraded = true;
            }
        }

        self.close(report)
    }

    fn record(&mut self, pending: &Sample, report: &mut SourceReport) {
        // Fields were appended after construction; derive the status now.
        let sample = Sample::new(pending.timestamp_ns, pending.tick, pending.fields.clone());
        report.samples += 1;
        if let Err(e) = self.writer.write(&sample) {
            if report.error.is_none() {
                warn!(error = %e, "writing perf sample failed");
                report.error = Some(format!("{e:#}"));
                report.degraded = true;
            }
        }
        self.notify(LoopEvent::Row(sample.status));
    }

    fn fail(self, mut report: SourceReport, error: String) -> SourceReport {
        report.degraded = true;
        report.error = Some(error);
        self.notify(LoopEvent::Degraded);
        self.close(report)
    }

    fn close(self, mut report: SourceReport) -> SourceReport {
        match self.writer.finish() {
            Ok(rows) => info!(source = SOURCE_NAME, rows, degraded = report.degraded, "source finished"),
            Err(e) => {
                warn!(error = %e, "closing perf output failed");
                report.error.get_or_insert_with(|| format!("{e:#}"));
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::clock::RunWindow;

    #[test]
    fn test_parse_value_line() {
        let line = parse_line("     0.001012459,42,,irq:irq_handler_entry,1001000,100.00,,")
            .expect("parsed");
        assert_eq!(line.event, "irq:irq_handler_entry");
        assert_eq!(line.reading, Reading::Value(42.0));
        assert!((line.time_s - 0.001012459).abs() < 1e-12);
    }

    #[test]
    fn test_parse_unsupported_and_uncounted() {
        let a = parse_line("0.002,<not supported>,,msr/cpu_thermal_margin/,0,100.00,,").expect("a");
        assert_eq!(a.reading, Reading::Unavailable);
        let b = parse_line("0.002,<not counted>,Joules,power/energy-ram/,0,0.00,,").expect("b");
        assert_eq!(b.reading, Reading::Unavailable);
    }

    #[test]
    fn test_parse_skips_noise() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("# started on Mon Jan  1"), None);
        assert_eq!(parse_line("Error: no permission"), None);
    }

    #[test]
    fn test_command_with_sudo() {
        let plan = PerfPlan {
            binary: "perf".into(),
            sudo: true,
            interval: Duration::from_millis(1),
            events: vec!["tlb:tlb_flush".into(), "irq:softirq_entry".into()],
            cpus: None,
        };
        assert_eq!(
            plan.command(Duration::from_millis(66_000)).join(" "),
            "sudo -n perf stat -a -I 1 -x , -e tlb:tlb_flush,irq:softirq_entry -- sleep 66.000"
        );

        let plain = PerfPlan { sudo: false, ..plan };
        assert!(plain.command(Duration::from_secs(1))[0] == "perf");
    }

    #[test]
    fn test_command_pinned_to_cpus() {
        let plan = PerfPlan {
            binary: "perf".into(),
            sudo: true,
            interval: Duration::from_millis(1),
            events: vec!["tlb:tlb_flush".into()],
            cpus: Some("12-13".into()),
        };
        let argv = plan.command(Duration::from_secs(2));
        assert_eq!(argv[..6].join(" "), "sudo -n taskset -c 12-13 perf");
        assert_eq!(argv.last().map(String::as_str), Some("2.000"));
    }

    #[tokio::test]
    async fn test_missing_binary_degrades_without_failing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = Arc::new(RunContext::start(
            "r",
            "neutral",
            RunWindow {
                baseline: Duration::ZERO,
                prompt_phase: Duration::from_secs(1),
                tail: Duration::ZERO,
            },
        ));
        let plan = PerfPlan {
            binary: "/nonexistent/perf-binary".into(),
            sudo: false,
            interval: Duration::from_millis(1),
            events: vec!["tlb:tlb_flush".into()],
            cpus: None,
        };

        let reader =
            PerfStatReader::new(plan, dir.path(), ctx, Duration::from_secs(1)).expect("reader");
        let report = reader.run(CancellationToken::new()).await;

        assert!(report.degraded);
        assert!(report.error.is_some());
        assert_eq!(report.samples, 0);

        let content = std::fs::read_to_string(dir.path().join(FILE_NAME)).expect("read");
        assert_eq!(content, "timestamp_ns,tick,span,event,status,value\n");
    }
}
