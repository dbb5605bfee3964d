//! Run Orchestrator: owns one run from setup to finalization.
//!
//! `Idle -> Baseline -> PromptPhase -> Tail -> Finalizing -> Done`, with a
//! jump to `Finalizing` on cancellation. Setup failures abort before any
//! output directory exists; everything after that is best effort and ends
//! with a complete `meta.json`. `trials` repeats the window once per prompt.

pub mod host;
pub mod kernel_log;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::{Phase, RunContext, RunWindow};
use crate::config::{Config, TargetConfig};
use crate::counter::perf::{self, PerfStatReader};
use crate::counter::ProcCounterReader;
use crate::dispatch::{
    wait_ready, DispatchSettings, DispatchSummary, Dispatcher, InferenceClient, PhaseEnd, Prompt,
    PromptRecord, PromptSet,
};
use crate::export::{self, HealthMetrics};
use crate::pid::{self, DockerInspect, ResolvedTarget};
use crate::procfs::HostFs;
use crate::sample::Source;
use crate::sampler::{LoopSettings, ProgressCallback, SamplingLoop, SourceReport};
use crate::snapshot::{ProcessSnapshotter, SystemSnapshotter};

/// Crate version recorded in metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const META_FILE: &str = "meta.json";
pub const COLLECTOR_META_FILE: &str = "collector_meta.json";
pub const RESPONSES_FILE: &str = "responses.jsonl";
pub const TRIAL_META_FILE: &str = "trial_meta.json";

/// Durations of the run's phases in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub baseline_s: f64,
    pub prompt_phase_s: f64,
    pub tail_s: f64,
    pub total_s: f64,
}

impl Timing {
    fn configured(window: RunWindow) -> Self {
        Self {
            baseline_s: window.baseline.as_secs_f64(),
            prompt_phase_s: window.prompt_phase.as_secs_f64(),
            tail_s: window.tail.as_secs_f64(),
            total_s: window.total().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSetInfo {
    pub path: PathBuf,
    pub sha256: String,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Run,
    Collect,
}

/// Summary of a finished run, written once as `meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub label: String,
    pub version: String,
    pub mode: RunMode,
    pub target: ResolvedTarget,
    pub prompt_set: Option<PromptSetInfo>,
    /// Index of the first prompt dispatched.
    #[serde(default)]
    pub start_index: usize,
    /// Outcome of the pre-run page cache drop; absent when not configured.
    #[serde(default)]
    pub caches_dropped: Option<bool>,
    pub n_predict: u32,
    pub configured: Timing,
    pub actual: Timing,
    pub t0_ns: u64,
    pub t_prompt_phase_start_ns: Option<u64>,
    pub t_prompt_phase_end_ns: Option<u64>,
    pub t_end_ns: u64,
    pub prompts_configured: usize,
    pub prompts_dispatched: usize,
    pub prompts_completed: usize,
    pub prompts_failed: usize,
    pub prompts_skipped: usize,
    pub prompt_phase_end: Option<PhaseEnd>,
    pub interrupted: bool,
    pub sources: Vec<SourceReport>,
}

/// Configuration snapshot written when sampling starts and again, with
/// `t1_ns`, at finalization.
#[derive(Debug, Serialize)]
struct CollectorMeta<'a> {
    run_id: &'a str,
    label: &'a str,
    version: &'a str,
    target: &'a ResolvedTarget,
    t0_ns: u64,
    t1_ns: Option<u64>,
    config: &'a Config,
}

/// Result of one single-prompt trial, written as `trial_meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialMeta {
    pub prompt_index: usize,
    pub label: String,
    pub ok: bool,
    pub run_id: Option<String>,
    pub t_request_start_ns: Option<u64>,
    pub t_request_end_ns: Option<u64>,
    pub elapsed_ms: Option<f64>,
    pub error: Option<String>,
}

impl TrialMeta {
    /// Summarize a finished window from its single prompt record.
    fn finished(prompt_index: usize, label: &str, outcome: &RunOutcome) -> Self {
        let record = first_record(&outcome.dir);
        let error = match &record {
            Some(r) if r.ok => None,
            Some(r) => Some(r.error.clone().unwrap_or_else(|| r.outcome.as_str().to_string())),
            None => Some("prompt was not dispatched".to_string()),
        };

        Self {
            prompt_index,
            label: label.to_string(),
            ok: error.is_none(),
            run_id: Some(outcome.meta.run_id.clone()),
            t_request_start_ns: record.as_ref().map(|r| r.t_request_start_ns),
            t_request_end_ns: record.as_ref().map(|r| r.t_request_end_ns),
            elapsed_ms: record.as_ref().map(|r| r.duration_ms),
            error,
        }
    }

    fn failed(prompt_index: usize, label: &str, error: String) -> Self {
        Self {
            prompt_index,
            label: label.to_string(),
            ok: false,
            run_id: None,
            t_request_start_ns: None,
            t_request_end_ns: None,
            elapsed_ms: None,
            error: Some(error),
        }
    }
}

fn first_record(dir: &Path) -> Option<PromptRecord> {
    let text = std::fs::read_to_string(dir.join(RESPONSES_FILE)).ok()?;
    serde_json::from_str(text.lines().next()?).ok()
}

/// Where a series of trials left its files.
#[derive(Debug, Clone)]
pub struct TrialsOutcome {
    pub root: PathBuf,
    pub trials: Vec<TrialMeta>,
    pub interrupted: bool,
}

/// Where a finished run left its files.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub dir: PathBuf,
    pub meta: RunMetadata,
}

/// Labels become part of the directory name.
pub fn validate_label(label: &str) -> Result<()> {
    if label.is_empty() {
        bail!("label must not be empty");
    }
    if label.len() > 64 {
        bail!("label must be at most 64 characters");
    }
    if let Some(c) = label
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        bail!("label {label:?} contains invalid character {c:?}");
    }
    if label.starts_with('.') {
        bail!("label must not start with '.'");
    }
    Ok(())
}

pub fn run_id(now: DateTime<Local>, label: &str) -> String {
    format!("{}_{label}", now.format("%Y-%m-%dT%H-%M-%S"))
}

/// Serialize `value` to a temporary sibling and rename it into place.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(value).context("serializing JSON")?;
    write_atomic(path, &body)
}

/// Write `body` to a `.tmp` sibling and rename it over `path`.
pub fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))
}

type LoopFuture = Pin<Box<dyn Future<Output = SourceReport> + Send>>;

struct SourceTask {
    name: String,
    file: String,
    interval: Duration,
    handle: JoinHandle<SourceReport>,
}

/// The running sampling loops of one run.
struct Sampling {
    tasks: Vec<SourceTask>,
    cancel: CancellationToken,
}

impl Sampling {
    /// Open every enabled source's file, then spawn all loops together.
    fn start(
        cfg: &Config,
        fs: &HostFs,
        pid: u32,
        dir: &Path,
        ctx: &Arc<RunContext>,
        parent: &CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> Result<Self> {
        let cancel = parent.child_token();
        let s = &cfg.sampling;
        let mut pending: Vec<(String, String, Duration, LoopFuture)> = Vec::new();

        let settings = |interval: Duration| LoopSettings {
            interval,
            flush_interval: s.flush_interval,
            degrade_after: s.degrade_after,
        };

        if s.counters.enabled {
            let reader = ProcCounterReader::new(fs.clone(), &s.counters.event_names())
                .context("starting counter reader")?;
            pending.push(prepare(reader, dir, ctx, settings(s.counters.interval), &progress, &cancel)?);
        }

        if s.system.enabled {
            let snap = SystemSnapshotter::new(fs.clone());
            pending.push(prepare(snap, dir, ctx, settings(s.system.interval), &progress, &cancel)?);
        }

        if s.process.enabled {
            let snap = ProcessSnapshotter::new(fs.clone(), pid)
                .context("starting process snapshotter")?;
            pending.push(prepare(snap, dir, ctx, settings(s.process.interval), &progress, &cancel)?);
        }

        if s.perf.enabled {
            let mut reader = PerfStatReader::new(s.perf.plan(), dir, Arc::clone(ctx), s.flush_interval)
                .context("starting perf stat reader")?;
            if let Some(cb) = &progress {
                reader = reader.with_progress(Arc::clone(cb));
            }
            let token = cancel.clone();
            pending.push((
                perf::SOURCE_NAME.to_string(),
                perf::FILE_NAME.to_string(),
                s.perf.interval,
                Box::pin(reader.run(token)),
            ));
        }

        let tasks = pending
            .into_iter()
            .map(|(name, file, interval, fut)| SourceTask {
                name,
                file,
                interval,
                handle: tokio::spawn(fut),
            })
            .collect::<Vec<_>>();

        info!(sources = tasks.len(), "sampling started");

        Ok(Self { tasks, cancel })
    }

    /// Stop every loop and collect its report, waiting at most `grace`.
    async fn stop(self, grace: Duration) -> Vec<SourceReport> {
        self.cancel.cancel();
        let deadline = Instant::now() + grace;

        let mut reports = Vec::with_capacity(self.tasks.len());
        for mut task in self.tasks {
            let report = match tokio::time::timeout_at(deadline, &mut task.handle).await {
                Ok(Ok(report)) => report,
                Ok(Err(e)) => {
                    error!(source = %task.name, error = %e, "sampling task failed");
                    let mut report = SourceReport::new(&task.name, &task.file, task.interval);
                    report.degraded = true;
                    report.error = Some(format!("sampling task failed: {e}"));
                    report
                }
                Err(_) => {
                    warn!(source = %task.name, grace = ?grace, "sampling task did not stop in time");
                    task.handle.abort();
                    let mut report = SourceReport::new(&task.name, &task.file, task.interval);
                    report.degraded = true;
                    report.error = Some(format!("did not stop within {grace:?}"));
                    report
                }
            };
            reports.push(report);
        }

        reports
    }
}

fn prepare<S: Source + 'static>(
    source: S,
    dir: &Path,
    ctx: &Arc<RunContext>,
    settings: LoopSettings,
    progress: &Option<ProgressCallback>,
    cancel: &CancellationToken,
) -> Result<(String, String, Duration, LoopFuture)> {
    let name = source.name().to_string();
    let file = source.file_name().to_string();

    let mut lp = SamplingLoop::new(source, dir, Arc::clone(ctx), settings)
        .with_context(|| format!("opening {file}"))?;
    if let Some(cb) = progress {
        lp = lp.with_progress(Arc::clone(cb));
    }

    Ok((name, file, settings.interval, Box::pin(lp.run(cancel.clone()))))
}

/// Tracks the current phase and mirrors it into metrics.
struct PhaseTracker {
    current: Phase,
    metrics: Option<Arc<HealthMetrics>>,
}

impl PhaseTracker {
    fn new(metrics: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            current: Phase::Idle,
            metrics,
        }
    }

    fn enter(&mut self, to: Phase) {
        if !self.current.can_transition(to) {
            warn!(from = self.current.as_str(), to = to.as_str(), "unexpected phase transition");
        }
        info!(from = self.current.as_str(), phase = to.as_str(), "phase transition");
        self.current = to;
        if let Some(m) = &self.metrics {
            m.set_phase(to);
        }
    }
}

/// Sleep until `at`; returns false if `cancel` fired first.
async fn sleep_or_cancel(at: Instant, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep_until(at) => true,
    }
}

fn create_run_dir(root: &Path, run_id: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(root).with_context(|| format!("creating {}", root.display()))?;
    let dir = root.join(run_id);
    std::fs::create_dir(&dir).with_context(|| format!("creating run directory {}", dir.display()))?;
    Ok(dir)
}

fn remove_partial_dir(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        warn!(dir = %dir.display(), error = %e, "removing partial run directory failed");
    }
}

fn secs_between(from: Instant, to: Instant) -> f64 {
    to.saturating_duration_since(from).as_secs_f64()
}

/// Timestamps taken while the phases ran.
struct PhaseMarks {
    prompt_start: Option<Instant>,
    prompt_end: Option<Instant>,
    sampling_end: Instant,
}

impl PhaseMarks {
    fn actual(&self, ctx: &RunContext) -> Timing {
        let started = ctx.started();
        let baseline_end = self.prompt_start.unwrap_or(self.sampling_end);
        let prompt_end = self.prompt_end.unwrap_or(baseline_end);
        Timing {
            baseline_s: secs_between(started, baseline_end),
            prompt_phase_s: secs_between(baseline_end, prompt_end),
            tail_s: secs_between(prompt_end, self.sampling_end),
            total_s: secs_between(started, self.sampling_end),
        }
    }
}

/// Drives `run` and `trials` invocations against an inference server.
pub struct Runner<C: InferenceClient> {
    cfg: Config,
    fs: HostFs,
    client: C,
    metrics: Option<Arc<HealthMetrics>>,
    start_index: usize,
}

/// A window whose setup checks have passed and whose directory exists.
struct WindowPlan<'a> {
    dir: PathBuf,
    run_id: String,
    label: &'a str,
    prompt_set: &'a PromptSet,
    prompts: &'a [Prompt],
    start_index: usize,
    target: ResolvedTarget,
    caches_dropped: Option<bool>,
}

impl<C: InferenceClient> Runner<C> {
    pub fn new(cfg: Config, client: C) -> Self {
        Self {
            cfg,
            fs: HostFs::default(),
            client,
            metrics: None,
            start_index: 0,
        }
    }

    /// Read procfs/sysfs from other roots.
    pub fn with_host(mut self, fs: HostFs) -> Self {
        self.fs = fs;
        self
    }

    /// Report progress into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Skip prompts before `index`; prompts keep their position in the set.
    pub fn with_start_index(mut self, index: usize) -> Self {
        self.start_index = index;
        self
    }

    /// Execute one full run. Errors are setup failures; once the run
    /// directory exists the run always finalizes.
    pub async fn run(&self, prompts: &Path, label: &str, cancel: CancellationToken) -> Result<RunOutcome> {
        validate_label(label)?;
        self.cfg.validate_target()?;
        let prompt_set = PromptSet::load(prompts)?;
        let selected = select_prompts(&prompt_set, self.start_index)?;
        info!(
            prompts = prompt_set.len(),
            selected = selected.len(),
            sha256 = %prompt_set.sha256,
            "loaded prompt set"
        );

        let target = self.resolve_target()?;
        self.wait_ready(&cancel).await?;
        let caches_dropped = host::prepare(&self.cfg.prepare).await;

        let run_id = run_id(Local::now(), label);
        let dir = create_run_dir(&self.cfg.output_dir, &run_id)?;

        let plan = WindowPlan {
            dir,
            run_id,
            label,
            prompt_set: &prompt_set,
            prompts: selected,
            start_index: self.start_index,
            target,
            caches_dropped,
        };
        self.window(plan, &cancel).await
    }

    /// One full window per prompt under `<output_dir>/<label>/pNNNN/`, each
    /// with a `trial_meta.json`. A trial that fails to set up is recorded
    /// and the next one starts; cancellation stops the series.
    pub async fn trials(
        &self,
        prompts: &Path,
        label: &str,
        cancel: CancellationToken,
    ) -> Result<TrialsOutcome> {
        validate_label(label)?;
        self.cfg.validate_target()?;
        let prompt_set = PromptSet::load(prompts)?;
        let selected = select_prompts(&prompt_set, self.start_index)?;

        let root = self.cfg.output_dir.join(label);
        if let Some(existing) = selected
            .iter()
            .map(|p| root.join(trial_dir_name(p.index)))
            .find(|d| d.exists())
        {
            bail!("trial directory {} already exists", existing.display());
        }
        std::fs::create_dir_all(&root).with_context(|| format!("creating {}", root.display()))?;

        info!(
            root = %root.display(),
            trials = selected.len(),
            first = self.start_index,
            "starting trials"
        );

        let mut trials = Vec::with_capacity(selected.len());
        for prompt in selected {
            if cancel.is_cancelled() {
                info!(remaining = selected.len() - trials.len(), "trials interrupted");
                break;
            }

            let dir = root.join(trial_dir_name(prompt.index));
            let trial = match self.trial(&prompt_set, prompt, label, dir.clone(), &cancel).await {
                Ok(outcome) => TrialMeta::finished(prompt.index, label, &outcome),
                Err(e) => {
                    let error = format!("{e:#}");
                    warn!(prompt = prompt.index, error = %error, "trial failed");
                    TrialMeta::failed(prompt.index, label, error)
                }
            };

            std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
            write_json_atomic(&dir.join(TRIAL_META_FILE), &trial).context("writing trial metadata")?;
            info!(prompt = prompt.index, ok = trial.ok, "trial finished");
            trials.push(trial);
        }

        Ok(TrialsOutcome {
            root,
            trials,
            interrupted: cancel.is_cancelled(),
        })
    }

    async fn trial(
        &self,
        prompt_set: &PromptSet,
        prompt: &Prompt,
        label: &str,
        dir: PathBuf,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let target = self.resolve_target()?;
        self.wait_ready(cancel).await?;
        let caches_dropped = host::prepare(&self.cfg.prepare).await;

        std::fs::create_dir(&dir)
            .with_context(|| format!("creating trial directory {}", dir.display()))?;

        let plan = WindowPlan {
            dir,
            run_id: run_id(Local::now(), label),
            label,
            prompt_set,
            prompts: std::slice::from_ref(prompt),
            start_index: prompt.index,
            target,
            caches_dropped,
        };
        self.window(plan, cancel).await
    }

    fn resolve_target(&self) -> Result<ResolvedTarget> {
        pid::resolve(&self.fs, &self.cfg.target, &DockerInspect).context("resolving target process")
    }

    async fn wait_ready(&self, cancel: &CancellationToken) -> Result<()> {
        wait_ready(
            &self.client,
            self.cfg.server.ready_timeout,
            self.cfg.server.ready_poll_interval,
            cancel,
        )
        .await
        .context("waiting for inference server")
    }

    /// Baseline, prompt phase, tail and finalization in `plan.dir`. The
    /// directory is removed if its outputs cannot be opened.
    async fn window(&self, plan: WindowPlan<'_>, cancel: &CancellationToken) -> Result<RunOutcome> {
        let cfg = &self.cfg;
        let WindowPlan {
            dir,
            run_id,
            label,
            prompt_set,
            prompts,
            start_index,
            target,
            caches_dropped,
        } = plan;

        let ctx = Arc::new(RunContext::start(run_id.clone(), label, cfg.run_window()));
        let progress = self.metrics.as_ref().map(export::loop_progress);

        let opened = (|| -> Result<_> {
            let settings = DispatchSettings {
                n_predict: cfg.server.n_predict,
                ignore_eos: cfg.server.ignore_eos,
                logit_bias: cfg.server.logit_bias.clone(),
                request_timeout: cfg.server.request_timeout,
                min_request_budget: cfg.window.min_request_budget,
            };
            let mut dispatcher =
                Dispatcher::new(&self.client, settings, Arc::clone(&ctx), &dir.join(RESPONSES_FILE))?;
            if let Some(m) = &self.metrics {
                dispatcher = dispatcher.with_record_callback(export::prompt_records(m));
            }
            write_collector_meta(&dir, &ctx, label, &target, cfg, None)?;
            let sampling = Sampling::start(cfg, &self.fs, target.pid, &dir, &ctx, cancel, progress)?;
            Ok((dispatcher, sampling))
        })();

        let (mut dispatcher, sampling) = match opened {
            Ok(v) => v,
            Err(e) => {
                remove_partial_dir(&dir);
                return Err(e.context("opening run outputs"));
            }
        };

        info!(run_id = %run_id, dir = %dir.display(), pid = target.pid, "run started");

        let mut phase = PhaseTracker::new(self.metrics.clone());
        phase.enter(Phase::Baseline);

        let mut marks = PhaseMarks {
            prompt_start: None,
            prompt_end: None,
            sampling_end: ctx.started(),
        };
        let mut t_prompt_start_ns = None;
        let mut t_prompt_end_ns = None;
        let mut summary = DispatchSummary {
            configured: prompts.len(),
            dispatched: 0,
            completed: 0,
            failed: 0,
            skipped: prompts.len(),
            end: PhaseEnd::Interrupted,
        };

        if sleep_or_cancel(ctx.baseline_end(), cancel).await {
            phase.enter(Phase::PromptPhase);
            marks.prompt_start = Some(Instant::now());
            t_prompt_start_ns = Some(ctx.now_ns());

            let phase_deadline = ctx.baseline_end() + ctx.window().prompt_phase;
            summary = dispatcher.run(prompts, phase_deadline, cancel).await;

            let prompt_end = Instant::now();
            marks.prompt_end = Some(prompt_end);
            t_prompt_end_ns = Some(ctx.now_ns());

            if !cancel.is_cancelled() {
                phase.enter(Phase::Tail);
                let tail_end = (prompt_end + ctx.window().tail).min(ctx.deadline());
                sleep_or_cancel(tail_end, cancel).await;
            }
        }

        phase.enter(Phase::Finalizing);
        marks.sampling_end = Instant::now();
        let t_end_ns = ctx.now_ns();
        let sources = sampling.stop(cfg.window.shutdown_grace).await;

        let meta = RunMetadata {
            run_id,
            label: label.to_string(),
            version: VERSION.to_string(),
            mode: RunMode::Run,
            target: target.clone(),
            prompt_set: Some(PromptSetInfo {
                path: prompt_set.path.clone(),
                sha256: prompt_set.sha256.clone(),
                count: prompt_set.len(),
            }),
            start_index,
            caches_dropped,
            n_predict: cfg.server.n_predict,
            configured: Timing::configured(ctx.window()),
            actual: marks.actual(&ctx),
            t0_ns: ctx.started_unix_ns(),
            t_prompt_phase_start_ns: t_prompt_start_ns,
            t_prompt_phase_end_ns: t_prompt_end_ns,
            t_end_ns,
            prompts_configured: summary.configured,
            prompts_dispatched: summary.dispatched,
            prompts_completed: summary.completed,
            prompts_failed: summary.failed,
            prompts_skipped: summary.skipped,
            prompt_phase_end: Some(summary.end),
            interrupted: cancel.is_cancelled(),
            sources,
        };

        finalize(cfg, &dir, &ctx, &target, &meta).await?;
        phase.enter(Phase::Done);

        Ok(RunOutcome { dir, meta })
    }
}

/// Prompts from `start` on. Starting past the end is a setup error.
fn select_prompts(set: &PromptSet, start: usize) -> Result<&[Prompt]> {
    match set.prompts.get(start..) {
        Some(rest) if !rest.is_empty() => Ok(rest),
        _ => bail!(
            "start index {start} is past the last prompt ({} prompts in {})",
            set.len(),
            set.path.display()
        ),
    }
}

/// Directory name of the trial for prompt `index`.
pub fn trial_dir_name(index: usize) -> String {
    format!("p{index:04}")
}

/// Sampling-only window against an explicit PID, written to `out_dir`.
pub async fn collect(
    cfg: &Config,
    fs: HostFs,
    pid: u32,
    duration: Duration,
    out_dir: &Path,
    metrics: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
) -> Result<RunOutcome> {
    if duration.is_zero() {
        bail!("collection duration must be positive");
    }

    let target_cfg = TargetConfig {
        pid,
        container: String::new(),
        worker_names: cfg.target.worker_names.clone(),
    };
    let target = pid::resolve(&fs, &target_cfg, &DockerInspect).context("resolving target process")?;

    let created = !out_dir.exists();
    std::fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    let label = "collect";
    let run_id = run_id(Local::now(), label);
    let window = RunWindow {
        baseline: duration,
        prompt_phase: Duration::ZERO,
        tail: Duration::ZERO,
    };
    let ctx = Arc::new(RunContext::start(run_id.clone(), label, window));
    let progress = metrics.as_ref().map(export::loop_progress);

    let opened = write_collector_meta(out_dir, &ctx, label, &target, cfg, None)
        .and_then(|()| Sampling::start(cfg, &fs, target.pid, out_dir, &ctx, &cancel, progress));
    let sampling = match opened {
        Ok(s) => s,
        Err(e) => {
            if created {
                remove_partial_dir(out_dir);
            }
            return Err(e.context("opening collector outputs"));
        }
    };

    let mut phase = PhaseTracker::new(metrics);
    phase.enter(Phase::Baseline);
    sleep_or_cancel(ctx.deadline(), &cancel).await;

    phase.enter(Phase::Finalizing);
    let marks = PhaseMarks {
        prompt_start: None,
        prompt_end: None,
        sampling_end: Instant::now(),
    };
    let t_end_ns = ctx.now_ns();
    let sources = sampling.stop(cfg.window.shutdown_grace).await;

    let meta = RunMetadata {
        run_id,
        label: label.to_string(),
        version: VERSION.to_string(),
        mode: RunMode::Collect,
        target: target.clone(),
        prompt_set: None,
        start_index: 0,
        caches_dropped: None,
        n_predict: 0,
        configured: Timing::configured(window),
        actual: marks.actual(&ctx),
        t0_ns: ctx.started_unix_ns(),
        t_prompt_phase_start_ns: None,
        t_prompt_phase_end_ns: None,
        t_end_ns,
        prompts_configured: 0,
        prompts_dispatched: 0,
        prompts_completed: 0,
        prompts_failed: 0,
        prompts_skipped: 0,
        prompt_phase_end: None,
        interrupted: cancel.is_cancelled(),
        sources,
    };

    finalize(cfg, out_dir, &ctx, &target, &meta).await?;
    phase.enter(Phase::Done);

    Ok(RunOutcome {
        dir: out_dir.to_path_buf(),
        meta,
    })
}

fn write_collector_meta(
    dir: &Path,
    ctx: &RunContext,
    label: &str,
    target: &ResolvedTarget,
    cfg: &Config,
    t1_ns: Option<u64>,
) -> Result<()> {
    let meta = CollectorMeta {
        run_id: ctx.run_id(),
        label,
        version: VERSION,
        target,
        t0_ns: ctx.started_unix_ns(),
        t1_ns,
        config: cfg,
    };
    write_json_atomic(&dir.join(COLLECTOR_META_FILE), &meta)
}

/// Kernel log, metadata, and the final collector metadata.
async fn finalize(
    cfg: &Config,
    dir: &Path,
    ctx: &RunContext,
    target: &ResolvedTarget,
    meta: &RunMetadata,
) -> Result<()> {
    if cfg.kernel_log.enabled {
        if let Err(e) = kernel_log::capture(&cfg.kernel_log, meta.t0_ns, meta.t_end_ns, dir).await {
            warn!(error = %e, "writing kernel log failed");
        }
    }

    write_json_atomic(&dir.join(META_FILE), meta).context("writing run metadata")?;
    write_collector_meta(dir, ctx, &meta.label, target, cfg, Some(meta.t_end_ns))
        .context("updating collector metadata")?;

    for source in &meta.sources {
        if source.degraded {
            warn!(
                source = %source.name,
                failures = source.failures,
                error = source.error.as_deref().unwrap_or_default(),
                "source degraded during run"
            );
        }
    }

    info!(
        dir = %dir.display(),
        elapsed_s = meta.actual.total_s,
        prompts_completed = meta.prompts_completed,
        prompts_configured = meta.prompts_configured,
        interrupted = meta.interrupted,
        "run finalized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_validate_label() {
        assert!(validate_label("neutral").is_ok());
        assert!(validate_label("high-load_2.v1").is_ok());
        assert!(validate_label("").is_err());
        assert!(validate_label("../escape").is_err());
        assert!(validate_label("a b").is_err());
        assert!(validate_label(".hidden").is_err());
        assert!(validate_label(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_run_id_format() {
        let at = Local
            .with_ymd_and_hms(2025, 3, 9, 14, 5, 7)
            .single()
            .expect("unambiguous time");
        assert_eq!(run_id(at, "neutral"), "2025-03-09T14-05-07_neutral");
    }

    #[test]
    fn test_write_json_atomic_replaces_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meta.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).expect("first write");
        write_json_atomic(&path, &serde_json::json!({"a": 2})).expect("second write");

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        assert_eq!(value["a"], 2);
        assert!(!dir.path().join("meta.json.tmp").exists());
    }

    fn prompt_set(n: usize) -> PromptSet {
        PromptSet {
            path: PathBuf::from("prompts.json"),
            sha256: String::new(),
            prompts: (0..n)
                .map(|i| Prompt {
                    index: i,
                    id: None,
                    title: None,
                    instructions: format!("prompt {i}"),
                })
                .collect(),
        }
    }

    #[test]
    fn test_select_prompts_keeps_set_positions() {
        let set = prompt_set(5);
        let rest = select_prompts(&set, 2).expect("in range");
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0].index, 2);
        assert_eq!(select_prompts(&set, 0).expect("all").len(), 5);

        let err = select_prompts(&set, 5).unwrap_err();
        assert!(err.to_string().contains("start index 5"));
    }

    #[test]
    fn test_trial_dir_name() {
        assert_eq!(trial_dir_name(0), "p0000");
        assert_eq!(trial_dir_name(42), "p0042");
        assert_eq!(trial_dir_name(12345), "p12345");
    }

    #[test]
    fn test_failed_trial_meta() {
        let meta = TrialMeta::failed(3, "neutral", "resolving target process".into());
        let value = serde_json::to_value(&meta).expect("json");
        assert_eq!(value["prompt_index"], 3);
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"], "resolving target process");
        assert!(value["t_request_start_ns"].is_null());
    }

    #[test]
    fn test_create_run_dir_refuses_existing() {
        let root = tempfile::tempdir().expect("tempdir");
        let runs = root.path().join("runs");
        create_run_dir(&runs, "r1").expect("first");
        assert!(create_run_dir(&runs, "r1").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_actual_timing_from_marks() {
        let ctx = RunContext::start(
            "r",
            "l",
            RunWindow {
                baseline: Duration::from_secs(2),
                prompt_phase: Duration::from_secs(10),
                tail: Duration::from_secs(2),
            },
        );
        let t = ctx.started();
        let marks = PhaseMarks {
            prompt_start: Some(t + Duration::from_secs(2)),
            prompt_end: Some(t + Duration::from_secs(6)),
            sampling_end: t + Duration::from_secs(8),
        };
        let actual = marks.actual(&ctx);
        assert_eq!(actual.baseline_s, 2.0);
        assert_eq!(actual.prompt_phase_s, 4.0);
        assert_eq!(actual.tail_s, 2.0);
        assert_eq!(actual.total_s, 8.0);

        let interrupted = PhaseMarks {
            prompt_start: None,
            prompt_end: None,
            sampling_end: t + Duration::from_secs(1),
        };
        let actual = interrupted.actual(&ctx);
        assert_eq!(actual.baseline_s, 1.0);
        assert_eq!(actual.prompt_phase_s, 0.0);
        assert_eq!(actual.total_s, 1.0);
    }
}
