use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::clock::RunWindow;
use crate::counter::{perf, DEFAULT_COUNTERS};

/// Top-level configuration for a substrate run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory that receives one sub-directory per run. Default: "runs".
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Inference server connection configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Process under observation.
    #[serde(default)]
    pub target: TargetConfig,

    /// Fixed run window.
    #[serde(default)]
    pub window: WindowConfig,

    /// Data sources and their cadences.
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Host preparation before the run clock starts.
    #[serde(default)]
    pub prepare: PrepareConfig,

    /// Kernel log excerpt written at finalization.
    #[serde(default)]
    pub kernel_log: KernelLogConfig,

    /// Prometheus progress endpoint configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Inference server connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Base URL (e.g., "http://localhost:8000").
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Completion endpoint path. Default: "/completion".
    #[serde(default = "default_completion_path")]
    pub completion_path: String,

    /// Readiness endpoint path. Default: "/health".
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Tokens to generate per prompt. Default: 50.
    #[serde(default = "default_n_predict")]
    pub n_predict: u32,

    /// Keep generating past end-of-sequence so every request does the same work.
    #[serde(default = "default_true")]
    pub ignore_eos: bool,

    /// Raw `logit_bias` passed through to the server.
    #[serde(default)]
    pub logit_bias: Vec<serde_json::Value>,

    /// Upper bound for a single completion request. Default: 25s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// How long to wait for the server to become ready. Default: 30s.
    #[serde(default = "default_ready_timeout", with = "humantime_serde")]
    pub ready_timeout: Duration,

    /// Delay between readiness polls. Default: 500ms.
    #[serde(default = "default_ready_poll_interval", with = "humantime_serde")]
    pub ready_poll_interval: Duration,
}

/// Process under observation.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TargetConfig {
    /// Host PID of the server process (or its container's init process).
    #[serde(default)]
    pub pid: u32,

    /// Docker container whose init PID is the resolution root.
    #[serde(default)]
    pub container: String,

    /// Process names that identify the inference worker below the root.
    #[serde(default)]
    pub worker_names: Vec<String>,
}

/// Fixed run window.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WindowConfig {
    /// Sampling-only phase before the first prompt. Default: 3s.
    #[serde(default = "default_baseline", with = "humantime_serde")]
    pub baseline: Duration,

    /// Maximum time for dispatching prompts. Default: 60s.
    #[serde(default = "default_prompt_phase", with = "humantime_serde")]
    pub prompt_phase: Duration,

    /// Sampling-only phase after the prompt phase. Default: 3s.
    #[serde(default = "default_tail", with = "humantime_serde")]
    pub tail: Duration,

    /// No new prompt is sent with less prompt-phase time left. Default: 1s.
    #[serde(default = "default_min_request_budget", with = "humantime_serde")]
    pub min_request_budget: Duration,

    /// Time allowed for loops to stop at finalization. Default: 2s.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

/// Data sources and their cadences.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SamplingConfig {
    /// How often buffered rows are flushed to disk. Default: 1s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Consecutive failed reads before a source is marked degraded. Default: 3.
    #[serde(default = "default_degrade_after")]
    pub degrade_after: u32,

    /// procfs event counters (`counters.csv`).
    #[serde(default)]
    pub counters: CountersConfig,

    /// System snapshot (`system.csv`).
    #[serde(default)]
    pub system: SourceConfig,

    /// Target process snapshot (`process.csv`).
    #[serde(default)]
    pub process: SourceConfig,

    /// `perf stat` interval counters (`perf_stat.csv`).
    #[serde(default)]
    pub perf: PerfConfig,
}

/// procfs counter source configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CountersConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Default: 1ms.
    #[serde(default = "default_counter_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Counter names. Empty means the built-in set.
    #[serde(default)]
    pub events: Vec<String>,
}

/// Generic periodic source configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Default: 200ms.
    #[serde(default = "default_snapshot_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// `perf stat` source configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PerfConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Bucket width passed to `perf stat -I`. Default: 1ms.
    #[serde(default = "default_counter_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Event list. Empty means the built-in tracepoint and power set.
    #[serde(default)]
    pub events: Vec<String>,

    /// Run perf through `sudo -n`. Default: true.
    #[serde(default = "default_true")]
    pub sudo: bool,

    /// perf executable. Default: "perf".
    #[serde(default = "default_perf_binary")]
    pub binary: String,

    /// CPU list perf is pinned to with `taskset -c` (e.g., "12-13").
    /// Empty leaves perf unpinned.
    #[serde(default)]
    pub cpus: String,
}

/// Host preparation before the run clock starts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrepareConfig {
    /// Sync and drop the page cache before each run. Default: false.
    #[serde(default)]
    pub drop_caches: bool,

    /// Drop caches through `sudo -n`. Default: true.
    #[serde(default = "default_true")]
    pub sudo: bool,
}

/// Kernel log excerpt configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KernelLogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Run journalctl through `sudo -n`. Default: true.
    #[serde(default = "default_true")]
    pub sudo: bool,
}

/// Prometheus progress endpoint configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HealthConfig {
    /// Listen address (e.g., "127.0.0.1:9090"). Empty disables the endpoint.
    #[serde(default)]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_endpoint() -> String {
    "http://localhost:8000".to_string()
}

fn default_completion_path() -> String {
    "/completion".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_n_predict() -> u32 {
    50
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(25)
}

fn default_ready_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_ready_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_baseline() -> Duration {
    Duration::from_secs(3)
}

fn default_prompt_phase() -> Duration {
    Duration::from_secs(60)
}

fn default_tail() -> Duration {
    Duration::from_secs(3)
}

fn default_min_request_budget() -> Duration {
    Duration::from_secs(1)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_degrade_after() -> u32 {
    3
}

fn default_counter_interval() -> Duration {
    Duration::from_millis(1)
}

fn default_snapshot_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_perf_binary() -> String {
    "perf".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            output_dir: default_output_dir(),
            server: ServerConfig::default(),
            target: TargetConfig::default(),
            window: WindowConfig::default(),
            sampling: SamplingConfig::default(),
            prepare: PrepareConfig::default(),
            kernel_log: KernelLogConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            completion_path: default_completion_path(),
            health_path: default_health_path(),
            n_predict: default_n_predict(),
            ignore_eos: true,
            logit_bias: Vec::new(),
            request_timeout: default_request_timeout(),
            ready_timeout: default_ready_timeout(),
            ready_poll_interval: default_ready_poll_interval(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            baseline: default_baseline(),
            prompt_phase: default_prompt_phase(),
            tail: default_tail(),
            min_request_budget: default_min_request_budget(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
            degrade_after: default_degrade_after(),
            counters: CountersConfig::default(),
            system: SourceConfig::default(),
            process: SourceConfig::default(),
            perf: PerfConfig::default(),
        }
    }
}

impl Default for CountersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_counter_interval(),
            events: Vec::new(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_snapshot_interval(),
        }
    }
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_counter_interval(),
            events: Vec::new(),
            sudo: true,
            binary: default_perf_binary(),
            cpus: String::new(),
        }
    }
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self {
            drop_caches: false,
            sudo: true,
        }
    }
}

impl Default for KernelLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sudo: true,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate settings shared by every command.
    pub fn validate(&self) -> Result<()> {
        if self.server.endpoint.is_empty() {
            bail!("server.endpoint is required");
        }

        if !self.server.completion_path.starts_with('/') {
            bail!("server.completion_path must start with '/'");
        }

        if !self.server.health_path.starts_with('/') {
            bail!("server.health_path must start with '/'");
        }

        if self.server.n_predict == 0 {
            bail!("server.n_predict must be positive");
        }

        if self.server.request_timeout.is_zero() {
            bail!("server.request_timeout must be positive");
        }

        if self.server.ready_poll_interval.is_zero() {
            bail!("server.ready_poll_interval must be positive");
        }

        if self.window.prompt_phase.is_zero() {
            bail!("window.prompt_phase must be positive");
        }

        if self.window.shutdown_grace.is_zero() {
            bail!("window.shutdown_grace must be positive");
        }

        if self.sampling.degrade_after == 0 {
            bail!("sampling.degrade_after must be at least 1");
        }

        if self.sampling.flush_interval.is_zero() {
            bail!("sampling.flush_interval must be positive");
        }

        let s = &self.sampling;
        if !(s.counters.enabled || s.system.enabled || s.process.enabled || s.perf.enabled) {
            bail!("at least one sampling source must be enabled");
        }

        for (name, enabled, interval) in [
            ("counters", s.counters.enabled, s.counters.interval),
            ("system", s.system.enabled, s.system.interval),
            ("process", s.process.enabled, s.process.interval),
            ("perf", s.perf.enabled, s.perf.interval),
        ] {
            if enabled && interval.is_zero() {
                bail!("sampling.{name}.interval must be positive");
            }
        }

        if s.perf.enabled && s.perf.binary.is_empty() {
            bail!("sampling.perf.binary is required when perf is enabled");
        }

        if !s.perf.cpus.is_empty() && !is_cpu_list(&s.perf.cpus) {
            bail!(
                "sampling.perf.cpus must be a cpu list like \"0-3,8\", got {:?}",
                s.perf.cpus
            );
        }

        Ok(())
    }

    /// Validate that a target process is configured, as `run` requires.
    pub fn validate_target(&self) -> Result<()> {
        if self.target.pid == 0 && self.target.container.is_empty() {
            bail!("either target.pid or target.container is required");
        }

        Ok(())
    }

    pub fn run_window(&self) -> RunWindow {
        RunWindow {
            baseline: self.window.baseline,
            prompt_phase: self.window.prompt_phase,
            tail: self.window.tail,
        }
    }
}

impl CountersConfig {
    /// Configured counter names, or the built-in set.
    pub fn event_names(&self) -> Vec<String> {
        if self.events.is_empty() {
            DEFAULT_COUNTERS.iter().map(|s| (*s).to_string()).collect()
        } else {
            self.events.clone()
        }
    }
}

impl PerfConfig {
    /// Configured perf events, or the built-in set.
    pub fn event_names(&self) -> Vec<String> {
        if self.events.is_empty() {
            perf::DEFAULT_EVENTS.iter().map(|s| (*s).to_string()).collect()
        } else {
            self.events.clone()
        }
    }

    pub fn plan(&self) -> perf::PerfPlan {
        perf::PerfPlan {
            binary: self.binary.clone(),
            sudo: self.sudo,
            interval: self.interval,
            events: self.event_names(),
            cpus: (!self.cpus.is_empty()).then(|| self.cpus.clone()),
        }
    }
}

/// Whether `list` is a `taskset -c` style list: comma-separated cpus or
/// `lo-hi` ranges.
fn is_cpu_list(list: &str) -> bool {
    list.split(',').all(|part| {
        let mut bounds = part.splitn(2, '-');
        let lo = bounds.next().and_then(|v| v.parse::<u32>().ok());
        match (lo, bounds.next()) {
            (Some(_), None) => true,
            (Some(lo), Some(hi)) => hi.parse::<u32>().is_ok_and(|hi| hi >= lo),
            (None, _) => false,
        }
    })
}
