use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use substrate::config::Config;
use substrate::dispatch::HttpClient;
use substrate::export::{self, HealthMetrics};
use substrate::procfs::HostFs;
use substrate::runner::{self, Runner};

/// Fixed-window hardware/OS sampler for local LLM inference runs.
#[derive(Parser)]
#[command(name = "substrate", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error). Overrides
    /// the config file.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run baseline, prompt phase and tail against the inference server.
    Run(RunArgs),
    /// Run one full window per prompt, each in its own directory.
    Trials(RunArgs),
    /// Sample a process for a fixed duration without sending prompts.
    Collect(CollectArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Args)]
struct RunArgs {
    /// JSON prompt set.
    #[arg(long)]
    prompts: PathBuf,

    /// Condition label, part of the run directory name.
    #[arg(long)]
    label: String,

    /// Container whose init process is the target root.
    #[arg(long)]
    container: Option<String>,

    /// Host PID of the target root.
    #[arg(long)]
    pid: Option<u32>,

    /// Directory that receives run directories.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Index of the first prompt to dispatch.
    #[arg(long, default_value_t = 0)]
    start_index: usize,
}

#[derive(Args)]
struct CollectArgs {
    #[arg(long)]
    pid: u32,

    /// How long to sample (e.g. "30s", "2m").
    #[arg(long, value_parser = parse_duration)]
    duration: Duration,

    #[arg(long)]
    out_dir: PathBuf,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("substrate {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    let level = cli.log_level.clone().unwrap_or_else(|| cfg.log_level.clone());
    let filter =
        EnvFilter::try_new(&level).with_context(|| format!("invalid log level: {level}"))?;
    fmt().with_env_filter(filter).with_target(true).init();

    if let Command::Run(args) | Command::Trials(args) = &cli.command {
        apply_overrides(&mut cfg, args);
        cfg.validate().context("validating configuration")?;
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting substrate",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async move { execute(cli.command, cfg).await })
}

fn apply_overrides(cfg: &mut Config, args: &RunArgs) {
    if let Some(container) = &args.container {
        cfg.target.container = container.clone();
    }
    if let Some(pid) = args.pid {
        cfg.target.pid = pid;
    }
    if let Some(dir) = &args.output_dir {
        cfg.output_dir = dir.clone();
    }
}

async fn execute(command: Command, cfg: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let metrics = if cfg.health.addr.is_empty() {
        None
    } else {
        let m = Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating progress metrics")?);
        m.start().await.context("starting progress metrics server")?;
        Some(m)
    };

    let result = match command {
        Command::Run(args) => {
            let runner = build_runner(cfg, &args, metrics.as_ref())?;
            runner.run(&args.prompts, &args.label, cancel).await.map(|outcome| {
                tracing::info!(
                    dir = %outcome.dir.display(),
                    interrupted = outcome.meta.interrupted,
                    "substrate finished"
                );
            })
        }
        Command::Trials(args) => {
            let runner = build_runner(cfg, &args, metrics.as_ref())?;
            runner.trials(&args.prompts, &args.label, cancel).await.map(|outcome| {
                tracing::info!(
                    root = %outcome.root.display(),
                    trials = outcome.trials.len(),
                    ok = outcome.trials.iter().filter(|t| t.ok).count(),
                    interrupted = outcome.interrupted,
                    "substrate finished"
                );
            })
        }
        Command::Collect(args) => runner::collect(
            &cfg,
            HostFs::default(),
            args.pid,
            args.duration,
            &args.out_dir,
            metrics.clone(),
            cancel,
        )
        .await
        .map(|outcome| {
            tracing::info!(
                dir = %outcome.dir.display(),
                interrupted = outcome.meta.interrupted,
                "substrate finished"
            );
        }),
        Command::Version => return Ok(()),
    };

    if let Some(m) = &metrics {
        m.stop();
    }

    result
}

fn build_runner(
    cfg: Config,
    args: &RunArgs,
    metrics: Option<&Arc<HealthMetrics>>,
) -> Result<Runner<HttpClient>> {
    let mut client = HttpClient::new(&cfg.server).context("creating inference client")?;
    if let Some(m) = metrics {
        client = client.with_metrics(export::request_durations(m));
    }

    let mut runner = Runner::new(cfg, client).with_start_index(args.start_index);
    if let Some(m) = metrics {
        runner = runner.with_metrics(Arc::clone(m));
    }
    Ok(runner)
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, finalizing run");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, finalizing run");
            }
        }

        cancel.cancel();
    });
}
