//! Kernel log excerpt covering the run window.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::host::{self, Capture};
use crate::config::KernelLogConfig;

pub const FILE_NAME: &str = "kernel_log.txt";

const JOURNALCTL_TIMEOUT: Duration = Duration::from_secs(10);

/// `journalctl -k` invocation for `[since_ns, until_ns]`, widened to whole
/// seconds.
pub fn command(sudo: bool, since_ns: u64, until_ns: u64) -> Vec<String> {
    let since = since_ns / 1_000_000_000;
    let until = until_ns.div_ceil(1_000_000_000);

    let mut argv = Vec::with_capacity(9);
    if sudo {
        argv.push("sudo".to_string());
        argv.push("-n".to_string());
    }
    argv.extend([
        "journalctl".to_string(),
        "-k".to_string(),
        "--since".to_string(),
        format!("@{since}"),
        "--until".to_string(),
        format!("@{until}"),
        "--no-pager".to_string(),
    ]);
    argv
}

fn render(argv: &[String], capture: &Capture) -> String {
    match capture {
        Capture::Output(text) => text.clone(),
        Capture::Failed { exit, output } => {
            let exit = exit.map_or_else(|| "none".to_string(), |c| c.to_string());
            format!(
                "kernel log unavailable\ncommand: {}\nexit code: {exit}\noutput:\n{}\n",
                argv.join(" "),
                output.trim_end()
            )
        }
    }
}

/// Write the kernel log for the window into `dir`. A failing journalctl is
/// recorded in the file, not returned as an error.
pub async fn capture(cfg: &KernelLogConfig, since_ns: u64, until_ns: u64, dir: &Path) -> Result<()> {
    let argv = command(cfg.sudo, since_ns, until_ns);
    let capture = host::run(&argv, JOURNALCTL_TIMEOUT).await;

    match &capture {
        Capture::Output(text) => info!(lines = text.lines().count(), "captured kernel log"),
        Capture::Failed { exit, output } => {
            warn!(exit = ?exit, output = %output.trim_end(), "kernel log unavailable")
        }
    }

    super::write_atomic(&dir.join(FILE_NAME), render(&argv, &capture).as_bytes())
        .context("writing kernel log")
}
