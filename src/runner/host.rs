//! Host commands run around a window: the pre-run cache drop and the
//! shared runner used by the kernel log.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::config::PrepareConfig;

const DROP_CACHES_TIMEOUT: Duration = Duration::from_secs(60);

/// What a host command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Capture {
    Output(String),
    Failed {
        exit: Option<i32>,
        output: String,
    },
}

/// Run `argv` to completion, killing it after `timeout`.
pub(crate) async fn run(argv: &[String], timeout: Duration) -> Capture {
    let Some((program, args)) = argv.split_first() else {
        return Capture::Failed {
            exit: None,
            output: "empty command".to_string(),
        };
    };

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Err(_) => Capture::Failed {
            exit: None,
            output: format!("timed out after {timeout:?}"),
        },
        Ok(Err(e)) => Capture::Failed {
            exit: None,
            output: e.to_string(),
        },
        Ok(Ok(out)) if out.status.success() => {
            Capture::Output(String::from_utf8_lossy(&out.stdout).into_owned())
        }
        Ok(Ok(out)) => {
            let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
            output.push_str(&String::from_utf8_lossy(&out.stderr));
            Capture::Failed {
                exit: out.status.code(),
                output,
            }
        }
    }
}

/// `sync` followed by writing 3 to `/proc/sys/vm/drop_caches`.
pub fn drop_caches_command(sudo: bool) -> Vec<String> {
    let mut argv = Vec::with_capacity(5);
    if sudo {
        argv.push("sudo".to_string());
        argv.push("-n".to_string());
    }
    argv.extend([
        "sh".to_string(),
        "-c".to_string(),
        "sync && echo 3 > /proc/sys/vm/drop_caches".to_string(),
    ]);
    argv
}

/// Drop the page cache if configured. Returns `None` when disabled and
/// whether the drop succeeded otherwise; a failure is only logged.
pub async fn prepare(cfg: &PrepareConfig) -> Option<bool> {
    if !cfg.drop_caches {
        return None;
    }

    let argv = drop_caches_command(cfg.sudo);
    match run(&argv, DROP_CACHES_TIMEOUT).await {
        Capture::Output(_) => {
            info!("dropped page cache");
            Some(true)
        }
        Capture::Failed { exit, output } => {
            warn!(
                command = %argv.join(" "),
                exit = ?exit,
                output = %output.trim_end(),
                "dropping page cache failed, continuing"
            );
            Some(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_caches_command() {
        assert_eq!(
            drop_caches_command(true).join(" "),
            "sudo -n sh -c sync && echo 3 > /proc/sys/vm/drop_caches"
        );
        assert_eq!(drop_caches_command(false)[0], "sh");
    }

    #[tokio::test]
    async fn test_prepare_disabled_runs_nothing() {
        let cfg = PrepareConfig {
            drop_caches: false,
            sudo: true,
        };
        assert_eq!(prepare(&cfg).await, None);
    }

    #[tokio::test]
    async fn test_run_reports_exit_and_output() {
        let argv: Vec<String> = ["sh", "-c", "echo nope >&2; exit 3"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        match run(&argv, Duration::from_secs(5)).await {
            Capture::Failed { exit, output } => {
                assert_eq!(exit, Some(3));
                assert_eq!(output.trim_end(), "nope");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let argv: Vec<String> = ["sleep", "5"].iter().map(|s| s.to_string()).collect();
        let capture = run(&argv, Duration::from_millis(100)).await;
        assert!(matches!(
            capture,
            Capture::Failed { exit: None, ref output } if output.contains("timed out")
        ));
    }
}
