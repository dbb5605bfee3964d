//! Target process resolution.
//!
//! A run is pinned to one process: the inference worker. The configured PID
//! or container init process is only the root of the search; the worker is
//! usually a descendant (a shell wrapper or supervisor sits in between).

use std::collections::{HashMap, HashSet, VecDeque};
use std::process::Command;

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TargetConfig;
use crate::procfs::{self, HostFs};

/// How the sampled PID was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// A process whose comm is in the configured worker names.
    WorkerName,
    /// No name matched; the descendant with the largest RSS.
    LargestRss,
    /// No descendants; the root itself.
    Root,
}

/// The process a run samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTarget {
    pub root_pid: u32,
    pub pid: u32,
    pub comm: String,
    /// Generations below the root (0 = the root).
    pub depth: u32,
    pub strategy: Strategy,
}

/// Root PID lookup seam; the container lookup shells out to docker.
pub trait RootLookup {
    fn container_pid(&self, container: &str) -> Result<u32>;
}

/// Resolves container init PIDs with `docker inspect`.
pub struct DockerInspect;

impl RootLookup for DockerInspect {
    fn container_pid(&self, container: &str) -> Result<u32> {
        let output = Command::new("docker")
            .args(["inspect", "-f", "{{.State.Pid}}", container])
            .output()
            .context("running docker inspect")?;

        if !output.status.success() {
            bail!(
                "docker inspect {container} failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        parse_container_pid(&String::from_utf8_lossy(&output.stdout))
            .with_context(|| format!("container {container}"))
    }
}

fn parse_container_pid(stdout: &str) -> Result<u32> {
    let raw = stdout.trim();
    let pid: u32 = raw
        .parse()
        .with_context(|| format!("unexpected docker inspect output {raw:?}"))?;
    ensure!(pid > 0, "container is not running");
    Ok(pid)
}

/// Resolve the configured target to the worker process to sample.
pub fn resolve(fs: &HostFs, cfg: &TargetConfig, lookup: &impl RootLookup) -> Result<ResolvedTarget> {
    let root = if cfg.pid > 0 {
        cfg.pid
    } else if !cfg.container.is_empty() {
        lookup.container_pid(&cfg.container)?
    } else {
        bail!("no target configured: set target.pid or target.container");
    };

    ensure!(fs.pid_exists(root), "target pid {root} does not exist");

    let target = resolve_worker(fs, root, &cfg.worker_names)?;
    info!(
        root_pid = target.root_pid,
        pid = target.pid,
        comm = %target.comm,
        depth = target.depth,
        strategy = ?target.strategy,
        "resolved target process"
    );

    Ok(target)
}

#[derive(Debug, Clone)]
struct Candidate {
    pid: u32,
    comm: String,
    depth: u32,
    rss_pages: u64,
}

/// Descend from `root` to the process most likely to be the worker.
pub fn resolve_worker(fs: &HostFs, root: u32, worker_names: &[String]) -> Result<ResolvedTarget> {
    let root_stat = fs
        .read_proc(&format!("{root}/stat"))
        .and_then(|text| Ok(procfs::parse_pid_stat(&text)?))
        .with_context(|| format!("reading target pid {root}"))?;

    let root_candidate = Candidate {
        pid: root,
        comm: root_stat.comm,
        depth: 0,
        rss_pages: root_stat.rss_pages,
    };
    let descendants = descendants(fs, root)?;

    let names: HashSet<&str> = worker_names.iter().map(String::as_str).collect();

    let named = std::iter::once(&root_candidate)
        .chain(descendants.iter())
        .filter(|c| names.contains(c.comm.as_str()))
        .max_by_key(|c| (c.depth, c.rss_pages));

    let (chosen, strategy) = if let Some(c) = named {
        (c, Strategy::WorkerName)
    } else if let Some(c) = descendants.iter().max_by_key(|c| (c.rss_pages, c.depth)) {
        (c, Strategy::LargestRss)
    } else {
        (&root_candidate, Strategy::Root)
    };

    Ok(ResolvedTarget {
        root_pid: root,
        pid: chosen.pid,
        comm: chosen.comm.clone(),
        depth: chosen.depth,
        strategy,
    })
}

/// All processes below `root`, breadth first.
fn descendants(fs: &HostFs, root: u32) -> Result<Vec<Candidate>> {
    let mut children: HashMap<u32, Vec<Candidate>> = HashMap::new();

    for pid in fs.pids()? {
        if pid == root {
            continue;
        }
        // Processes can exit between listing and reading.
        let Ok(text) = fs.read_proc(&format!("{pid}/stat")) else {
            continue;
        };
        let stat = match procfs::parse_pid_stat(&text) {
            Ok(s) => s,
            Err(e) => {
                debug!(pid, error = %e, "skipping unparsable stat");
                continue;
            }
        };
        children.entry(stat.ppid).or_default().push(Candidate {
            pid,
            comm: stat.comm,
            depth: 0,
            rss_pages: stat.rss_pages,
        });
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([(root, 0u32)]);
    while let Some((parent, depth)) = queue.pop_front() {
        let Some(kids) = children.remove(&parent) else {
            continue;
        };
        for mut kid in kids {
            kid.depth = depth + 1;
            queue.push_back((kid.pid, kid.depth));
            found.push(kid);
        }
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procfs::fake::{FakeHost, FakePid};

    struct FixedLookup(Result<u32, &'static str>);

    impl RootLookup for FixedLookup {
        fn container_pid(&self, _container: &str) -> Result<u32> {
            self.0.map_err(|e| anyhow::anyhow!(e))
        }
    }

    fn pid(comm: &'static str, ppid: u32, rss_pages: u64) -> FakePid {
        FakePid {
            comm,
            ppid,
            rss_pages,
            ..FakePid::default()
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// tini(10) -> sh(11) -> llama-server(12) -> llama-server(13), plus an
    /// unrelated heavy process.
    fn container_tree() -> FakeHost {
        let host = FakeHost::new();
        host.add_pid(1, &pid("systemd", 0, 100));
        host.add_pid(10, &pid("tini", 1, 50));
        host.add_pid(11, &pid("sh", 10, 80));
        host.add_pid(12, &pid("llama-server", 11, 4000));
        host.add_pid(13, &pid("llama-server", 12, 9000));
        host.add_pid(50, &pid("postgres", 1, 99_999));
        host
    }

    #[test]
    fn test_deepest_worker_name_wins() {
        let host = container_tree();
        let target = resolve_worker(&host.fs(), 10, &names(&["llama-server"])).expect("resolve");
        assert_eq!(target.pid, 13);
        assert_eq!(target.depth, 3);
        assert_eq!(target.strategy, Strategy::WorkerName);
        assert_eq!(target.root_pid, 10);
    }

    #[test]
    fn test_name_ties_prefer_larger_rss() {
        let host = FakeHost::new();
        host.add_pid(10, &pid("sh", 1, 10));
        host.add_pid(20, &pid("worker", 10, 100));
        host.add_pid(21, &pid("worker", 10, 300));
        let target = resolve_worker(&host.fs(), 10, &names(&["worker"])).expect("resolve");
        assert_eq!(target.pid, 21);
    }

    #[test]
    fn test_largest_rss_descendant_without_names() {
        let host = container_tree();
        let target = resolve_worker(&host.fs(), 10, &[]).expect("resolve");
        assert_eq!(target.pid, 13);
        assert_eq!(target.strategy, Strategy::LargestRss);
        assert_eq!(target.comm, "llama-server");
    }

    #[test]
    fn test_root_without_descendants() {
        let host = container_tree();
        let target = resolve_worker(&host.fs(), 50, &names(&["llama-server"])).expect("resolve");
        assert_eq!(target.pid, 50);
        assert_eq!(target.depth, 0);
        assert_eq!(target.strategy, Strategy::Root);
    }

    #[test]
    fn test_resolve_root_sources() {
        let host = container_tree();

        let cfg = TargetConfig {
            pid: 0,
            container: "llm".into(),
            worker_names: names(&["llama-server"]),
        };
        let target = resolve(&host.fs(), &cfg, &FixedLookup(Ok(10))).expect("resolve");
        assert_eq!(target.pid, 13);

        let err = resolve(&host.fs(), &cfg, &FixedLookup(Err("no such container")))
            .expect_err("lookup failure");
        assert!(err.to_string().contains("no such container"));

        let missing = TargetConfig {
            pid: 4242,
            ..cfg.clone()
        };
        let err = resolve(&host.fs(), &missing, &FixedLookup(Ok(10))).expect_err("missing pid");
        assert!(err.to_string().contains("4242"));

        let none = TargetConfig::default();
        assert!(resolve(&host.fs(), &none, &FixedLookup(Ok(10))).is_err());
    }

    #[test]
    fn test_parse_container_pid() {
        assert_eq!(parse_container_pid("4321\n").expect("pid"), 4321);
        assert!(parse_container_pid("0\n").is_err());
        assert!(parse_container_pid("<no value>").is_err());
    }
}
