use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use super::delta;
use crate::procfs::{self, CpuTimes, HostFs, PidStat, PAGE_SIZE};
use crate::sample::{Field, Layout, Reading, Source};

/// Per-process columns, in output order.
const PROC_FIELDS: &[&str] = &[
    "proc_utime_jiffies",
    "proc_stime_jiffies",
    "proc_rss_pages",
    "proc_cpu_pct",
    "proc_rss_bytes",
    "proc_threads",
    "proc_minflt",
    "proc_majflt",
    "proc_voluntary_ctxt",
    "proc_nonvoluntary_ctxt",
];

#[derive(Debug, Default, Clone, Copy)]
struct ProcPrev {
    cpu_jiffies: u64,
    minflt: u64,
    majflt: u64,
    voluntary: u64,
    nonvoluntary: u64,
}

/// Process snapshotter writing `process.csv`.
///
/// The target is pinned by PID and its start time; once the process exits or
/// the PID is reused, process columns are `Missing` for the rest of the run
/// while the system columns keep flowing.
pub struct ProcessSnapshotter {
    fs: HostFs,
    pid: u32,
    starttime: u64,
    alive: bool,
    cpu: Option<CpuTimes>,
    prev: ProcPrev,
}

impl ProcessSnapshotter {
    /// Attach to a running process.
    pub fn new(fs: HostFs, pid: u32) -> Result<Self> {
        let stat = read_pid_stat(&fs, pid).with_context(|| format!("attaching to pid {pid}"))?;
        let status = fs.read_proc(&format!("{pid}/status")).unwrap_or_default();

        let prev = ProcPrev {
            cpu_jiffies: stat.utime + stat.stime,
            minflt: stat.minflt,
            majflt: stat.majflt,
            voluntary: procfs::status_u64(&status, "voluntary_ctxt_switches:").unwrap_or(0),
            nonvoluntary: procfs::status_u64(&status, "nonvoluntary_ctxt_switches:").unwrap_or(0),
        };
        let cpu = read_cpu(&fs);

        info!(pid, comm = %stat.comm, "process snapshotter attached");

        Ok(Self {
            fs,
            pid,
            starttime: stat.starttime,
            alive: true,
            cpu,
            prev,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Current stat of the pinned process, or `None` once it is gone.
    fn read_target(&mut self) -> Option<PidStat> {
        if !self.alive {
            return None;
        }

        match read_pid_stat(&self.fs, self.pid) {
            Ok(stat) if stat.starttime == self.starttime => Some(stat),
            Ok(stat) => {
                warn!(
                    pid = self.pid,
                    comm = %stat.comm,
                    "pid reused by another process, process columns now missing"
                );
                self.alive = false;
                None
            }
            Err(e) => {
                warn!(pid = self.pid, error = %e, "target process gone, process columns now missing");
                self.alive = false;
                None
            }
        }
    }
}

impl Source for ProcessSnapshotter {
    fn name(&self) -> &str {
        "process"
    }

    fn file_name(&self) -> &str {
        "process.csv"
    }

    fn layout(&self) -> Layout {
        Layout::Wide
    }

    fn sample(&mut self) -> Result<Vec<Field>> {
        let mut fields = Vec::with_capacity(4 + PROC_FIELDS.len());

        let cpu = read_cpu(&self.fs);
        let cpu_delta = match (cpu, self.cpu) {
            (Some(cur), Some(prev)) => Some(cur.total.saturating_sub(prev.total)),
            _ => None,
        };
        if cpu.is_some() {
            self.cpu = cpu;
        }
        match cpu {
            Some(c) => {
                fields.push(("cpu_total_jiffies".into(), Reading::Value(c.total as f64)));
                fields.push(("cpu_idle_jiffies".into(), Reading::Value(c.idle as f64)));
            }
            None => {
                fields.push(("cpu_total_jiffies".into(), Reading::Missing));
                fields.push(("cpu_idle_jiffies".into(), Reading::Missing));
            }
        }

        fields.push(("pid".into(), Reading::Value(f64::from(self.pid))));

        let target = self.read_target();
        fields.push((
            "process_alive".into(),
            Reading::Value(if target.is_some() { 1.0 } else { 0.0 }),
        ));

        let Some(stat) = target else {
            fields.extend(PROC_FIELDS.iter().map(|n| (n.to_string(), Reading::Missing)));
            if cpu.is_none() {
                bail!("neither /proc/stat nor pid {} readable", self.pid);
            }
            return Ok(fields);
        };

        let status = self.fs.read_proc(&format!("{}/status", self.pid)).ok();
        let status_value = |key: &str| {
            status
                .as_deref()
                .and_then(|s| procfs::status_u64(s, key))
        };

        // Share of total machine CPU time since the last snapshot that could
        // measure it. Both baselines move together or not at all.
        let proc_jiffies = stat.utime + stat.stime;
        let cpu_pct = match cpu_delta {
            Some(machine) if machine > 0 => {
                let proc_delta = proc_jiffies.saturating_sub(self.prev.cpu_jiffies);
                self.prev.cpu_jiffies = proc_jiffies;
                Reading::Value(proc_delta as f64 * 100.0 / machine as f64)
            }
            _ => Reading::Missing,
        };

        let rss_bytes = status
            .as_deref()
            .and_then(|s| procfs::status_kb_bytes(s, "VmRSS:"))
            .unwrap_or(stat.rss_pages.saturating_mul(PAGE_SIZE));

        let voluntary = match status_value("voluntary_ctxt_switches:") {
            Some(v) => delta(&mut self.prev.voluntary, v),
            None => Reading::Missing,
        };
        let nonvoluntary = match status_value("nonvoluntary_ctxt_switches:") {
            Some(v) => delta(&mut self.prev.nonvoluntary, v),
            None => Reading::Missing,
        };

        fields.push(("proc_utime_jiffies".into(), Reading::Value(stat.utime as f64)));
        fields.push(("proc_stime_jiffies".into(), Reading::Value(stat.stime as f64)));
        fields.push(("proc_rss_pages".into(), Reading::Value(stat.rss_pages as f64)));
        fields.push(("proc_cpu_pct".into(), cpu_pct));
        fields.push(("proc_rss_bytes".into(), Reading::Value(rss_bytes as f64)));
        fields.push((
            "proc_threads".into(),
            Reading::from_opt(status_value("Threads:")),
        ));
        fields.push(("proc_minflt".into(), delta(&mut self.prev.minflt, stat.minflt)));
        fields.push(("proc_majflt".into(), delta(&mut self.prev.majflt, stat.majflt)));
        fields.push(("proc_voluntary_ctxt".into(), voluntary));
        fields.push(("proc_nonvoluntary_ctxt".into(), nonvoluntary));

        Ok(fields)
    }
}

fn read_pid_stat(fs: &HostFs, pid: u32) -> Result<PidStat> {
    let text = fs.read_proc(&format!("{pid}/stat"))?;
    Ok(procfs::parse_pid_stat(&text)?)
}

fn read_cpu(fs: &HostFs) -> Option<CpuTimes> {
    let text = fs.read_proc("stat").ok()?;
    procfs::parse_stat(&text).ok().map(|s| s.cpu)
}
