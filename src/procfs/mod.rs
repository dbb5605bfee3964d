//! Host filesystem access and parsers for the procfs/sysfs files sampled
//! during a run.
//!
//! Reads go through [`HostFs`] so tests can point the samplers at a fake
//! `/proc` and `/sys` tree. Parsers are pure functions over file contents.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;

#[cfg(test)]
pub(crate) mod fake;

/// Kernel ticks per second for jiffy-based fields exported through /proc.
pub const USER_HZ: u64 = 100;

/// Page size assumed when converting `rss` pages to bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Errors produced while decoding procfs text.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("{file}: missing field {field}")]
    MissingField {
        file: &'static str,
        field: &'static str,
    },

    #[error("{file}: invalid number {raw:?}")]
    InvalidNumber { file: &'static str, raw: String },

    #[error("{file}: unexpected format")]
    Format { file: &'static str },
}

/// Roots of the proc and sys pseudo-filesystems.
#[derive(Debug, Clone)]
pub struct HostFs {
    proc_root: PathBuf,
    sys_root: PathBuf,
}

impl Default for HostFs {
    fn default() -> Self {
        Self::new("/proc", "/sys")
    }
}

impl HostFs {
    /// Create a host view rooted at the given directories.
    pub fn new(proc_root: impl Into<PathBuf>, sys_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            sys_root: sys_root.into(),
        }
    }

    pub fn proc_path(&self, rel: &str) -> PathBuf {
        self.proc_root.join(rel)
    }

    pub fn sys_path(&self, rel: &str) -> PathBuf {
        self.sys_root.join(rel)
    }

    /// Read a file below the proc root.
    pub fn read_proc(&self, rel: &str) -> Result<String> {
        read_file(&self.proc_path(rel))
    }

    /// Read a file below the sys root.
    pub fn read_sys(&self, rel: &str) -> Result<String> {
        read_file(&self.sys_path(rel))
    }

    /// Whether `/proc/<pid>` exists.
    pub fn pid_exists(&self, pid: u32) -> bool {
        self.proc_root.join(pid.to_string()).is_dir()
    }

    /// List numeric entries of the proc root.
    pub fn pids(&self) -> Result<Vec<u32>> {
        let entries = fs::read_dir(&self.proc_root)
            .with_context(|| format!("reading {}", self.proc_root.display()))?;

        let mut pids = Vec::with_capacity(256);
        for entry in entries.flatten() {
            if let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() {
                pids.push(pid);
            }
        }
        pids.sort_unstable();

        Ok(pids)
    }

    /// Whole block devices listed under /sys/block, excluding loop and ram devices.
    pub fn block_devices(&self) -> HashSet<String> {
        let Ok(entries) = fs::read_dir(self.sys_path("block")) else {
            return HashSet::new();
        };

        entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| !should_skip_block_device(name))
            .collect()
    }

    /// Logical CPU ids that expose `cpufreq/scaling_cur_freq`.
    pub fn cpufreq_cpus(&self) -> Vec<u32> {
        let Ok(entries) = fs::read_dir(self.sys_path("devices/system/cpu")) else {
            return Vec::new();
        };

        let mut cpus: Vec<u32> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                let id = name.to_string_lossy().strip_prefix("cpu")?.parse::<u32>().ok()?;
                entry
                    .path()
                    .join("cpufreq/scaling_cur_freq")
                    .exists()
                    .then_some(id)
            })
            .collect();
        cpus.sort_unstable();
        cpus
    }

    /// Current frequency of one CPU in kHz.
    pub fn cpu_freq_khz(&self, cpu: u32) -> Option<u64> {
        let text = self
            .read_sys(&format!("devices/system/cpu/cpu{cpu}/cpufreq/scaling_cur_freq"))
            .ok()?;
        text.trim().parse::<u64>().ok()
    }
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn should_skip_block_device(name: &str) -> bool {
    name.starts_with("loop") || name.starts_with("ram")
}

/// Aggregate CPU jiffies from the first `cpu` line of /proc/stat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub total: u64,
    pub idle: u64,
}

impl CpuTimes {
    /// Busy percentage between two readings, or `None` if no time passed.
    pub fn util_pct_since(&self, prev: &CpuTimes) -> Option<f64> {
        let total = self.total.checked_sub(prev.total)?;
        let idle = self.idle.saturating_sub(prev.idle);
        if total == 0 {
            return None;
        }
        Some((total.saturating_sub(idle)) as f64 * 100.0 / total as f64)
    }
}

/// Selected fields of /proc/stat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStat {
    pub cpu: CpuTimes,
    pub ctxt: Option<u64>,
    pub intr: Option<u64>,
    pub softirq: Option<u64>,
    pub processes: Option<u64>,
}

/// Parse /proc/stat. The aggregate `cpu` line is required.
pub fn parse_stat(text: &str) -> Result<KernelStat, ParseError> {
    const FILE: &str = "/proc/stat";

    let mut stat = KernelStat::default();
    let mut saw_cpu = false;

    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let Some(key) = parts.next() else {
            continue;
        };

        match key {
            "cpu" => {
                let values = parts
                    .map(|v| parse_u64(FILE, v))
                    .collect::<Result<Vec<u64>, _>>()?;
                if values.len() < 4 {
                    return Err(ParseError::Format { file: FILE });
                }
                stat.cpu.total = values.iter().sum();
                // idle + iowait
                stat.cpu.idle = values[3] + values.get(4).copied().unwrap_or(0);
                saw_cpu = true;
            }
            "ctxt" => stat.ctxt = parts.next().map(|v| parse_u64(FILE, v)).transpose()?,
            "intr" => stat.intr = parts.next().map(|v| parse_u64(FILE, v)).transpose()?,
            "softirq" => stat.softirq = parts.next().map(|v| parse_u64(FILE, v)).transpose()?,
            "processes" => {
                stat.processes = parts.next().map(|v| parse_u64(FILE, v)).transpose()?;
            }
            _ => {}
        }
    }

    if !saw_cpu {
        return Err(ParseError::MissingField {
            file: FILE,
            field: "cpu",
        });
    }

    Ok(stat)
}

/// Look up one `key value` line of /proc/vmstat.
pub fn vmstat_value(text: &str, key: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let (k, v) = line.split_once(' ')?;
        (k == key).then(|| v.trim().parse::<u64>().ok()).flatten()
    })
}

/// Parse a per-CPU counter table (/proc/interrupts, /proc/softirqs) into
/// `(row name, sum across CPUs)` pairs in file order.
///
/// Rows with fewer numeric columns than CPUs (ERR, MIS) are summed over the
/// columns present; the trailing description text is ignored.
pub fn parse_per_cpu_table(text: &str) -> Vec<(String, u64)> {
    let mut lines = text.lines();
    let cpus = lines
        .next()
        .map(|header| {
            header
                .split_whitespace()
                .filter(|c| c.starts_with("CPU"))
                .count()
        })
        .unwrap_or(0);

    let mut rows = Vec::with_capacity(64);
    for line in lines {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }

        let mut sum = 0u64;
        for (i, token) in rest.split_whitespace().enumerate() {
            if cpus > 0 && i >= cpus {
                break;
            }
            match token.parse::<u64>() {
                Ok(v) => sum = sum.saturating_add(v),
                Err(_) => break,
            }
        }
        rows.push((name.to_string(), sum));
    }

    rows
}

/// One `some`/`full` line of a PSI file.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PsiLine {
    pub avg10: f64,
    pub avg60: f64,
    pub avg300: f64,
    pub total: u64,
}

/// Contents of /proc/pressure/<resource>.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pressure {
    pub some: Option<PsiLine>,
    pub full: Option<PsiLine>,
}

/// Parse a PSI file (`some avg10=0.00 avg60=0.00 avg300=0.00 total=0`).
pub fn parse_pressure(text: &str) -> Pressure {
    let mut pressure = Pressure::default();

    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let kind = parts.next();
        let mut psi = PsiLine::default();
        for kv in parts {
            let Some((k, v)) = kv.split_once('=') else {
                continue;
            };
            match k {
                "avg10" => psi.avg10 = v.parse().unwrap_or(0.0),
                "avg60" => psi.avg60 = v.parse().unwrap_or(0.0),
                "avg300" => psi.avg300 = v.parse().unwrap_or(0.0),
                "total" => psi.total = v.parse().unwrap_or(0),
                _ => {}
            }
        }
        match kind {
            Some("some") => pressure.some = Some(psi),
            Some("full") => pressure.full = Some(psi),
            _ => {}
        }
    }

    pressure
}

/// Byte/packet totals across non-loopback interfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetTotals {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

/// Parse /proc/net/dev.
pub fn parse_net_dev(text: &str) -> NetTotals {
    let mut totals = NetTotals::default();

    for line in text.lines().skip(2) {
        let Some((iface, rest)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<u64> = rest
            .split_whitespace()
            .map(|v| v.parse::<u64>().unwrap_or(0))
            .collect();
        if fields.len() < 10 {
            continue;
        }
        totals.rx_bytes = totals.rx_bytes.saturating_add(fields[0]);
        totals.rx_packets = totals.rx_packets.saturating_add(fields[1]);
        totals.tx_bytes = totals.tx_bytes.saturating_add(fields[8]);
        totals.tx_packets = totals.tx_packets.saturating_add(fields[9]);
    }

    totals
}

/// I/O totals across whole block devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskTotals {
    pub reads_completed: u64,
    pub read_sectors: u64,
    pub writes_completed: u64,
    pub write_sectors: u64,
}

/// Parse /proc/diskstats, counting only devices in `devices` so partitions
/// are not double counted.
pub fn parse_diskstats(text: &str, devices: &HashSet<String>) -> DiskTotals {
    let mut totals = DiskTotals::default();

    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || !devices.contains(fields[2]) {
            continue;
        }
        let num = |i: usize| fields[i].parse::<u64>().unwrap_or(0);
        totals.reads_completed = totals.reads_completed.saturating_add(num(3));
        totals.read_sectors = totals.read_sectors.saturating_add(num(5));
        totals.writes_completed = totals.writes_completed.saturating_add(num(7));
        totals.write_sectors = totals.write_sectors.saturating_add(num(9));
    }

    totals
}

/// Selected fields of /proc/<pid>/stat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidStat {
    pub comm: String,
    pub ppid: u32,
    pub minflt: u64,
    pub majflt: u64,
    pub utime: u64,
    pub stime: u64,
    pub starttime: u64,
    pub rss_pages: u64,
}

/// Parse /proc/<pid>/stat. The comm field may contain spaces and
/// parentheses, so fields are split after the last `)`.
pub fn parse_pid_stat(text: &str) -> Result<PidStat, ParseError> {
    const FILE: &str = "/proc/<pid>/stat";

    let lparen = text.find('(').ok_or(ParseError::Format { file: FILE })?;
    let rparen = text.rfind(')').ok_or(ParseError::Format { file: FILE })?;
    if rparen < lparen {
        return Err(ParseError::Format { file: FILE });
    }
    let comm = text[lparen + 1..rparen].to_string();
    let fields: Vec<&str> = text[rparen + 1..].split_whitespace().collect();

    // Index 0 is field 3 (state) in proc(5) numbering.
    let field = |idx: usize, name: &'static str| -> Result<u64, ParseError> {
        let raw = fields.get(idx).ok_or(ParseError::MissingField {
            file: FILE,
            field: name,
        })?;
        parse_u64(FILE, raw)
    };

    Ok(PidStat {
        comm,
        ppid: u32::try_from(field(1, "ppid")?).map_err(|_| ParseError::Format { file: FILE })?,
        minflt: field(7, "minflt")?,
        majflt: field(9, "majflt")?,
        utime: field(11, "utime")?,
        stime: field(12, "stime")?,
        starttime: field(19, "starttime")?,
        rss_pages: field(21, "rss")?,
    })
}

/// Look up a numeric `Key:  value` line of /proc/<pid>/status.
pub fn status_u64(status: &str, key: &str) -> Option<u64> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix(key) {
            let mut parts = rest.split_whitespace();
            return parts.next()?.parse::<u64>().ok();
        }
    }
    None
}

/// Look up a `Key: N kB` line and convert to bytes.
pub fn status_kb_bytes(status: &str, key: &str) -> Option<u64> {
    status_u64(status, key).map(|v| v.saturating_mul(1024))
}

fn parse_u64(file: &'static str, raw: &str) -> Result<u64, ParseError> {
    raw.parse::<u64>().map_err(|_| ParseError::InvalidNumber {
        file,
        raw: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "cpu  100 5 50 800 20 3 2 0 0 0
cpu0 50 2 25 400 10 1 1 0 0 0
intr 123456 10 0 0
ctxt 987654
btime 1700000000
processes 4321
procs_running 2
softirq 55555 1 2 3
";

    #[test]
    fn test_parse_stat() {
        let stat = parse_stat(STAT).expect("valid stat");
        assert_eq!(stat.cpu.total, 980);
        assert_eq!(stat.cpu.idle, 820);
        assert_eq!(stat.ctxt, Some(987_654));
        assert_eq!(stat.intr, Some(123_456));
        assert_eq!(stat.softirq, Some(55_555));
        assert_eq!(stat.processes, Some(4321));
    }

    #[test]
    fn test_parse_stat_requires_cpu_line() {
        let err = parse_stat("ctxt 1\n").unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingField {
                file: "/proc/stat",
                field: "cpu"
            }
        );
    }

    #[test]
    fn test_parse_stat_rejects_garbage() {
        assert!(parse_stat("cpu a b c d\n").is_err());
        assert!(parse_stat("cpu 1 2\n").is_err());
    }

    #[test]
    fn test_cpu_util_pct_since() {
        let prev = CpuTimes {
            total: 1000,
            idle: 800,
        };
        let cur = CpuTimes {
            total: 1100,
            idle: 850,
        };
        let pct = cur.util_pct_since(&prev).expect("time passed");
        assert!((pct - 50.0).abs() < 1e-9);
        assert_eq!(prev.util_pct_since(&prev), None);
    }

    #[test]
    fn test_vmstat_value() {
        let text = "nr_free_pages 100\npgfault 5000\npgmajfault 7\n";
        assert_eq!(vmstat_value(text, "pgfault"), Some(5000));
        assert_eq!(vmstat_value(text, "pgmajfault"), Some(7));
        assert_eq!(vmstat_value(text, "pswpin"), None);
    }

    #[test]
    fn test_parse_interrupts_table() {
        let text = "           CPU0       CPU1
  0:         10          5   IO-APIC    2-edge      timer
 24:        100        200   PCI-MSI 512000-edge      nvme0q0
NMI:          1          2   Non-maskable interrupts
LOC:       1000       2000   Local timer interrupts
TLB:          3          4   TLB shootdowns
ERR:          9
";
        let rows = parse_per_cpu_table(text);
        assert_eq!(
            rows,
            vec![
                ("0".to_string(), 15),
                ("24".to_string(), 300),
                ("NMI".to_string(), 3),
                ("LOC".to_string(), 3000),
                ("TLB".to_string(), 7),
                ("ERR".to_string(), 9),
            ]
        );
    }

    #[test]
    fn test_parse_softirqs_table() {
        let text = "                    CPU0       CPU1
          HI:          1          0
       TIMER:        500        600
      NET_RX:         10         20
";
        let rows = parse_per_cpu_table(text);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], ("TIMER".to_string(), 1100));
    }

    #[test]
    fn test_parse_pressure() {
        let text = "some avg10=1.50 avg60=0.75 avg300=0.10 total=123456
full avg10=0.00 avg60=0.00 avg300=0.00 total=42
";
        let p = parse_pressure(text);
        let some = p.some.expect("some line");
        assert!((some.avg10 - 1.5).abs() < 1e-9);
        assert_eq!(some.total, 123_456);
        assert_eq!(p.full.expect("full line").total, 42);

        let cpu_only = parse_pressure("some avg10=0.00 avg60=0.00 avg300=0.00 total=9\n");
        assert!(cpu_only.full.is_none());
    }

    #[test]
    fn test_parse_net_dev_skips_loopback() {
        let text = "Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  5000      50    0    0    0     0          0         0     5000      50    0    0    0     0       0          0
  eth0: 10000     100    0    0    0     0          0         0     2000      20    0    0    0     0       0          0
  eth1:   500       5    0    0    0     0          0         0      300       3    0    0    0     0       0          0
";
        let totals = parse_net_dev(text);
        assert_eq!(
            totals,
            NetTotals {
                rx_bytes: 10_500,
                rx_packets: 105,
                tx_bytes: 2_300,
                tx_packets: 23,
            }
        );
    }

    #[test]
    fn test_parse_diskstats_whole_devices_only() {
        let text = " 259       0 nvme0n1 100 0 800 50 200 0 1600 70 0 0 0
 259       1 nvme0n1p1 90 0 700 40 190 0 1500 60 0 0 0
   7       0 loop0 5 0 10 1 0 0 0 0 0 0 0
";
        let devices: HashSet<String> = ["nvme0n1".to_string()].into_iter().collect();
        let totals = parse_diskstats(text, &devices);
        assert_eq!(totals.reads_completed, 100);
        assert_eq!(totals.read_sectors, 800);
        assert_eq!(totals.writes_completed, 200);
        assert_eq!(totals.write_sectors, 1600);
    }

    #[test]
    fn test_parse_pid_stat_with_spaces_in_comm() {
        let text = "4242 (llama (server) x) S 4200 4242 4242 0 -1 4194304 1500 0 3 0 700 300 0 0 20 0 12 0 98765 1000000 2560 18446744073709551615";
        let stat = parse_pid_stat(text).expect("valid pid stat");
        assert_eq!(stat.comm, "llama (server) x");
        assert_eq!(stat.ppid, 4200);
        assert_eq!(stat.minflt, 1500);
        assert_eq!(stat.majflt, 3);
        assert_eq!(stat.utime, 700);
        assert_eq!(stat.stime, 300);
        assert_eq!(stat.starttime, 98_765);
        assert_eq!(stat.rss_pages, 2560);
    }

    #[test]
    fn test_parse_pid_stat_truncated() {
        let err = parse_pid_stat("1 (init) S 0 1 1").unwrap_err();
        assert!(matches!(err, ParseError::MissingField { .. }));
    }

    #[test]
    fn test_status_fields() {
        let status = "Name:\tllama-server\nThreads:\t12\nVmRSS:\t  2048 kB\nvoluntary_ctxt_switches:\t77\n";
        assert_eq!(status_u64(status, "Threads:"), Some(12));
        assert_eq!(status_kb_bytes(status, "VmRSS:"), Some(2_097_152));
        assert_eq!(status_u64(status, "voluntary_ctxt_switches:"), Some(77));
        assert_eq!(status_u64(status, "VmSwap:"), None);
    }

    #[test]
    fn test_host_fs_fake_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let proc_root = dir.path().join("proc");
        let sys_root = dir.path().join("sys");
        std::fs::create_dir_all(proc_root.join("42")).expect("mkdir pid");
        std::fs::create_dir_all(proc_root.join("self")).expect("mkdir self");
        std::fs::create_dir_all(sys_root.join("block/sda")).expect("mkdir sda");
        std::fs::create_dir_all(sys_root.join("block/loop0")).expect("mkdir loop0");
        std::fs::create_dir_all(sys_root.join("devices/system/cpu/cpu1/cpufreq"))
            .expect("mkdir cpufreq");
        std::fs::write(
            sys_root.join("devices/system/cpu/cpu1/cpufreq/scaling_cur_freq"),
            "2400000\n",
        )
        .expect("write freq");

        let host = HostFs::new(&proc_root, &sys_root);
        assert!(host.pid_exists(42));
        assert!(!host.pid_exists(43));
        assert_eq!(host.pids().expect("pids"), vec![42]);
        assert_eq!(
            host.block_devices(),
            ["sda".to_string()].into_iter().collect::<HashSet<_>>()
        );
        assert_eq!(host.cpufreq_cpus(), vec![1]);
        assert_eq!(host.cpu_freq_khz(1), Some(2_400_000));
        assert_eq!(host.cpu_freq_khz(0), None);
    }
}
