use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use tracing::{debug, warn};

use super::delta;
use crate::procfs::{self, CpuTimes, DiskTotals, HostFs, NetTotals, Pressure};
use crate::sample::{Field, Layout, Reading, Source};

const PSI_RESOURCES: &[&str] = &["cpu", "memory", "io"];
const PSI_KINDS: &[&str] = &["some", "full"];
const PSI_STATS: &[&str] = &["avg10", "avg60", "avg300", "total_delta"];

const NET_FIELDS: &[&str] = &["net_rx_bytes", "net_rx_packets", "net_tx_bytes", "net_tx_packets"];
const DISK_FIELDS: &[&str] = &[
    "disk_reads_completed",
    "disk_writes_completed",
    "disk_read_sectors",
    "disk_write_sectors",
];

/// A per-CPU table sampled as per-row deltas.
#[derive(Debug)]
struct Table {
    prefix: &'static str,
    file: &'static str,
    /// Rows seen at construction, in file order; `None` if unreadable then.
    prev: Option<Vec<(String, u64)>>,
}

impl Table {
    fn prime(fs: &HostFs, prefix: &'static str, file: &'static str) -> Self {
        let prev = match fs.read_proc(file) {
            Ok(text) => Some(procfs::parse_per_cpu_table(&text)),
            Err(e) => {
                warn!(file, error = %e, "table not readable, columns unavailable");
                None
            }
        };
        Self { prefix, file, prev }
    }

    /// Returns whether the file was read.
    fn sample(&mut self, fs: &HostFs, fields: &mut Vec<Field>) -> bool {
        let Some(prev) = self.prev.as_mut() else {
            return false;
        };

        let current: Option<HashMap<String, u64>> = match fs.read_proc(self.file) {
            Ok(text) => Some(procfs::parse_per_cpu_table(&text).into_iter().collect()),
            Err(e) => {
                debug!(file = self.file, error = %e, "table read failed");
                None
            }
        };

        for (name, last) in prev.iter_mut() {
            let reading = match current.as_ref().and_then(|c| c.get(name.as_str())) {
                Some(&v) => delta(last, v),
                None => Reading::Missing,
            };
            fields.push((format!("{}_{}", self.prefix, name), reading));
        }

        current.is_some()
    }
}

/// System-wide snapshotter writing `system.csv`.
pub struct SystemSnapshotter {
    fs: HostFs,
    cpu: Option<CpuTimes>,
    irq: Table,
    softirq: Table,
    /// Previous `total` per `psi_<res>_<kind>`; `None` when PSI is unsupported.
    psi: Option<HashMap<String, u64>>,
    net: Option<NetTotals>,
    disk: Option<DiskTotals>,
    devices: HashSet<String>,
    cpus: Vec<u32>,
}

impl SystemSnapshotter {
    /// Discover what this host provides and prime every delta baseline.
    pub fn new(fs: HostFs) -> Self {
        let cpu = read_cpu(&fs);

        let irq = Table::prime(&fs, "irq", "interrupts");
        let softirq = Table::prime(&fs, "softirq", "softirqs");

        let mut psi_totals = HashMap::new();
        for res in PSI_RESOURCES {
            if let Some(p) = read_pressure(&fs, res) {
                for (kind, line) in [("some", p.some), ("full", p.full)] {
                    if let Some(line) = line {
                        psi_totals.insert(format!("psi_{res}_{kind}"), line.total);
                    }
                }
            }
        }
        let psi = if psi_totals.is_empty() {
            warn!("pressure stall information not available");
            None
        } else {
            Some(psi_totals)
        };

        let net = fs.read_proc("net/dev").ok().map(|t| procfs::parse_net_dev(&t));
        let devices = fs.block_devices();
        let disk = fs
            .read_proc("diskstats")
            .ok()
            .map(|t| procfs::parse_diskstats(&t, &devices));
        let cpus = fs.cpufreq_cpus();

        Self {
            fs,
            cpu,
            irq,
            softirq,
            psi,
            net,
            disk,
            devices,
            cpus,
        }
    }

    fn sample_cpu(&mut self, fields: &mut Vec<Field>) -> bool {
        match read_cpu(&self.fs) {
            Some(cur) => {
                // No baseline or no elapsed machine time: nothing measured.
                let util = match self.cpu.and_then(|prev| cur.util_pct_since(&prev)) {
                    Some(pct) => Reading::Value(pct),
                    None => Reading::Missing,
                };
                self.cpu = Some(cur);
                fields.push(("cpu_total_jiffies".into(), Reading::Value(cur.total as f64)));
                fields.push(("cpu_idle_jiffies".into(), Reading::Value(cur.idle as f64)));
                fields.push(("cpu_util_pct".into(), util));
                true
            }
            None => {
                for name in ["cpu_total_jiffies", "cpu_idle_jiffies", "cpu_util_pct"] {
                    fields.push((name.into(), Reading::Missing));
                }
                false
            }
        }
    }

    fn sample_psi(&mut self, fields: &mut Vec<Field>) -> bool {
        let Some(prev) = self.psi.as_mut() else {
            for res in PSI_RESOURCES {
                for kind in PSI_KINDS {
                    for stat in PSI_STATS {
                        fields.push((format!("psi_{res}_{kind}_{stat}"), Reading::Unavailable));
                    }
                }
            }
            return false;
        };

        let mut any = false;
        for res in PSI_RESOURCES {
            let pressure = read_pressure(&self.fs, res);
            any |= pressure.is_some();

            for kind in PSI_KINDS {
                let key = format!("psi_{res}_{kind}");
                let line = pressure.and_then(|p| if *kind == "some" { p.some } else { p.full });

                let readings: [Reading; 4] = match (line, prev.get_mut(&key)) {
                    (Some(line), Some(last)) => [
                        Reading::Value(line.avg10),
                        Reading::Value(line.avg60),
                        Reading::Value(line.avg300),
                        delta(last, line.total),
                    ],
                    // Never present on this host.
                    (_, None) => [Reading::Unavailable; 4],
                    (None, Some(_)) => [Reading::Missing; 4],
                };

                for (stat, reading) in PSI_STATS.iter().zip(readings) {
                    fields.push((format!("{key}_{stat}"), reading));
                }
            }
        }
        any
    }

    fn sample_net(&mut self, fields: &mut Vec<Field>) -> bool {
        let Some(prev) = self.net.as_mut() else {
            push_all(fields, NET_FIELDS, Reading::Unavailable);
            return false;
        };

        match self.fs.read_proc("net/dev") {
            Ok(text) => {
                let cur = procfs::parse_net_dev(&text);
                fields.push(("net_rx_bytes".into(), delta(&mut prev.rx_bytes, cur.rx_bytes)));
                fields.push(("net_rx_packets".into(), delta(&mut prev.rx_packets, cur.rx_packets)));
                fields.push(("net_tx_bytes".into(), delta(&mut prev.tx_bytes, cur.tx_bytes)));
                fields.push(("net_tx_packets".into(), delta(&mut prev.tx_packets, cur.tx_packets)));
                true
            }
            Err(e) => {
                debug!(error = %e, "net/dev read failed");
                push_all(fields, NET_FIELDS, Reading::Missing);
                false
            }
        }
    }

    fn sample_disk(&mut self, fields: &mut Vec<Field>) -> bool {
        let Some(prev) = self.disk.as_mut() else {
            push_all(fields, DISK_FIELDS, Reading::Unavailable);
            return false;
        };

        match self.fs.read_proc("diskstats") {
            Ok(text) => {
                let cur = procfs::parse_diskstats(&text, &self.devices);
                fields.push((
                    "disk_reads_completed".into(),
                    delta(&mut prev.reads_completed, cur.reads_completed),
                ));
                fields.push((
                    "disk_writes_completed".into(),
                    delta(&mut prev.writes_completed, cur.writes_completed),
                ));
                fields.push((
                    "disk_read_sectors".into(),
                    delta(&mut prev.read_sectors, cur.read_sectors),
                ));
                fields.push((
                    "disk_write_sectors".into(),
                    delta(&mut prev.write_sectors, cur.write_sectors),
                ));
                true
            }
            Err(e) => {
                debug!(error = %e, "diskstats read failed");
                push_all(fields, DISK_FIELDS, Reading::Missing);
                false
            }
        }
    }

    fn sample_freq(&self, fields: &mut Vec<Field>) -> bool {
        let mut any = false;
        for &cpu in &self.cpus {
            let reading = match self.fs.cpu_freq_khz(cpu) {
                Some(khz) => {
                    any = true;
                    Reading::Value(khz as f64)
                }
                None => Reading::Missing,
            };
            fields.push((format!("cpu{cpu}_freq_khz"), reading));
        }
        any
    }
}

impl Source for SystemSnapshotter {
    fn name(&self) -> &str {
        "system"
    }

    fn file_name(&self) -> &str {
        "system.csv"
    }

    fn layout(&self) -> Layout {
        Layout::Wide
    }

    fn sample(&mut self) -> Result<Vec<Field>> {
        let mut fields = Vec::with_capacity(128);

        // Every sub-read is independent.
        let mut any = self.sample_cpu(&mut fields);
        any |= self.irq.sample(&self.fs, &mut fields);
        any |= self.softirq.sample(&self.fs, &mut fields);
        any |= self.sample_psi(&mut fields);
        any |= self.sample_net(&mut fields);
        any |= self.sample_disk(&mut fields);
        any |= self.sample_freq(&mut fields);

        if !any {
            bail!("no system source readable");
        }

        Ok(fields)
    }

    fn unavailable(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.irq.prev.is_none() {
            out.push("irq_*".to_string());
        }
        if self.softirq.prev.is_none() {
            out.push("softirq_*".to_string());
        }
        match &self.psi {
            None => out.push("psi_*".to_string()),
            Some(seen) => {
                for res in PSI_RESOURCES {
                    for kind in PSI_KINDS {
                        let key = format!("psi_{res}_{kind}");
                        if !seen.contains_key(&key) {
                            out.push(format!("{key}_*"));
                        }
                    }
                }
            }
        }
        if self.net.is_none() {
            out.push("net_*".to_string());
        }
        if self.disk.is_none() {
            out.push("disk_*".to_string());
        }
        if self.cpus.is_empty() {
            out.push("cpu*_freq_khz".to_string());
        }
        out
    }
}

fn read_cpu(fs: &HostFs) -> Option<CpuTimes> {
    let text = fs.read_proc("stat").ok()?;
    match procfs::parse_stat(&text) {
        Ok(stat) => Some(stat.cpu),
        Err(e) => {
            debug!(error = %e, "parsing /proc/stat");
            None
        }
    }
}

fn read_pressure(fs: &HostFs, res: &str) -> Option<Pressure> {
    let text = fs.read_proc(&format!("pressure/{res}")).ok()?;
    Some(procfs::parse_pressure(&text))
}

fn push_all(fields: &mut Vec<Field>, names: &[&str], reading: Reading) {
    fields.extend(names.iter().map(|n| (n.to_string(), reading)));
}
