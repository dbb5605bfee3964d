//! Named software event counters read from procfs.
//!
//! Each counter resolves to a cumulative kernel tally (a `/proc/stat` line,
//! a `/proc/vmstat` key, or a row of `/proc/interrupts`) and is reported as
//! the count accumulated since the previous tick.

pub mod perf;

use anyhow::{bail, Result};
use tracing::{debug, warn};

use crate::procfs::{self, HostFs};
use crate::sample::{Field, Layout, Reading, Source};

/// Counters sampled when the configuration does not name any.
pub const DEFAULT_COUNTERS: &[&str] = &[
    "context-switches",
    "interrupts",
    "softirqs",
    "forks",
    "page-faults",
    "major-faults",
    "swap-ins",
    "swap-outs",
    "tlb-shootdowns",
    "rescheduling-interrupts",
    "function-call-interrupts",
    "local-timer-interrupts",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatField {
    Ctxt,
    Intr,
    Softirq,
    Processes,
}

/// Where a named counter's cumulative value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CounterSource {
    Stat(StatField),
    Vmstat(&'static str),
    Interrupt(&'static str),
}

fn resolve(name: &str) -> Option<CounterSource> {
    let source = match name {
        "context-switches" => CounterSource::Stat(StatField::Ctxt),
        "interrupts" => CounterSource::Stat(StatField::Intr),
        "softirqs" => CounterSource::Stat(StatField::Softirq),
        "forks" => CounterSource::Stat(StatField::Processes),
        "page-faults" => CounterSource::Vmstat("pgfault"),
        "major-faults" => CounterSource::Vmstat("pgmajfault"),
        "swap-ins" => CounterSource::Vmstat("pswpin"),
        "swap-outs" => CounterSource::Vmstat("pswpout"),
        "tlb-shootdowns" => CounterSource::Interrupt("TLB"),
        "rescheduling-interrupts" => CounterSource::Interrupt("RES"),
        "function-call-interrupts" => CounterSource::Interrupt("CAL"),
        "local-timer-interrupts" => CounterSource::Interrupt("LOC"),
        _ => return None,
    };
    Some(source)
}

#[derive(Debug)]
struct Counter {
    name: String,
    /// `None` once the counter is known to be unavailable on this host.
    source: Option<CounterSource>,
    prev: u64,
}

/// Raw file contents read for one tick. `None` means the read failed.
#[derive(Default)]
struct Snapshot {
    stat: Option<procfs::KernelStat>,
    vmstat: Option<String>,
    interrupts: Option<Vec<(String, u64)>>,
}

impl Snapshot {
    fn value(&self, source: CounterSource) -> Option<u64> {
        match source {
            CounterSource::Stat(field) => {
                let stat = self.stat.as_ref()?;
                match field {
                    StatField::Ctxt => stat.ctxt,
                    StatField::Intr => stat.intr,
                    StatField::Softirq => stat.softirq,
                    StatField::Processes => stat.processes,
                }
            }
            CounterSource::Vmstat(key) => procfs::vmstat_value(self.vmstat.as_deref()?, key),
            CounterSource::Interrupt(row) => self
                .interrupts
                .as_ref()?
                .iter()
                .find(|(name, _)| name == row)
                .map(|(_, v)| *v),
        }
    }
}

/// Counter Reader over procfs.
///
/// The baseline is primed at construction; the reader is consumed by the
/// sampling loop that drives it and cannot be restarted.
pub struct ProcCounterReader {
    fs: HostFs,
    counters: Vec<Counter>,
    need_stat: bool,
    need_vmstat: bool,
    need_interrupts: bool,
}

impl ProcCounterReader {
    /// Resolve `names` and prime every counter's baseline.
    pub fn new(fs: HostFs, names: &[String]) -> Result<Self> {
        if names.is_empty() {
            bail!("no counters configured");
        }

        let mut reader = Self {
            fs,
            counters: names
                .iter()
                .map(|name| Counter {
                    name: name.clone(),
                    source: resolve(name),
                    prev: 0,
                })
                .collect(),
            need_stat: false,
            need_vmstat: false,
            need_interrupts: false,
        };
        reader.refresh_needs();

        let snap = reader.read();
        for counter in &mut reader.counters {
            let Some(source) = counter.source else {
                warn!(counter = %counter.name, "unknown counter, reporting unavailable");
                continue;
            };
            match snap.value(source) {
                Some(v) => counter.prev = v,
                None => {
                    warn!(counter = %counter.name, "counter not provided by this host, reporting unavailable");
                    counter.source = None;
                }
            }
        }
        reader.refresh_needs();

        Ok(reader)
    }

    fn refresh_needs(&mut self) {
        let (mut stat, mut vmstat, mut interrupts) = (false, false, false);
        for source in self.counters.iter().filter_map(|c| c.source) {
            match source {
                CounterSource::Stat(_) => stat = true,
                CounterSource::Vmstat(_) => vmstat = true,
                CounterSource::Interrupt(_) => interrupts = true,
            }
        }
        self.need_stat = stat;
        self.need_vmstat = vmstat;
        self.need_interrupts = interrupts;
    }

    fn read(&self) -> Snapshot {
        let mut snap = Snapshot::default();

        if self.need_stat {
            match self.fs.read_proc("stat").map(|t| procfs::parse_stat(&t)) {
                Ok(Ok(stat)) => snap.stat = Some(stat),
                Ok(Err(e)) => debug!(error = %e, "parsing /proc/stat"),
                Err(e) => debug!(error = %e, "reading /proc/stat"),
            }
        }
        if self.need_vmstat {
            match self.fs.read_proc("vmstat") {
                Ok(text) => snap.vmstat = Some(text),
                Err(e) => debug!(error = %e, "reading /proc/vmstat"),
            }
        }
        if self.need_interrupts {
            match self.fs.read_proc("interrupts") {
                Ok(text) => snap.interrupts = Some(procfs::parse_per_cpu_table(&text)),
                Err(e) => debug!(error = %e, "reading /proc/interrupts"),
            }
        }

        snap
    }
}

impl Source for ProcCounterReader {
    fn name(&self) -> &str {
        "counters"
    }

    fn file_name(&self) -> &str {
        "counters.csv"
    }

    fn layout(&self) -> Layout {
        Layout::Long { key: "counter" }
    }

    fn sample(&mut self) -> Result<Vec<Field>> {
        let snap = self.read();

        let mut fields = Vec::with_capacity(self.counters.len());
        let mut any_read = false;

        for counter in &mut self.counters {
            let Some(source) = counter.source else {
                fields.push((counter.name.clone(), Reading::Unavailable));
                continue;
            };
            let reading = match snap.value(source) {
                Some(v) => {
                    any_read = true;
                    // A wrapped or reset counter reports zero for this tick.
                    let delta = v.saturating_sub(counter.prev);
                    counter.prev = v;
                    Reading::Value(delta as f64)
                }
                None => Reading::Missing,
            };
            fields.push((counter.name.clone(), reading));
        }

        if !any_read && self.counters.iter().any(|c| c.source.is_some()) {
            bail!("no counter source readable");
        }

        Ok(fields)
    }

    fn unavailable(&self) -> Vec<String> {
        self.counters
            .iter()
            .filter(|c| c.source.is_none())
            .map(|c| c.name.clone())
            .collect()
    }
}
