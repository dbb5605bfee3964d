use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use substrate::procfs::{parse_per_cpu_table, parse_pid_stat, parse_stat, vmstat_value};
use substrate::sample::{Layout, Reading, Sample};
use substrate::sampler::SeriesWriter;

const CPUS: usize = 32;

fn stat_text() -> String {
    let mut text = String::from("cpu  4705 356 584 3699176 23060 0 277 0 0 0\n");
    for cpu in 0..CPUS {
        text.push_str(&format!("cpu{cpu} 147 11 18 115599 720 0 8 0 0 0\n"));
    }
    text.push_str("intr 114930548 113199788 3 0 5 263 0 4 [...]\n");
    text.push_str("ctxt 1990473\nbtime 1062191376\nprocesses 2915\n");
    text.push_str("procs_running 1\nprocs_blocked 0\n");
    text.push_str("softirq 183433 0 21755 12 39 6 0 11 0 0 149610\n");
    text
}

fn interrupts_text() -> String {
    let mut text = String::from("     ");
    for cpu in 0..CPUS {
        text.push_str(&format!("      CPU{cpu}"));
    }
    text.push('\n');
    for row in ["0", "8", "9", "NMI", "LOC", "RES", "CAL", "TLB"] {
        text.push_str(&format!("{row:>4}:"));
        for cpu in 0..CPUS {
            text.push_str(&format!(" {:>10}", 1000 + cpu * 17));
        }
        text.push_str("   Local timer interrupts\n");
    }
    text
}

fn vmstat_text() -> String {
    let mut text = String::new();
    for i in 0..150 {
        text.push_str(&format!("nr_field_{i} {}\n", i * 31));
    }
    text.push_str("pgfault 912345678\npgmajfault 4321\npswpin 0\npswpout 0\n");
    text
}

const PID_STAT: &str = "4242 (llama-server) S 1 4242 4242 0 -1 4194304 120034 0 27 0 \
    53012 8801 0 0 20 0 17 0 123456 8123456789 1982211 18446744073709551615";

fn bench_parsers(c: &mut Criterion) {
    let stat = stat_text();
    let interrupts = interrupts_text();
    let vmstat = vmstat_text();

    c.bench_function("procfs/parse_stat", |b| {
        b.iter(|| parse_stat(black_box(&stat)).expect("parse stat"))
    });

    c.bench_function("procfs/parse_interrupts", |b| {
        b.iter(|| black_box(parse_per_cpu_table(black_box(&interrupts))).len())
    });

    c.bench_function("procfs/vmstat_pgfault", |b| {
        b.iter(|| vmstat_value(black_box(&vmstat), "pgfault"))
    });

    c.bench_function("procfs/parse_pid_stat", |b| {
        b.iter(|| parse_pid_stat(black_box(PID_STAT)).expect("parse pid stat"))
    });
}

fn bench_writer(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut writer = SeriesWriter::create(
        &dir.path().join("counters.csv"),
        Layout::Long { key: "counter" },
        Duration::from_secs(1),
    )
    .expect("writer");

    let fields: Vec<(String, Reading)> = [
        "context-switches",
        "interrupts",
        "softirqs",
        "page-faults",
        "tlb-shootdowns",
    ]
    .iter()
    .enumerate()
    .map(|(i, name)| (name.to_string(), Reading::Value(i as f64 * 3.0)))
    .collect();

    let mut tick = 0u64;
    c.bench_function("writer/long_row_set", |b| {
        b.iter(|| {
            tick += 1;
            let sample = Sample::new(1_700_000_000_000_000_000 + tick, tick, fields.clone());
            writer.write(black_box(&sample)).expect("write");
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parsers(c);
    bench_writer(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
