use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::Instant;

use crate::sample::{Layout, Reading, Sample, SampleStatus};

/// Append-only CSV writer for one data source.
///
/// Every row is formatted completely before it reaches the buffered file,
/// so a crash or abort can only lose whole trailing rows.
pub struct SeriesWriter {
    path: PathBuf,
    out: BufWriter<File>,
    layout: Layout,
    columns: Option<Vec<String>>,
    pending: Vec<Sample>,
    flush_interval: Duration,
    last_flush: Instant,
    line: String,
    rows: u64,
}

impl std::fmt::Debug for SeriesWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesWriter")
            .field("path", &self.path)
            .field("layout", &self.layout)
            .field("rows", &self.rows)
            .finish()
    }
}

impl SeriesWriter {
    /// Create the file; fails if it already exists.
    pub fn create(path: &Path, layout: Layout, flush_interval: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("creating {}", path.display()))?;

        let mut writer = Self {
            path: path.to_path_buf(),
            out: BufWriter::with_capacity(64 * 1024, file),
            layout,
            columns: None,
            pending: Vec::new(),
            flush_interval,
            last_flush: Instant::now(),
            line: String::with_capacity(512),
            rows: 0,
        };

        if let Layout::Long { key } = layout {
            writeln!(writer.out, "timestamp_ns,tick,span,{key},status,value")
                .with_context(|| format!("writing header to {}", path.display()))?;
        }

        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written so far (excluding the header).
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Append one sample.
    pub fn write(&mut self, sample: &Sample) -> Result<()> {
        match self.layout {
            Layout::Long { .. } => self.write_long(sample)?,
            Layout::Wide => {
                if self.columns.is_none() {
                    if sample.status == SampleStatus::Missed {
                        // Header comes from the first real sample.
                        self.pending.push(sample.clone());
                        return Ok(());
                    }
                    self.write_wide_header(sample)?;
                }
                self.write_wide(sample)?;
            }
        }

        if self.last_flush.elapsed() >= self.flush_interval {
            self.flush()?;
        }

        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out
            .flush()
            .with_context(|| format!("flushing {}", self.path.display()))?;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Flush, sync, and close. Returns the number of rows written.
    pub fn finish(mut self) -> Result<u64> {
        if self.layout == Layout::Wide && self.columns.is_none() {
            self.columns = Some(Vec::new());
            writeln!(self.out, "timestamp_ns,tick,span,status")
                .with_context(|| format!("writing header to {}", self.path.display()))?;
            for sample in std::mem::take(&mut self.pending) {
                self.write_wide(&sample)?;
            }
        }

        self.flush()?;
        self.out
            .get_ref()
            .sync_all()
            .with_context(|| format!("syncing {}", self.path.display()))?;

        Ok(self.rows)
    }

    fn write_long(&mut self, sample: &Sample) -> Result<()> {
        self.line.clear();

        if sample.status == SampleStatus::Missed {
            let _ = writeln!(
                self.line,
                "{},{},{},,{},",
                sample.timestamp_ns,
                sample.tick,
                sample.span,
                sample.status.as_str()
            );
        } else {
            for (name, reading) in &sample.fields {
                let (status, value) = match reading {
                    Reading::Value(_) => ("ok", reading.to_string()),
                    Reading::Missing => ("missing", String::new()),
                    Reading::Unavailable => ("unavailable", String::new()),
                };
                let _ = writeln!(
                    self.line,
                    "{},{},{},{},{},{}",
                    sample.timestamp_ns,
                    sample.tick,
                    sample.span,
                    sanitize(name),
                    status,
                    value
                );
            }
        }

        self.emit()
    }

    fn write_wide_header(&mut self, first: &Sample) -> Result<()> {
        let columns: Vec<String> = first.fields.iter().map(|(n, _)| n.clone()).collect();

        self.line.clear();
        self.line.push_str("timestamp_ns,tick,span,status");
        for name in &columns {
            self.line.push(',');
            self.line.push_str(&sanitize(name));
        }
        self.line.push('\n');
        self.out
            .write_all(self.line.as_bytes())
            .with_context(|| format!("writing header to {}", self.path.display()))?;

        self.columns = Some(columns);

        for sample in std::mem::take(&mut self.pending) {
            self.write_wide(&sample)?;
        }

        Ok(())
    }

    fn write_wide(&mut self, sample: &Sample) -> Result<()> {
        self.line.clear();
        let _ = write!(
            self.line,
            "{},{},{},{}",
            sample.timestamp_ns,
            sample.tick,
            sample.span,
            sample.status.as_str()
        );

        let columns = self.columns.as_deref().unwrap_or(&[]);
        for (i, name) in columns.iter().enumerate() {
            self.line.push(',');
            if sample.status == SampleStatus::Missed {
                continue;
            }
            // Fields usually arrive in header order.
            let reading = match sample.fields.get(i) {
                Some((n, r)) if n == name => Some(*r),
                _ => sample.get(name),
            };
            let _ = write!(self.line, "{}", reading.unwrap_or(Reading::Missing));
        }
        self.line.push('\n');

        self.emit()
    }

    fn emit(&mut self) -> Result<()> {
        self.out
            .write_all(self.line.as_bytes())
            .with_context(|| format!("writing {}", self.path.display()))?;
        // Long layout emits one line per field.
        self.rows += self.line.bytes().filter(|&b| b == b'\n').count() as u64;
        Ok(())
    }
}

/// Make a metric name safe for a CSV cell.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            ',' | '"' | '\n' | '\r' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).expect("read output")
    }

    #[tokio::test]
    async fn test_long_layout_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("counters.csv");
        let mut w = SeriesWriter::create(
            &path,
            Layout::Long { key: "counter" },
            Duration::from_secs(1),
        )
        .expect("create");

        w.write(&Sample::new(
            100,
            0,
            vec![
                ("context-switches".into(), Reading::Value(12.0)),
                ("tlb-shootdowns".into(), Reading::Unavailable),
            ],
        ))
        .expect("write");
        // Every field line counts as a row.
        assert_eq!(w.rows(), 2);
        w.write(&Sample::missed(200, 1)).expect("write missed");
        w.write(
            &Sample::new(300, 4, vec![("context-switches".into(), Reading::Value(40.0))])
                .with_span(3),
        )
        .expect("write late");
        assert_eq!(w.finish().expect("finish"), 4);

        assert_eq!(
            read(&path),
            "timestamp_ns,tick,span,counter,status,value\n\
             100,0,1,context-switches,ok,12\n\
             100,0,1,tlb-shootdowns,unavailable,\n\
             200,1,0,,missed,\n\
             300,4,3,context-switches,ok,40\n"
        );
    }

    #[tokio::test]
    async fn test_wide_layout_header_from_first_real_sample() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("process.csv");
        let mut w =
            SeriesWriter::create(&path, Layout::Wide, Duration::from_secs(1)).expect("create");

        w.write(&Sample::missed(50, 0)).expect("write missed");
        w.write(&Sample::new(
            100,
            1,
            vec![
                ("cpu_total_jiffies".into(), Reading::Value(980.0)),
                ("proc_rss_bytes".into(), Reading::Value(4096.0)),
            ],
        ))
        .expect("write");
        // Process gone; a field the header does not know is dropped.
        w.write(&Sample::new(
            150,
            2,
            vec![
                ("cpu_total_jiffies".into(), Reading::Value(990.0)),
                ("proc_rss_bytes".into(), Reading::Missing),
                ("extra".into(), Reading::Value(1.0)),
            ],
        ))
        .expect("write");
        // Column absent from this sample.
        w.write(&Sample::new(
            200,
            3,
            vec![("cpu_total_jiffies".into(), Reading::Value(995.5))],
        ))
        .expect("write");
        w.finish().expect("finish");

        assert_eq!(
            read(&path),
            "timestamp_ns,tick,span,status,cpu_total_jiffies,proc_rss_bytes\n\
             50,0,0,missed,,\n\
             100,1,1,ok,980,4096\n\
             150,2,1,partial,990,NA\n\
             200,3,1,ok,995.500,NA\n"
        );
    }

    #[tokio::test]
    async fn test_wide_layout_only_missed_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("system.csv");
        let mut w =
            SeriesWriter::create(&path, Layout::Wide, Duration::from_secs(1)).expect("create");
        w.write(&Sample::missed(1, 0)).expect("write");
        w.write(&Sample::missed(2, 1)).expect("write");
        assert_eq!(w.finish().expect("finish"), 2);

        assert_eq!(
            read(&path),
            "timestamp_ns,tick,span,status\n1,0,0,missed\n2,1,0,missed\n"
        );
    }

    #[tokio::test]
    async fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("x.csv");
        std::fs::write(&path, "old").expect("seed");
        let err = SeriesWriter::create(&path, Layout::Wide, Duration::from_secs(1)).unwrap_err();
        assert!(err.to_string().contains("creating"));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("a,b\"c"), "a_b_c");
        assert_eq!(sanitize("irq_LOC"), "irq_LOC");
    }
}
