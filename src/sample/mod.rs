use std::fmt;

use anyhow::Result;

/// Value of one named metric in one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    /// A measured value.
    Value(f64),
    /// The field could not be read this time (e.g. target process gone).
    Missing,
    /// The host does not provide this metric at all.
    Unavailable,
}

impl Reading {
    pub fn from_opt(v: Option<u64>) -> Self {
        v.map_or(Reading::Missing, |v| Reading::Value(v as f64))
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Reading::Value(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Reading::Unavailable)
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Value(v) => write_number(f, *v),
            Reading::Missing => f.write_str("NA"),
            Reading::Unavailable => f.write_str("unavailable"),
        }
    }
}

fn write_number(f: &mut fmt::Formatter<'_>, v: f64) -> fmt::Result {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        write!(f, "{}", v as i64)
    } else {
        write!(f, "{v:.3}")
    }
}

/// Outcome of one sampling iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleStatus {
    Ok,
    /// At least one field is [`Reading::Missing`].
    Partial,
    /// The iteration produced no data.
    Missed,
}

impl SampleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleStatus::Ok => "ok",
            SampleStatus::Partial => "partial",
            SampleStatus::Missed => "missed",
        }
    }
}

/// A named metric reading.
pub type Field = (String, Reading);

/// One timestamped observation from one data source.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Absolute wall-clock timestamp in Unix nanoseconds.
    pub timestamp_ns: u64,
    /// Index of the schedule tick this sample belongs to.
    pub tick: u64,
    /// Schedule intervals covered by this sample's deltas; more than one
    /// after skipped ticks, zero for missed rows.
    pub span: u64,
    pub status: SampleStatus,
    pub fields: Vec<Field>,
}

impl Sample {
    /// Build a sample, deriving the status from its fields.
    pub fn new(timestamp_ns: u64, tick: u64, fields: Vec<Field>) -> Self {
        let status = if fields.iter().any(|(_, r)| matches!(r, Reading::Missing)) {
            SampleStatus::Partial
        } else {
            SampleStatus::Ok
        };

        Self {
            timestamp_ns,
            tick,
            span: 1,
            status,
            fields,
        }
    }

    pub fn with_span(mut self, span: u64) -> Self {
        self.span = span;
        self
    }

    /// An explicit marker for an iteration that produced nothing.
    pub fn missed(timestamp_ns: u64, tick: u64) -> Self {
        Self {
            timestamp_ns,
            tick,
            span: 0,
            status: SampleStatus::Missed,
            fields: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Reading> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, r)| *r)
    }
}

/// Row shape of a data source's output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// One row per metric per sample: `timestamp_ns,tick,span,<key>,status,value`.
    Long { key: &'static str },
    /// One row per sample with a column per metric.
    Wide,
}

/// A pollable data source driven by a sampling loop.
pub trait Source: Send {
    /// Short identifier used in logs, metadata, and metrics.
    fn name(&self) -> &str;

    /// Output file name inside the run directory.
    fn file_name(&self) -> &str;

    fn layout(&self) -> Layout;

    /// Read all metrics at this instant. An error marks the iteration missed.
    fn sample(&mut self) -> Result<Vec<Field>>;

    /// Metric names this host does not provide.
    fn unavailable(&self) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_display() {
        assert_eq!(Reading::Value(42.0).to_string(), "42");
        assert_eq!(Reading::Value(0.0).to_string(), "0");
        assert_eq!(Reading::Value(12.5).to_string(), "12.500");
        assert_eq!(Reading::Missing.to_string(), "NA");
        assert_eq!(Reading::Unavailable.to_string(), "unavailable");
    }

    #[test]
    fn test_sample_status_from_fields() {
        let ok = Sample::new(1, 0, vec![("a".into(), Reading::Value(1.0))]);
        assert_eq!(ok.status, SampleStatus::Ok);

        let unavailable = Sample::new(1, 0, vec![("a".into(), Reading::Unavailable)]);
        assert_eq!(unavailable.status, SampleStatus::Ok);

        let partial = Sample::new(
            1,
            0,
            vec![
                ("a".into(), Reading::Value(1.0)),
                ("b".into(), Reading::Missing),
            ],
        );
        assert_eq!(partial.status, SampleStatus::Partial);
        assert_eq!(partial.get("b"), Some(Reading::Missing));

        let missed = Sample::missed(5, 3);
        assert_eq!(missed.status.as_str(), "missed");
        assert!(missed.fields.is_empty());
        assert_eq!(missed.span, 0);
        assert_eq!(ok.with_span(4).span, 4);
    }

    #[test]
    fn test_reading_from_opt() {
        assert_eq!(Reading::from_opt(Some(3)), Reading::Value(3.0));
        assert_eq!(Reading::from_opt(None), Reading::Missing);
        assert!(Reading::Unavailable.is_unavailable());
        assert_eq!(Reading::Value(2.0).value(), Some(2.0));
    }
}
