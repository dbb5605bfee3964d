//! Prompt set loading and sequential prompt dispatch within the prompt phase.

pub mod client;

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::RunContext;

pub use client::{
    wait_ready, Completion, CompletionRequest, DispatchError, HttpClient, InferenceClient,
};

/// One prompt of a prompt set.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub index: usize,
    pub id: Option<Value>,
    pub title: Option<String>,
    pub instructions: String,
}

/// Ordered prompts loaded from a JSON file.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub path: PathBuf,
    /// Hex SHA-256 of the file contents.
    pub sha256: String,
    pub prompts: Vec<Prompt>,
}

impl PromptSet {
    /// Load a JSON array whose elements are strings or objects with a
    /// non-empty `instructions` string and optional `id` and `title`.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("reading prompt file {}", path.display()))?;

        let prompts = parse_prompts(&data)
            .with_context(|| format!("parsing prompt file {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            sha256: hex_digest(&data),
            prompts,
        })
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

fn parse_prompts(data: &[u8]) -> Result<Vec<Prompt>> {
    let root: Value = serde_json::from_slice(data).context("invalid JSON")?;
    let Value::Array(items) = root else {
        bail!("prompt file must contain a JSON array");
    };
    if items.is_empty() {
        bail!("prompt file must contain at least one prompt");
    }

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let (id, title, instructions) = match item {
                Value::String(s) => (None, None, s),
                Value::Object(mut obj) => {
                    let instructions = match obj.remove("instructions") {
                        Some(Value::String(s)) => s,
                        _ => bail!("prompt {index}: missing 'instructions' string"),
                    };
                    let id = obj.remove("id").filter(|v| !v.is_null());
                    let title = obj
                        .remove("title")
                        .and_then(|v| v.as_str().map(str::to_string));
                    (id, title, instructions)
                }
                _ => bail!("prompt {index}: expected a string or an object"),
            };

            if instructions.trim().is_empty() {
                bail!("prompt {index}: instructions must not be blank");
            }

            Ok(Prompt {
                index,
                id,
                title,
                instructions,
            })
        })
        .collect()
}

fn hex_digest(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// How a prompt dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Timeout,
    HttpStatus,
    Connection,
    /// The server answered 2xx with a body that is not JSON. The body is
    /// kept as a string `response`, but the record has `ok = false` and
    /// counts toward `prompts_failed`.
    Decode,
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Timeout => "timeout",
            Outcome::HttpStatus => "http_status",
            Outcome::Connection => "connection",
            Outcome::Decode => "decode",
            Outcome::Cancelled => "cancelled",
        }
    }

    fn from_error(e: &DispatchError) -> Self {
        match e {
            DispatchError::Timeout(_) => Outcome::Timeout,
            DispatchError::Connect(_) => Outcome::Connection,
            DispatchError::Status { .. } => Outcome::HttpStatus,
            DispatchError::Decode { .. } => Outcome::Decode,
            DispatchError::Cancelled => Outcome::Cancelled,
        }
    }
}

/// One line of `responses.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptRecord {
    pub index: usize,
    pub id: Option<Value>,
    pub title: Option<String>,
    pub prompt: String,
    pub ok: bool,
    pub outcome: Outcome,
    pub error: Option<String>,
    pub status_code: Option<u16>,
    pub t_request_start_ns: u64,
    pub t_request_end_ns: u64,
    pub duration_ms: f64,
    pub response: Value,
}

/// Why the prompt phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseEnd {
    /// Every prompt was dispatched.
    Exhausted,
    /// The prompt-phase duration elapsed.
    Deadline,
    /// Time was left, but less than the minimum request budget.
    Budget,
    /// The run was cancelled.
    Interrupted,
}

/// Totals for one prompt phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub configured: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub end: PhaseEnd,
}

/// Callback receiving every finished record.
pub type RecordCallback = Arc<dyn Fn(&PromptRecord) + Send + Sync>;

/// Request shaping and budget knobs.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub n_predict: u32,
    pub ignore_eos: bool,
    pub logit_bias: Vec<Value>,
    pub request_timeout: Duration,
    pub min_request_budget: Duration,
}

/// Prompt Dispatcher: sends prompts one at a time and appends a record for
/// each to `responses.jsonl`.
pub struct Dispatcher<C: InferenceClient> {
    client: C,
    settings: DispatchSettings,
    ctx: Arc<RunContext>,
    log: BufWriter<File>,
    log_path: PathBuf,
    on_record: Option<RecordCallback>,
}

impl<C: InferenceClient> Dispatcher<C> {
    /// Create the dispatcher and its record log; fails if the log exists.
    pub fn new(
        client: C,
        settings: DispatchSettings,
        ctx: Arc<RunContext>,
        log_path: &Path,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(log_path)
            .with_context(|| format!("creating {}", log_path.display()))?;

        Ok(Self {
            client,
            settings,
            ctx,
            log: BufWriter::new(file),
            log_path: log_path.to_path_buf(),
            on_record: None,
        })
    }

    /// Set a callback invoked with every record.
    pub fn with_record_callback(mut self, cb: RecordCallback) -> Self {
        self.on_record = Some(cb);
        self
    }

    /// Dispatch prompts in order until they run out, the phase deadline
    /// leaves too little budget, or `cancel` fires.
    pub async fn run(
        &mut self,
        prompts: &[Prompt],
        phase_deadline: Instant,
        cancel: &CancellationToken,
    ) -> DispatchSummary {
        let mut summary = DispatchSummary {
            configured: prompts.len(),
            dispatched: 0,
            completed: 0,
            failed: 0,
            skipped: 0,
            end: PhaseEnd::Exhausted,
        };

        for prompt in prompts {
            if cancel.is_cancelled() {
                summary.end = PhaseEnd::Interrupted;
                break;
            }

            let remaining = phase_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                summary.end = PhaseEnd::Deadline;
                break;
            }
            if remaining < self.settings.min_request_budget {
                info!(
                    remaining = ?remaining,
                    min_budget = ?self.settings.min_request_budget,
                    "not enough prompt-phase time left for another request"
                );
                summary.end = PhaseEnd::Budget;
                break;
            }

            let timeout = self.settings.request_timeout.min(remaining);
            let record = self.dispatch_one(prompt, timeout, cancel).await;

            summary.dispatched += 1;
            if record.ok {
                summary.completed += 1;
            } else {
                summary.failed += 1;
            }

            let cancelled = record.outcome == Outcome::Cancelled;
            self.append(&record);

            if cancelled {
                summary.end = PhaseEnd::Interrupted;
                break;
            }
        }

        summary.skipped = summary.configured - summary.dispatched;

        if let Err(e) = self.log.flush() {
            warn!(path = %self.log_path.display(), error = %e, "flushing prompt log failed");
        }

        info!(
            configured = summary.configured,
            dispatched = summary.dispatched,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            end = ?summary.end,
            "prompt phase finished"
        );

        summary
    }

    async fn dispatch_one(
        &self,
        prompt: &Prompt,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> PromptRecord {
        let req = CompletionRequest {
            prompt: prompt.instructions.clone(),
            n_predict: self.settings.n_predict,
            ignore_eos: self.settings.ignore_eos,
            logit_bias: self.settings.logit_bias.clone(),
        };

        let started = Instant::now();
        let t_start = self.ctx.now_ns();

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(DispatchError::Cancelled),
            r = self.client.complete(&req, timeout) => r,
        };

        let t_end = self.ctx.now_ns();
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut record = PromptRecord {
            index: prompt.index,
            id: prompt.id.clone(),
            title: prompt.title.clone(),
            prompt: prompt.instructions.clone(),
            ok: false,
            outcome: Outcome::Completed,
            error: None,
            status_code: None,
            t_request_start_ns: t_start,
            t_request_end_ns: t_end,
            duration_ms,
            response: Value::Null,
        };

        match result {
            Ok(completion) => {
                record.ok = true;
                record.status_code = Some(completion.status);
                record.response = completion.body;
                info!(index = prompt.index, duration_ms, "prompt completed");
            }
            Err(e) => {
                record.outcome = Outcome::from_error(&e);
                record.status_code = e.status_code();
                record.error = Some(e.to_string());
                match e {
                    DispatchError::Decode { body, .. } => record.response = Value::String(body),
                    DispatchError::Status { body, .. } => record.response = Value::String(body),
                    _ => {}
                }
                warn!(
                    index = prompt.index,
                    outcome = ?record.outcome,
                    error = record.error.as_deref().unwrap_or_default(),
                    "prompt failed"
                );
            }
        }

        record
    }

    fn append(&mut self, record: &PromptRecord) {
        let written = serde_json::to_writer(&mut self.log, record)
            .map_err(std::io::Error::from)
            .and_then(|()| self.log.write_all(b"\n"))
            .and_then(|()| self.log.flush());

        if let Err(e) = written {
            warn!(path = %self.log_path.display(), index = record.index, error = %e, "writing prompt record failed");
        }

        if let Some(ref cb) = self.on_record {
            cb(record);
        }
    }
}
