//! Append-only metric stream: `logs/metrics.jsonl`.
//!
//! Every line is one complete JSON object written with a single `write_all`
//! on an `O_APPEND` handle and synced before `append` returns. A crash can
//! leave at most one unterminated fragment at the end of the file. Readers
//! skip it, and [`MetricsLogger::open`] cuts it off before appending, so it
//! never fuses with the next event.

use crate::clock;
use crate::error::{RunError, RunResult};
use crate::layout::RunDirectory;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub step: u64,
    pub time: f64,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl MetricEvent {
    pub fn new(step: u64, time: f64) -> Self {
        Self { step, time, fields: Map::new() }
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

/// Time basis of the `time` field. One basis per run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockBasis {
    /// Seconds since the run's `created_at_utc`.
    RunRelative { start_unix: f64 },
    /// Seconds since the Unix epoch.
    Unix,
}

impl ClockBasis {
    /// Build from the `metrics.time_basis` setting.
    pub fn from_setting(setting: &str, created_at_utc: &str) -> RunResult<Self> {
        match setting {
            "unix" => Ok(Self::Unix),
            "run_relative" => {
                let start = clock::parse_utc(created_at_utc).ok_or_else(|| {
                    RunError::MetricEvent(format!("cannot anchor run_relative clock at `{created_at_utc}`"))
                })?;
                Ok(Self::RunRelative { start_unix: clock::unix_seconds(start) })
            }
            other => Err(RunError::MetricEvent(format!("unknown time basis `{other}`"))),
        }
    }

    pub fn now(self) -> f64 {
        let now = clock::unix_seconds(chrono::Utc::now());
        match self {
            Self::Unix => now,
            Self::RunRelative { start_unix } => (now - start_unix).max(0.0),
        }
    }
}

pub struct MetricsLogger {
    path: PathBuf,
    file: File,
    basis: ClockBasis,
    last_step: Option<u64>,
}

impl MetricsLogger {
    /// Open the run's metric stream for appending. Existing lines are scanned
    /// so a resumed run cannot go back in steps; a torn final fragment left by
    /// a crash is truncated away first.
    pub fn open(run: &RunDirectory, basis: ClockBasis) -> RunResult<Self> {
        let path = run.metrics_path();
        let scan = scan_log(&path)?;
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| RunError::MetricEvent(format!("cannot open {}: {e}", path.display())))?;
        if scan.torn_len > 0 {
            warn!(path = %path.display(), bytes = scan.torn_len, "discarding unterminated final metrics line");
            file.set_len(scan.committed_len)
                .and_then(|()| file.sync_data())
                .map_err(|e| RunError::MetricEvent(format!("cannot truncate {}: {e}", path.display())))?;
        }
        let last_step = scan.events.last().map(|e| e.step);
        debug!(path = %path.display(), ?last_step, "opened metrics log");
        Ok(Self { path, file, basis, last_step })
    }

    /// Open for a run resuming after the checkpoint at `checkpoint_step`.
    ///
    /// The step floor stays at the last logged step. Steps an interrupted
    /// session logged past the checkpoint are recomputed by the caller but
    /// must not be appended again; see [`MetricsLogger::is_logged`].
    pub fn resume(run: &RunDirectory, basis: ClockBasis, checkpoint_step: Option<u64>) -> RunResult<Self> {
        let logger = Self::open(run, basis)?;
        if let Some(last) = logger.last_step
            && checkpoint_step.is_none_or(|ckpt| last > ckpt)
        {
            warn!(
                last_logged = last,
                ?checkpoint_step,
                "metrics were logged past the last checkpoint; replayed steps already on disk will not be logged again"
            );
        }
        Ok(logger)
    }

    /// `step` is already on disk: no higher than the last logged step.
    pub fn is_logged(&self, step: u64) -> bool {
        self.last_step.is_some_and(|last| step <= last)
    }

    pub fn last_step(&self) -> Option<u64> {
        self.last_step
    }

    pub fn now(&self) -> f64 {
        self.basis.now()
    }

    /// An event for `step` stamped with the current time.
    pub fn event(&self, step: u64) -> MetricEvent {
        MetricEvent::new(step, self.now())
    }

    pub fn append(&mut self, event: &MetricEvent) -> RunResult<()> {
        let value = serde_json::to_value(event)?;
        self.append_value(value)
    }

    /// Append a raw JSON object. `step` must be a non-negative integer no
    /// lower than the last appended step; `time` must be a finite number.
    pub fn append_value(&mut self, value: Value) -> RunResult<()> {
        let Value::Object(obj) = &value else {
            return Err(RunError::MetricEvent("event must be a JSON object".to_string()));
        };
        let step = match obj.get("step") {
            None => return Err(RunError::MetricEvent("missing `step`".to_string())),
            Some(v) => v
                .as_u64()
                .ok_or_else(|| RunError::MetricEvent(format!("`step` must be an integer >= 0, found {v}")))?,
        };
        match obj.get("time") {
            None => return Err(RunError::MetricEvent("missing `time`".to_string())),
            Some(v) if !v.as_f64().is_some_and(f64::is_finite) => {
                return Err(RunError::MetricEvent(format!("`time` must be a finite number, found {v}")));
            }
            Some(_) => {}
        }
        if let Some(last) = self.last_step
            && step < last
        {
            return Err(RunError::MetricEvent(format!("step {step} is lower than the last logged step {last}")));
        }

        append_json_line(&mut self.file, &value)
            .map_err(|e| RunError::MetricEvent(format!("cannot append to {}: {e}", self.path.display())))?;
        self.last_step = Some(step);
        Ok(())
    }
}

/// Serialize `value` and append it as one line: a single `write_all` of
/// line plus newline, then `sync_data`.
pub(crate) fn append_json_line(file: &mut File, value: &impl Serialize) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(value).map_err(std::io::Error::other)?;
    line.push(b'\n');
    file.write_all(&line)?;
    file.sync_data()
}

/// Every complete event logged so far, in file order. An unterminated final
/// fragment is not an event and is skipped; any other unparseable line fails
/// with its line number.
pub fn read_events(run: &RunDirectory) -> RunResult<Vec<MetricEvent>> {
    let path = run.metrics_path();
    let scan = scan_log(&path)?;
    if scan.torn_len > 0 {
        debug!(path = %path.display(), bytes = scan.torn_len, "skipping unterminated final metrics line");
    }
    Ok(scan.events)
}

struct LogScan {
    events: Vec<MetricEvent>,
    /// Length of the prefix made of newline-terminated lines.
    committed_len: u64,
    torn_len: usize,
}

fn scan_log(path: &Path) -> RunResult<LogScan> {
    let bytes = std::fs::read(path).map_err(|e| RunError::MetricEvent(format!("cannot read {}: {e}", path.display())))?;
    let committed = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |pos| pos + 1);

    let mut events = Vec::new();
    for (idx, line) in bytes[..committed].split(|&b| b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let event = serde_json::from_slice(line)
            .map_err(|e| RunError::MetricEvent(format!("{}:{}: {e}", path.display(), idx + 1)))?;
        events.push(event);
    }
    Ok(LogScan { events, committed_len: committed as u64, torn_len: bytes.len() - committed })
}
