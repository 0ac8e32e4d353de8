use crate::layout::RunId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { run_id: RunId, start_step: u64, max_steps: u64 },
    Resumed { run_id: RunId, from_step: u64 },
    Step { run_id: RunId, step: u64, total: u64 },
    Checkpoint { run_id: RunId, step: u64 },
    Finished { run_id: RunId, final_step: Option<u64> },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Forwards progress to `tracing`. Per-step events go to `debug`.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { run_id, start_step, max_steps } => {
                info!(run_id = %run_id, start_step, max_steps, "run started");
            }
            ProgressEvent::Resumed { run_id, from_step } => info!(run_id = %run_id, from_step, "run resumed"),
            ProgressEvent::Step { run_id, step, total } => debug!(run_id = %run_id, "step {}/{total}", step + 1),
            ProgressEvent::Checkpoint { run_id, step } => debug!(run_id = %run_id, step, "checkpoint published"),
            ProgressEvent::Finished { run_id, final_step } => info!(run_id = %run_id, ?final_step, "run finished"),
        }
    }
}

