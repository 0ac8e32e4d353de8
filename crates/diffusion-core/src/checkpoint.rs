//! Crash-safe checkpoints under `ckpts/`.
//!
//! ```text
//! ckpts/
//!   .staging-<uuid>/          being written, never read
//!   last/
//!     LATEST.json             pointer, replaced atomically
//!     gen-<step>-<id>/
//!       checkpoint.json       CheckpointRecord
//!       <blob>                one file per named state blob
//!   best/                     same shape, created on first save_best
//! ```
//!
//! A generation directory is complete before it is renamed into its slot,
//! and only becomes current once the pointer names it. A crash at any point
//! leaves the previous pointer, and therefore the previous checkpoint, intact.

use crate::clock;
use crate::error::{RunError, RunResult};
use crate::layout::{sync_dir, write_atomic, write_new, RunDirectory, CKPTS_DIR};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const RECORD_FILE: &str = "checkpoint.json";
pub const POINTER_FILE: &str = "LATEST.json";

const GENERATION_PREFIX: &str = "gen-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointSlot {
    /// Most recent state; the one resume reads.
    Last,
    /// Independently managed, never needed for resume.
    Best,
}

impl CheckpointSlot {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Last => "last",
            Self::Best => "best",
        }
    }
}

/// Opaque named blobs making up one checkpoint. The core never interprets
/// their contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointState {
    blobs: BTreeMap<String, Vec<u8>>,
}

impl CheckpointState {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_blob(mut self, name: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.blobs.insert(name.to_string(), bytes.into());
        self
    }

    pub fn with_json<T: Serialize>(self, name: &str, value: &T) -> RunResult<Self> {
        let bytes = serde_json::to_vec_pretty(value)?;
        Ok(self.with_blob(name, bytes))
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.blobs.get(name).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobEntry {
    pub name: String,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub step: u64,
    pub created_at_utc: String,
    pub blobs: Vec<BlobEntry>,
    /// Generation directory the record was loaded from.
    #[serde(skip)]
    pub dir: PathBuf,
}

impl CheckpointRecord {
    /// Read a blob and verify it against the recorded size and hash.
    pub fn read_blob(&self, name: &str) -> RunResult<Vec<u8>> {
        let entry = self
            .blobs
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| RunError::Checkpoint(format!("no blob `{name}` in checkpoint {}", self.dir.display())))?;
        let path = self.dir.join(&entry.name);
        let bytes = fs::read(&path).map_err(|e| RunError::checkpoint_io("cannot read", &path, &e))?;
        let actual = hex::encode(Sha256::digest(&bytes));
        if bytes.len() as u64 != entry.bytes || actual != entry.sha256 {
            return Err(RunError::Checkpoint(format!(
                "blob {} is corrupt: expected {} bytes sha256 {}, found {} bytes sha256 {actual}",
                path.display(),
                entry.bytes,
                entry.sha256,
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> RunResult<T> {
        let bytes = self.read_blob(name)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| RunError::Checkpoint(format!("blob `{name}` in {} is not valid JSON: {e}", self.dir.display())))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Pointer {
    generation: String,
    step: u64,
}

pub struct CheckpointManager {
    ckpts_dir: PathBuf,
}

impl CheckpointManager {
    pub fn for_run(run: &RunDirectory) -> Self {
        Self { ckpts_dir: run.root_path().join(CKPTS_DIR) }
    }

    pub fn save(&self, step: u64, state: &CheckpointState) -> RunResult<CheckpointRecord> {
        self.save_slot(CheckpointSlot::Last, step, state)
    }

    /// The most recently published checkpoint, or `None` if nothing was
    /// ever saved.
    pub fn load(&self) -> RunResult<Option<CheckpointRecord>> {
        self.load_slot(CheckpointSlot::Last)
    }

    pub fn save_best(&self, step: u64, state: &CheckpointState) -> RunResult<CheckpointRecord> {
        self.save_slot(CheckpointSlot::Best, step, state)
    }

    pub fn load_best(&self) -> RunResult<Option<CheckpointRecord>> {
        self.load_slot(CheckpointSlot::Best)
    }

    pub fn save_slot(&self, slot: CheckpointSlot, step: u64, state: &CheckpointState) -> RunResult<CheckpointRecord> {
        if state.is_empty() {
            return Err(RunError::Checkpoint(format!("refusing to save an empty checkpoint at step {step}")));
        }
        for name in state.blobs.keys() {
            validate_blob_name(name)?;
        }

        let staging = self.ckpts_dir.join(format!(".staging-{}", Uuid::new_v4().simple()));
        let record = match write_generation(&staging, step, state) {
            Ok(record) => record,
            Err(e) => {
                discard(&staging);
                return Err(e);
            }
        };

        let slot_dir = self.ckpts_dir.join(slot.dir_name());
        fs::create_dir_all(&slot_dir).map_err(|e| RunError::checkpoint_io("cannot create", &slot_dir, &e))?;
        let id = Uuid::new_v4().simple().to_string();
        let generation = format!("{GENERATION_PREFIX}{step:010}-{}", &id[..8]);
        let gen_dir = slot_dir.join(&generation);
        if let Err(e) = fs::rename(&staging, &gen_dir) {
            discard(&staging);
            return Err(RunError::checkpoint_io("cannot publish", &gen_dir, &e));
        }
        sync_dir(&slot_dir);

        let pointer = serde_json::to_vec_pretty(&Pointer { generation: generation.clone(), step })?;
        let pointer_path = slot_dir.join(POINTER_FILE);
        if let Err(e) = write_atomic(&pointer_path, &pointer) {
            discard(&gen_dir);
            return Err(RunError::checkpoint_io("cannot publish", &pointer_path, &e));
        }

        prune(&slot_dir, &generation);
        info!(slot = slot.dir_name(), step, generation = %generation, "saved checkpoint");
        Ok(CheckpointRecord { dir: gen_dir, ..record })
    }

    pub fn load_slot(&self, slot: CheckpointSlot) -> RunResult<Option<CheckpointRecord>> {
        let slot_dir = self.ckpts_dir.join(slot.dir_name());
        let pointer_path = slot_dir.join(POINTER_FILE);
        if !pointer_path.exists() {
            debug!(slot = slot.dir_name(), "no checkpoint published yet");
            return Ok(None);
        }

        let bytes = fs::read(&pointer_path).map_err(|e| RunError::checkpoint_io("cannot read", &pointer_path, &e))?;
        let pointer: Pointer = serde_json::from_slice(&bytes)
            .map_err(|e| RunError::Checkpoint(format!("{} is unreadable: {e}", pointer_path.display())))?;
        if pointer.generation.contains(['/', '\\']) || !pointer.generation.starts_with(GENERATION_PREFIX) {
            return Err(RunError::Checkpoint(format!(
                "{} names an invalid generation `{}`",
                pointer_path.display(),
                pointer.generation
            )));
        }

        let gen_dir = slot_dir.join(&pointer.generation);
        let record_path = gen_dir.join(RECORD_FILE);
        let bytes = fs::read(&record_path).map_err(|e| RunError::checkpoint_io("cannot read", &record_path, &e))?;
        let record: CheckpointRecord = serde_json::from_slice(&bytes)
            .map_err(|e| RunError::Checkpoint(format!("{} is unreadable: {e}", record_path.display())))?;
        if record.step != pointer.step {
            return Err(RunError::Checkpoint(format!(
                "{} records step {} but the pointer says {}",
                record_path.display(),
                record.step,
                pointer.step
            )));
        }
        debug!(slot = slot.dir_name(), step = record.step, "loaded checkpoint");
        Ok(Some(CheckpointRecord { dir: gen_dir, ..record }))
    }
}

fn validate_blob_name(name: &str) -> RunResult<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name == RECORD_FILE
    {
        return Err(RunError::Checkpoint(format!("invalid blob name `{name}`")));
    }
    Ok(())
}

fn write_generation(staging: &Path, step: u64, state: &CheckpointState) -> RunResult<CheckpointRecord> {
    fs::create_dir(staging).map_err(|e| RunError::checkpoint_io("cannot create", staging, &e))?;

    let mut blobs = Vec::with_capacity(state.blobs.len());
    for (name, bytes) in &state.blobs {
        let path = staging.join(name);
        write_new(&path, bytes).map_err(|e| RunError::checkpoint_io("cannot write", &path, &e))?;
        blobs.push(BlobEntry { name: name.clone(), bytes: bytes.len() as u64, sha256: hex::encode(Sha256::digest(bytes)) });
    }

    let record = CheckpointRecord { step, created_at_utc: clock::utc_now(), blobs, dir: staging.to_path_buf() };
    let record_path = staging.join(RECORD_FILE);
    write_new(&record_path, &serde_json::to_vec_pretty(&record)?)
        .map_err(|e| RunError::checkpoint_io("cannot write", &record_path, &e))?;
    sync_dir(staging);
    Ok(record)
}

/// Remove every generation in `slot_dir` except `current`. Failures are
/// logged; the published checkpoint is already safe.
fn prune(slot_dir: &Path, current: &str) {
    let Ok(entries) = fs::read_dir(slot_dir) else {
        return;
    };
    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(GENERATION_PREFIX) || name == current {
            continue;
        }
        if let Err(e) = fs::remove_dir_all(entry.path()) {
            warn!(path = %entry.path().display(), error = %e, "failed to prune old checkpoint generation");
        }
    }
}

fn discard(staging: &Path) {
    if staging.exists()
        && let Err(e) = fs::remove_dir_all(staging)
    {
        warn!(path = %staging.display(), error = %e, "failed to remove unpublished checkpoint directory");
    }
}
