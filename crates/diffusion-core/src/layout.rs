//! On-disk run directory contract.
//!
//! ```text
//! <run_root>/<run_id>/
//!   config.resolved.yaml
//!   meta/provenance.json
//!   logs/metrics.jsonl
//!   ckpts/last/
//!   artifacts/
//! ```
//!
//! The skeleton is assembled in a hidden staging directory and published with
//! a single rename, so an observer never sees a half-built run.

use crate::clock;
use crate::config::ResolvedConfig;
use crate::error::{RunError, RunResult};
use crate::manifest::sha256_file;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bumped only on breaking changes to the directory contract.
pub const LAYOUT_VERSION: u32 = 1;

pub const CONFIG_FILE: &str = "config.resolved.yaml";
pub const META_DIR: &str = "meta";
pub const PROVENANCE_FILE: &str = "meta/provenance.json";
pub const MANIFEST_FILE: &str = "meta/manifest.json";
pub const RESUMES_FILE: &str = "meta/resumes.jsonl";
pub const LOGS_DIR: &str = "logs";
pub const METRICS_FILE: &str = "logs/metrics.jsonl";
pub const CKPTS_DIR: &str = "ckpts";
pub const CKPT_LAST_DIR: &str = "ckpts/last";
pub const CKPT_BEST_DIR: &str = "ckpts/best";
pub const ARTIFACTS_DIR: &str = "artifacts";
pub const LOCK_FILE: &str = "run.lock";

const MAX_ID_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    File,
    Dir,
}

/// Entries that must exist for a run to be resumable.
const REQUIRED_ENTRIES: &[(&str, EntryKind)] = &[
    (CONFIG_FILE, EntryKind::File),
    (PROVENANCE_FILE, EntryKind::File),
    (METRICS_FILE, EntryKind::File),
    (CKPT_LAST_DIR, EntryKind::Dir),
    (ARTIFACTS_DIR, EntryKind::Dir),
];

/// Identifier of a run; also the name of its directory under the run root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// `<YYYYMMDD_HHMMSS>_<6 hex>_<experiment>`, e.g. `20260104_081530_a1b2c3_smoke`.
    #[must_use]
    pub fn generate(experiment_name: &str) -> Self {
        let ts = Utc::now().format("%Y%m%d_%H%M%S");
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{ts}_{}_{}", &suffix[..6], slug(experiment_name)))
    }

    /// Caller-chosen prefix, e.g. a fixed id for CI. Still suffixed with the
    /// experiment name.
    pub fn with_prefix(prefix: &str, experiment_name: &str) -> RunResult<Self> {
        let id = Self(format!("{prefix}_{}", slug(experiment_name)));
        id.validate().map_err(|reason| RunError::creation(PathBuf::from(prefix), reason))?;
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(&self) -> Result<(), String> {
        let id = self.0.as_str();
        if id.is_empty() {
            return Err("run id is empty".to_string());
        }
        if id.starts_with('.') {
            return Err(format!("run id `{id}` must not start with '.'"));
        }
        if id.contains(['/', '\\']) || id == ".." {
            return Err(format!("run id `{id}` must not contain path separators"));
        }
        Ok(())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Keep `[A-Za-z0-9_-]`, map everything else to `-`.
fn slug(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let safe = safe.trim_matches('-');
    if safe.is_empty() { "run".to_string() } else { safe.to_string() }
}

/// Handle to one run's directory. Threaded explicitly through every
/// operation that reads or writes run state.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    run_id: RunId,
    layout_version: u32,
    root_path: PathBuf,
    config_sha256: String,
}

impl RunDirectory {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn layout_version(&self) -> u32 {
        self.layout_version
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// SHA-256 of `config.resolved.yaml` as of creation (or open).
    pub fn config_sha256(&self) -> &str {
        &self.config_sha256
    }

    pub fn config_path(&self) -> PathBuf {
        self.root_path.join(CONFIG_FILE)
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root_path.join(META_DIR)
    }

    pub fn provenance_path(&self) -> PathBuf {
        self.root_path.join(PROVENANCE_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root_path.join(MANIFEST_FILE)
    }

    pub fn resumes_path(&self) -> PathBuf {
        self.root_path.join(RESUMES_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root_path.join(LOGS_DIR)
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.root_path.join(METRICS_FILE)
    }

    pub fn ckpts_dir(&self) -> PathBuf {
        self.root_path.join(CKPTS_DIR)
    }

    pub fn ckpt_last_dir(&self) -> PathBuf {
        self.root_path.join(CKPT_LAST_DIR)
    }

    pub fn ckpt_best_dir(&self) -> PathBuf {
        self.root_path.join(CKPT_BEST_DIR)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root_path.join(ARTIFACTS_DIR)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root_path.join(LOCK_FILE)
    }

    /// Required entries that are absent or of the wrong kind.
    pub fn missing_entries(&self) -> Vec<&'static str> {
        missing_entries(&self.root_path)
    }

    /// Re-hash `config.resolved.yaml` and fail if it no longer matches the
    /// hash taken when this handle was created.
    pub fn verify_config_snapshot(&self) -> RunResult<()> {
        let current = sha256_file(&self.config_path())
            .map_err(|e| RunError::not_found(&self.root_path, format!("{CONFIG_FILE}: {e}")))?;
        if current != self.config_sha256 {
            return Err(RunError::not_found(
                &self.root_path,
                format!("{CONFIG_FILE} changed after creation (expected sha256 {}, found {current})", self.config_sha256),
            ));
        }
        Ok(())
    }
}

fn missing_entries(run_dir: &Path) -> Vec<&'static str> {
    REQUIRED_ENTRIES
        .iter()
        .filter(|(rel, kind)| {
            let path = run_dir.join(rel);
            match kind {
                EntryKind::File => !path.is_file(),
                EntryKind::Dir => !path.is_dir(),
            }
        })
        .map(|(rel, _)| *rel)
        .collect()
}

/// Creates and re-attaches run directories under one run root.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a run with a generated id.
    pub fn create(&self, config: &ResolvedConfig) -> RunResult<RunDirectory> {
        self.create_with_prefix(config, None)
    }

    /// Create a run. With `Some(prefix)` the id is fixed and a collision fails
    /// immediately; otherwise generated ids are retried a few times.
    pub fn create_with_prefix(&self, config: &ResolvedConfig, prefix: Option<&str>) -> RunResult<RunDirectory> {
        let yaml = config.to_yaml()?;
        if yaml.trim().is_empty() {
            return Err(RunError::creation(&self.root, "resolved config serialized to an empty document"));
        }
        let experiment = config.get_str("run.experiment_name").unwrap_or("run");

        fs::create_dir_all(&self.root)
            .map_err(|e| RunError::creation(&self.root, format!("cannot create run root: {e}")))?;

        let attempts = if prefix.is_some() { 1 } else { MAX_ID_ATTEMPTS };
        for attempt in 1..=attempts {
            let run_id = match prefix {
                Some(p) => RunId::with_prefix(p, experiment)?,
                None => RunId::generate(experiment),
            };
            let target = self.root.join(run_id.as_str());
            if target.exists() {
                debug!(run_id = %run_id, attempt, "run id already taken");
                continue;
            }

            let staging = self.root.join(format!(".staging-{}", Uuid::new_v4().simple()));
            if let Err(e) = build_skeleton(&staging, yaml.as_bytes()) {
                discard(&staging);
                return Err(RunError::creation(&self.root, format!("cannot build run skeleton: {e}")));
            }
            // rename(2) silently replaces an empty directory, so check again.
            if target.exists() {
                discard(&staging);
                continue;
            }
            if let Err(e) = fs::rename(&staging, &target) {
                discard(&staging);
                return Err(RunError::creation(&self.root, format!("cannot publish {}: {e}", target.display())));
            }
            sync_dir(&self.root);

            let config_sha256 = sha256_file(&target.join(CONFIG_FILE))?;
            info!(run_id = %run_id, run_dir = %target.display(), "created run directory");
            return Ok(RunDirectory { run_id, layout_version: LAYOUT_VERSION, root_path: target, config_sha256 });
        }

        Err(RunError::creation(&self.root, format!("run id collision after {attempts} attempt(s)")))
    }

    /// Re-attach to an existing run for resume.
    pub fn open(&self, run_id: &str) -> RunResult<RunDirectory> {
        let id = RunId(run_id.to_string());
        let run_dir = self.root.join(run_id);
        id.validate().map_err(|reason| RunError::not_found(&run_dir, reason))?;
        if !run_dir.is_dir() {
            return Err(RunError::not_found(&run_dir, "run directory does not exist"));
        }

        let missing = missing_entries(&run_dir);
        if !missing.is_empty() {
            return Err(RunError::not_found(&run_dir, format!("missing required entries: {}", missing.join(", "))));
        }

        let layout_version = read_layout_version(&run_dir, &id)?;
        let config_sha256 = sha256_file(&run_dir.join(CONFIG_FILE))?;
        debug!(run_id = %id, "opened run directory");
        Ok(RunDirectory { run_id: id, layout_version, root_path: run_dir, config_sha256 })
    }

    /// Open a run given its directory path rather than root + id.
    pub fn open_dir(run_dir: &Path) -> RunResult<RunDirectory> {
        let (Some(parent), Some(name)) = (run_dir.parent(), run_dir.file_name().and_then(|n| n.to_str())) else {
            return Err(RunError::not_found(run_dir, "not a run directory path"));
        };
        Self::new(parent).open(name)
    }
}

#[derive(Deserialize)]
struct LayoutStamp {
    layout_version: u32,
    run_id: String,
}

fn read_layout_version(run_dir: &Path, id: &RunId) -> RunResult<u32> {
    let path = run_dir.join(PROVENANCE_FILE);
    let bytes = fs::read(&path)?;
    let stamp: LayoutStamp = serde_json::from_slice(&bytes)
        .map_err(|e| RunError::not_found(run_dir, format!("{PROVENANCE_FILE} is unreadable: {e}")))?;
    if stamp.layout_version != LAYOUT_VERSION {
        return Err(RunError::not_found(
            run_dir,
            format!("unsupported layout_version {} (expected {LAYOUT_VERSION})", stamp.layout_version),
        ));
    }
    if stamp.run_id != id.0 {
        return Err(RunError::not_found(
            run_dir,
            format!("{PROVENANCE_FILE} belongs to run `{}`", stamp.run_id),
        ));
    }
    Ok(stamp.layout_version)
}

fn build_skeleton(staging: &Path, config_yaml: &[u8]) -> std::io::Result<()> {
    fs::create_dir(staging)?;
    write_new(&staging.join(CONFIG_FILE), config_yaml)?;
    for dir in [META_DIR, LOGS_DIR, CKPTS_DIR, CKPT_LAST_DIR, ARTIFACTS_DIR] {
        fs::create_dir(staging.join(dir))?;
    }
    write_new(&staging.join(METRICS_FILE), b"")?;
    Ok(())
}

fn discard(staging: &Path) {
    if let Err(e) = fs::remove_dir_all(staging) {
        warn!(path = %staging.display(), error = %e, "failed to remove staging directory");
    }
}

/// Write a file that must not already exist, and flush it to disk.
pub(crate) fn write_new(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Replace `path` atomically: write a sibling temp file, fsync, rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("file");
    let tmp = parent.join(format!(".{name}.{}.tmp", Uuid::new_v4().simple()));
    if let Err(e) = write_new(&tmp, bytes).and_then(|()| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    sync_dir(parent);
    Ok(())
}

/// Publish a file that must not already exist, all at once: the bytes go to a
/// synced sibling temp file that is then hard-linked to `path`. Linking never
/// replaces an existing file, so a second writer gets `AlreadyExists` and a
/// crash never leaves a partial file under the final name.
pub(crate) fn publish_new(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if path.exists() {
        return Err(std::io::Error::new(ErrorKind::AlreadyExists, format!("{} already exists", path.display())));
    }
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("file");
    let tmp = parent.join(format!(".{name}.{}.tmp", Uuid::new_v4().simple()));
    let published = write_new(&tmp, bytes).and_then(|()| fs::hard_link(&tmp, path));
    let _ = fs::remove_file(&tmp);
    published?;
    sync_dir(parent);
    Ok(())
}

/// Best effort: directories cannot be opened for sync on every platform.
pub(crate) fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockHolder {
    pid: u32,
    acquired_at_utc: String,
}

/// Cooperative single-writer lock: `run.lock` inside the run directory.
/// Removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(run: &RunDirectory) -> RunResult<Self> {
        let path = run.lock_path();
        let holder = LockHolder { pid: std::process::id(), acquired_at_utc: clock::utc_now() };
        match write_new(&path, &serde_json::to_vec(&holder)?) {
            Ok(()) => {
                debug!(run_id = %run.run_id(), pid = holder.pid, "acquired run lock");
                Ok(Self { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                Err(RunError::RunLocked {
                    run_dir: run.root_path().to_path_buf(),
                    holder: if holder.trim().is_empty() { "unknown holder".to_string() } else { holder.trim().to_string() },
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a lock left behind by a crashed process. Returns whether a lock
    /// file was present.
    pub fn force_release(run: &RunDirectory) -> RunResult<bool> {
        match fs::remove_file(run.lock_path()) {
            Ok(()) => {
                warn!(run_id = %run.run_id(), "removed stale run lock");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}
