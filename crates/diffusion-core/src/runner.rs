//! Run sessions: start or resume a run and drive the smoke loop through it.
//!
//! A [`RunSession`] owns the run lock for its lifetime. Everything a step
//! touches (metrics, checkpoints, random streams) is reached through the
//! session, never through process-wide state.

use crate::checkpoint::{CheckpointManager, CheckpointState};
use crate::clock;
use crate::config::{ConfigResolver, Override, ResolvedConfig, RunSettings};
use crate::determinism::{BackendInfo, DeterminismController, NumericBackend};
use crate::error::{RunError, RunResult};
use crate::layout::{RunDirectory, RunLayout, RunLock};
use crate::manifest::{sha256_file, write_manifest};
use crate::metrics::{append_json_line, ClockBasis, MetricsLogger};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::provenance::{
    read_provenance, repository_root, stamp, EnvInfo, GitInfo, GitSource, LockfileRef, ProvenanceRecord, LOCKFILE_NAME,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the checkpoint blob holding [`SmokeState`].
pub const SMOKE_STATE_BLOB: &str = "smoke_state";

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub config_path: PathBuf,
    pub overrides: Vec<Override>,
    /// Replaces `run.run_root` from the config when set.
    pub run_root: Option<PathBuf>,
    /// Fixed run id prefix; a collision fails instead of retrying.
    pub run_id_prefix: Option<String>,
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    /// Record placeholder git metadata instead of failing outside a repository.
    pub allow_untracked: bool,
}

#[derive(Debug, Clone)]
pub struct ResumeRequest {
    pub run_root: PathBuf,
    pub run_id: String,
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub allow_untracked: bool,
}

/// One line of `meta/resumes.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeEvent {
    pub resumed_at_utc: String,
    /// Step of the checkpoint resumed from; `None` restarts at step 0.
    pub from_step: Option<u64>,
    pub argv: Vec<String>,
    pub cwd: String,
    pub repo_sha: String,
}

/// State carried across a checkpoint by the smoke loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmokeState {
    pub step: u64,
    pub scalar: f64,
}

pub struct RunSession {
    run: RunDirectory,
    config: ResolvedConfig,
    settings: RunSettings,
    provenance: ProvenanceRecord,
    determinism: DeterminismController,
    is_resume: bool,
    resumed_from: Option<SmokeState>,
    _lock: RunLock,
}

impl RunSession {
    pub fn run(&self) -> &RunDirectory {
        &self.run
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn provenance(&self) -> &ProvenanceRecord {
        &self.provenance
    }

    pub fn determinism(&self) -> &DeterminismController {
        &self.determinism
    }

    pub fn is_resume(&self) -> bool {
        self.is_resume
    }

    /// Checkpointed state this session continues from.
    pub fn resumed_from(&self) -> Option<SmokeState> {
        self.resumed_from
    }

    /// First step this session executes.
    pub fn start_step(&self) -> u64 {
        self.resumed_from.map_or(0, |s| s.step + 1)
    }
}

fn capture_git(cwd: &Path, allow_untracked: bool) -> RunResult<GitInfo> {
    match GitInfo::capture(cwd) {
        Ok(git) => Ok(git),
        Err(e) if allow_untracked => {
            warn!(error = %e, "recording placeholder git metadata");
            Ok(GitInfo::placeholder())
        }
        Err(e) => Err(e),
    }
}

/// The lockfile at the repository root, else in `cwd`. Missing is an error
/// unless untracked runs are allowed.
fn capture_lockfile(cwd: &Path, allow_untracked: bool) -> RunResult<Option<LockfileRef>> {
    let mut dirs: Vec<PathBuf> = repository_root(cwd).into_iter().collect();
    dirs.push(cwd.to_path_buf());
    match LockfileRef::locate(&dirs)? {
        Some(lockfile) => Ok(Some(lockfile)),
        None if allow_untracked => {
            warn!(cwd = %cwd.display(), "no {LOCKFILE_NAME} found; dependencies are not recorded");
            Ok(None)
        }
        None => Err(RunError::Provenance(format!(
            "env.lockfile: no {LOCKFILE_NAME} at the repository root or in {}",
            cwd.display()
        ))),
    }
}

/// Resolve the config, create and stamp a new run, and take its lock.
///
/// Config, git and lockfile problems are reported before anything is written. If
/// stamping fails the freshly created run directory is removed again.
pub fn start_run(request: &StartRequest, backend: &dyn NumericBackend) -> RunResult<RunSession> {
    let mut config = ConfigResolver::application().load(&request.config_path, &request.overrides)?;
    if let Some(root) = &request.run_root {
        config = config.with_override("run.run_root", root.display().to_string())?;
    }
    let settings = RunSettings::from_config(&config)?;
    let git = capture_git(&request.cwd, request.allow_untracked)?;
    let lockfile = capture_lockfile(&request.cwd, request.allow_untracked)?;
    let determinism = DeterminismController::seeded(settings.seed, backend, settings.strict_determinism);

    let layout = RunLayout::new(request.cwd.join(&settings.run_root));
    let run = layout.create_with_prefix(&config, request.run_id_prefix.as_deref())?;
    let lock = RunLock::acquire(&run)?;

    let env = EnvInfo::capture(BackendInfo::of(backend)).with_lockfile(lockfile);
    let provenance = match stamp(&run, &request.argv, &request.cwd, git, env, settings.seed) {
        Ok(record) => record,
        Err(e) => {
            drop(lock);
            if let Err(cleanup) = std::fs::remove_dir_all(run.root_path()) {
                warn!(run_dir = %run.root_path().display(), error = %cleanup, "failed to remove unstamped run");
            }
            return Err(e);
        }
    };

    info!(run_id = %run.run_id(), run_dir = %run.root_path().display(), "run started");
    Ok(RunSession { run, config, settings, provenance, determinism, is_resume: false, resumed_from: None, _lock: lock })
}

/// Re-attach to an existing run and position it after its last checkpoint.
pub fn resume_run(request: &ResumeRequest, backend: &dyn NumericBackend) -> RunResult<RunSession> {
    let run = RunLayout::new(&request.run_root).open(&request.run_id)?;
    let lock = RunLock::acquire(&run)?;
    run.verify_config_snapshot()?;

    let config = ConfigResolver::application().load(&run.config_path(), &[])?;
    let settings = RunSettings::from_config(&config)?;
    let provenance = read_provenance(&run)?;
    let determinism = DeterminismController::seeded(settings.seed, backend, settings.strict_determinism);

    let resumed_from = match CheckpointManager::for_run(&run).load()? {
        Some(record) => Some(record.read_json::<SmokeState>(SMOKE_STATE_BLOB)?),
        None => {
            warn!(run_id = %run.run_id(), "no checkpoint published; restarting at step 0");
            None
        }
    };

    let git = capture_git(&request.cwd, request.allow_untracked)?;
    if git.source == GitSource::Git && git.repo_sha != provenance.git.repo_sha {
        warn!(
            recorded = %provenance.git.repo_sha,
            current = %git.repo_sha,
            "resuming with a different code revision than the run was started with"
        );
    }
    if let Some(recorded) = &provenance.env.lockfile
        && sha256_file(Path::new(&recorded.path)).ok().as_deref() != Some(recorded.sha256.as_str())
    {
        warn!(path = %recorded.path, "resuming with a lockfile that differs from the one the run was started with");
    }
    let event = ResumeEvent {
        resumed_at_utc: clock::utc_now(),
        from_step: resumed_from.map(|s| s.step),
        argv: request.argv.clone(),
        cwd: request.cwd.display().to_string(),
        repo_sha: git.repo_sha,
    };
    record_resume(&run, &event)?;

    info!(run_id = %run.run_id(), from_step = ?event.from_step, "run resumed");
    Ok(RunSession { run, config, settings, provenance, determinism, is_resume: true, resumed_from, _lock: lock })
}

fn record_resume(run: &RunDirectory, event: &ResumeEvent) -> RunResult<()> {
    let path = run.resumes_path();
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    append_json_line(&mut file, event)?;
    debug!(path = %path.display(), "recorded resume");
    Ok(())
}

/// Every resume recorded for `run`, oldest first.
pub fn read_resumes(run: &RunDirectory) -> RunResult<Vec<ResumeEvent>> {
    let path = run.resumes_path();
    if !path.exists() {
        return Ok(Vec::new());
    }
    std::fs::read_to_string(&path)?
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(RunError::from))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmokeOutcome {
    /// Last step executed, across all sessions of the run.
    pub final_step: Option<u64>,
    pub scalar: f64,
    /// Steps executed by this session.
    pub steps_run: u64,
    /// `false` when the session stopped early.
    pub completed: bool,
}

/// Synthetic training loop: a seeded random walk stands in for a model so
/// the metrics, checkpoint and resume contracts can be exercised end to end.
pub struct SmokeLoop<'a> {
    session: &'a RunSession,
    sink: &'a dyn ProgressSink,
    stop_after: Option<u64>,
}

impl<'a> SmokeLoop<'a> {
    pub fn new(session: &'a RunSession, sink: &'a dyn ProgressSink) -> Self {
        Self { session, sink, stop_after: None }
    }

    /// End the session after this step has been checkpointed.
    #[must_use]
    pub fn stop_after(mut self, step: u64) -> Self {
        self.stop_after = Some(step);
        self
    }

    pub fn run(self) -> RunResult<SmokeOutcome> {
        let session = self.session;
        let run = session.run();
        let run_id = run.run_id().clone();
        let settings = session.settings();
        let max_steps = settings.max_steps;
        let every = settings.checkpoint_every;

        let basis = ClockBasis::from_setting(&settings.time_basis, &session.provenance().created_at_utc)?;
        let resumed = session.resumed_from();
        let mut metrics = if session.is_resume() {
            MetricsLogger::resume(run, basis, resumed.map(|s| s.step))?
        } else {
            MetricsLogger::open(run, basis)?
        };
        let checkpoints = CheckpointManager::for_run(run);

        let start = session.start_step();
        match resumed {
            Some(state) => self.sink.on_event(ProgressEvent::Resumed { run_id: run_id.clone(), from_step: state.step }),
            None => self.sink.on_event(ProgressEvent::Started { run_id: run_id.clone(), start_step: start, max_steps }),
        }

        let mut state = resumed.unwrap_or(SmokeState { step: 0, scalar: 0.0 });
        let mut final_step = resumed.map(|s| s.step);
        let mut steps_run = 0;
        let mut completed = true;

        for step in start..max_steps {
            let delta: f64 = session.determinism().rng_for("smoke", step).gen_range(-1.0..1.0);
            state = SmokeState { step, scalar: 0.5 * state.scalar + delta };

            if metrics.is_logged(step) {
                debug!(step, "step already in metrics log");
            } else {
                let event = metrics.event(step).with("scalar", state.scalar);
                metrics.append(&event)?;
            }
            self.sink.on_event(ProgressEvent::Step { run_id: run_id.clone(), step, total: max_steps });
            final_step = Some(step);
            steps_run += 1;

            let is_last = step + 1 == max_steps;
            let stopping = self.stop_after == Some(step) && !is_last;
            if is_last || stopping || (every > 0 && (step + 1) % every == 0) {
                let blob = CheckpointState::new().with_json(SMOKE_STATE_BLOB, &state)?;
                checkpoints.save(step, &blob)?;
                self.sink.on_event(ProgressEvent::Checkpoint { run_id: run_id.clone(), step });
            }
            if stopping {
                info!(run_id = %run_id, step, "stopping early");
                completed = false;
                break;
            }
        }

        write_manifest(run)?;
        self.sink.on_event(ProgressEvent::Finished { run_id, final_step });
        Ok(SmokeOutcome { final_step, scalar: state.scalar, steps_run, completed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::determinism::CpuBackend;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<ProgressEvent>>);

    impl ProgressSink for RecordingSink {
        fn on_event(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn request(temp: &TempDir, yaml: &str) -> StartRequest {
        let config_path = temp.path().join("smoke.yaml");
        std::fs::write(&config_path, yaml).unwrap();
        StartRequest {
            config_path,
            overrides: Vec::new(),
            run_root: Some(temp.path().join("runs")),
            run_id_prefix: None,
            argv: vec!["diffusion-core".to_string(), "smoke".to_string()],
            cwd: temp.path().to_path_buf(),
            allow_untracked: true,
        }
    }

    #[test]
    fn test_smoke_loop_emits_progress_and_checkpoints() {
        let temp = TempDir::new().unwrap();
        let session =
            start_run(&request(&temp, "trainer:\n  max_steps: 4\ncheckpoint:\n  every_steps: 2\n"), &CpuBackend)
                .unwrap();
        let sink = RecordingSink::default();
        let outcome = SmokeLoop::new(&session, &sink).run().unwrap();

        assert_eq!(outcome.final_step, Some(3));
        assert_eq!(outcome.steps_run, 4);
        assert!(outcome.completed);

        let events = sink.0.lock().unwrap();
        let checkpoints: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Checkpoint { step, .. } => Some(*step),
                _ => None,
            })
            .collect();
        assert_eq!(checkpoints, vec![1, 3]);
        assert!(matches!(events.first(), Some(ProgressEvent::Started { start_step: 0, .. })));
        assert!(matches!(events.last(), Some(ProgressEvent::Finished { final_step: Some(3), .. })));
    }

    #[test]
    fn test_second_session_on_same_run_is_locked_out() {
        let temp = TempDir::new().unwrap();
        let session = start_run(&request(&temp, "seed: 1\n"), &CpuBackend).unwrap();
        let resume = ResumeRequest {
            run_root: temp.path().join("runs"),
            run_id: session.run().run_id().to_string(),
            argv: vec!["diffusion-core".to_string(), "resume".to_string()],
            cwd: temp.path().to_path_buf(),
            allow_untracked: true,
        };
        let err = resume_run(&resume, &CpuBackend).err().unwrap();
        assert!(matches!(err, RunError::RunLocked { .. }), "{err}");

        drop(session);
        let resumed = resume_run(&resume, &CpuBackend).unwrap();
        assert_eq!(resumed.start_step(), 0);
        assert_eq!(read_resumes(resumed.run()).unwrap().len(), 1);
    }
}
