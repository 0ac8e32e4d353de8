//! End-to-end tests for run creation, provenance, metrics, checkpoints and resume.

use diffusion_core::layout::PROVENANCE_FILE;
use diffusion_core::provenance::MIN_SHA_LEN;
use diffusion_core::{
    clock, read_events, read_manifest, read_resumes, resume_run, stamp, start_run, validate_provenance_file,
    BackendInfo, CheckpointManager, ConfigResolver, CpuBackend, DeterminismController, EnvInfo, GitInfo, GitSource,
    ManifestKind, Override, ProgressEvent, ProgressSink, ResumeRequest, RunError, RunLayout, RunLock, SmokeLoop,
    SmokeOutcome, StartRequest, Tolerance,
};
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use tempfile::TempDir;

#[derive(Default)]
struct RecordingSink(Mutex<Vec<ProgressEvent>>);

impl ProgressSink for RecordingSink {
    fn on_event(&self, event: ProgressEvent) {
        self.0.lock().unwrap().push(event);
    }
}

impl RecordingSink {
    fn steps(&self) -> Vec<u64> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Step { step, .. } => Some(*step),
                _ => None,
            })
            .collect()
    }
}

fn start_request(dir: &Path, yaml: &str, prefix: Option<&str>) -> StartRequest {
    let config_path = dir.join(format!("{}.yaml", prefix.unwrap_or("smoke")));
    std::fs::write(&config_path, yaml).unwrap();
    StartRequest {
        config_path,
        overrides: Vec::new(),
        run_root: Some(dir.join("runs")),
        run_id_prefix: prefix.map(str::to_string),
        argv: vec!["diffusion-core".to_string(), "smoke".to_string()],
        cwd: dir.to_path_buf(),
        allow_untracked: true,
    }
}

fn resume_request(dir: &Path, run_id: &str) -> ResumeRequest {
    ResumeRequest {
        run_root: dir.join("runs"),
        run_id: run_id.to_string(),
        argv: vec!["diffusion-core".to_string(), "resume".to_string()],
        cwd: dir.to_path_buf(),
        allow_untracked: true,
    }
}

fn run_to_end(dir: &Path, yaml: &str, prefix: &str) -> SmokeOutcome {
    let session = start_run(&start_request(dir, yaml, Some(prefix)), &CpuBackend).unwrap();
    SmokeLoop::new(&session, &RecordingSink::default()).run().unwrap()
}

fn tolerance_for(seed: u64) -> Tolerance {
    DeterminismController::seeded(seed, &CpuBackend, false).tolerance()
}

const CONFIG: &str = "seed: 1234\ntrainer:\n  max_steps: 10\ncheckpoint:\n  every_steps: 3\n";

#[test]
fn test_required_entries_exist_before_first_step() {
    let temp = TempDir::new().unwrap();
    let session = start_run(&start_request(temp.path(), CONFIG, None), &CpuBackend).unwrap();
    let run = session.run();

    assert!(run.missing_entries().is_empty(), "{:?}", run.missing_entries());
    assert!(run.lock_path().is_file());
    assert!(read_events(run).unwrap().is_empty());
    assert!(CheckpointManager::for_run(run).load().unwrap().is_none());
}

#[test]
fn test_config_snapshot_hash_is_stable_across_the_run() {
    let temp = TempDir::new().unwrap();
    let session = start_run(&start_request(temp.path(), CONFIG, None), &CpuBackend).unwrap();
    let before = session.run().config_sha256().to_string();
    SmokeLoop::new(&session, &RecordingSink::default()).run().unwrap();

    session.run().verify_config_snapshot().unwrap();
    let manifest = read_manifest(session.run()).unwrap().unwrap();
    let config_entry = manifest.entries.iter().find(|e| e.kind == ManifestKind::Config).unwrap();
    assert_eq!(config_entry.sha256, before);
    assert_eq!(session.provenance().config.resolved_sha256, before);
}

#[test]
fn test_provenance_fields_are_complete() {
    let temp = TempDir::new().unwrap();
    let session = start_run(&start_request(temp.path(), CONFIG, None), &CpuBackend).unwrap();
    let path = session.run().root_path().join(PROVENANCE_FILE);

    let record = validate_provenance_file(&path).unwrap();
    assert_eq!(record.run_id, session.run().run_id().as_str());
    assert!(record.git.repo_sha.len() >= MIN_SHA_LEN);
    assert!(record.created_at_utc.ends_with('Z'));
    assert!(clock::parse_utc(&record.created_at_utc).is_some());
    assert!(!record.command.argv.is_empty());
    assert_eq!(record.env.language, "rust");
    assert_eq!(record.env.numeric_backend.name, "cpu-f64");
    assert_eq!(record.rng.seed, 1234);
}

#[test]
fn test_provenance_is_written_once() {
    let temp = TempDir::new().unwrap();
    let session = start_run(&start_request(temp.path(), CONFIG, None), &CpuBackend).unwrap();
    let original = std::fs::read(session.run().provenance_path()).unwrap();

    let err = stamp(
        session.run(),
        &["again".to_string()],
        temp.path(),
        GitInfo::placeholder(),
        EnvInfo::capture(BackendInfo::of(&CpuBackend)),
        0,
    )
    .unwrap_err();
    assert!(matches!(err, RunError::Provenance(_)), "{err}");
    assert_eq!(std::fs::read(session.run().provenance_path()).unwrap(), original);

    let leftovers: Vec<String> = std::fs::read_dir(session.run().meta_dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[test]
fn test_edited_config_fails_provenance_validation() {
    let temp = TempDir::new().unwrap();
    let session = start_run(&start_request(temp.path(), CONFIG, None), &CpuBackend).unwrap();
    let config_path = session.run().config_path();
    let mut text = std::fs::read_to_string(&config_path).unwrap();
    text.push_str("# edited\n");
    std::fs::write(&config_path, text).unwrap();

    let err = validate_provenance_file(&session.run().provenance_path()).unwrap_err();
    assert!(err.to_string().contains("resolved_sha256"), "{err}");
    assert!(session.run().verify_config_snapshot().is_err());
}

#[test]
fn test_lockfile_is_recorded_and_verified() {
    let temp = TempDir::new().unwrap();
    let lockfile = temp.path().join("Cargo.lock");
    std::fs::write(&lockfile, "version = 3\n").unwrap();
    let session = start_run(&start_request(temp.path(), CONFIG, None), &CpuBackend).unwrap();

    let recorded = session.provenance().env.lockfile.clone().unwrap();
    assert_eq!(recorded.path, lockfile.display().to_string());
    validate_provenance_file(&session.run().provenance_path()).unwrap();

    std::fs::write(&lockfile, "version = 4\n").unwrap();
    let err = validate_provenance_file(&session.run().provenance_path()).unwrap_err();
    assert!(err.to_string().contains("env.lockfile.sha256 mismatch"), "{err}");
}

#[test]
fn test_untracked_run_without_lockfile_records_none() {
    let temp = TempDir::new().unwrap();
    let session = start_run(&start_request(temp.path(), CONFIG, None), &CpuBackend).unwrap();
    assert!(session.provenance().env.lockfile.is_none());
    validate_provenance_file(&session.run().provenance_path()).unwrap();
}

#[test]
fn test_identical_config_and_seed_reproduce() {
    let temp = TempDir::new().unwrap();
    let a = run_to_end(temp.path(), CONFIG, "a");
    let b = run_to_end(temp.path(), CONFIG, "b");

    assert_eq!(a.final_step, b.final_step);
    assert_eq!(a.final_step, Some(9));
    let ctl = DeterminismController::seeded(1234, &CpuBackend, true);
    if let Some(reason) = ctl.strict_unsupported_reason() {
        eprintln!("skipping exact comparison: {reason}");
        assert!(tolerance_for(1234).matches(a.scalar, b.scalar));
    } else {
        assert_eq!(a.scalar.to_bits(), b.scalar.to_bits());
    }
}

#[test]
fn test_different_seeds_diverge() {
    let temp = TempDir::new().unwrap();
    let a = run_to_end(temp.path(), CONFIG, "a");
    let b = run_to_end(temp.path(), &CONFIG.replace("1234", "4321"), "b");
    assert_ne!(a.scalar.to_bits(), b.scalar.to_bits());
}

#[test]
fn test_resume_continues_after_checkpoint_and_matches_reference() {
    let temp = TempDir::new().unwrap();
    let reference = run_to_end(temp.path(), CONFIG, "reference");

    let session = start_run(&start_request(temp.path(), CONFIG, Some("interrupted")), &CpuBackend).unwrap();
    let run_id = session.run().run_id().to_string();
    let first = SmokeLoop::new(&session, &RecordingSink::default()).stop_after(4).run().unwrap();
    assert!(!first.completed);
    assert_eq!(first.final_step, Some(4));
    drop(session);

    let resumed = resume_run(&resume_request(temp.path(), &run_id), &CpuBackend).unwrap();
    assert_eq!(resumed.resumed_from().map(|s| s.step), Some(4));
    assert_eq!(resumed.start_step(), 5);

    let sink = RecordingSink::default();
    let outcome = SmokeLoop::new(&resumed, &sink).run().unwrap();
    assert_eq!(sink.steps().first(), Some(&5));
    assert_eq!(outcome.final_step, reference.final_step);
    assert_eq!(outcome.steps_run, 5);
    assert!(tolerance_for(1234).matches(outcome.scalar, reference.scalar));

    let steps: Vec<u64> = read_events(resumed.run()).unwrap().iter().map(|e| e.step).collect();
    assert_eq!(steps, (0..10).collect::<Vec<_>>());

    let resumes = read_resumes(resumed.run()).unwrap();
    assert_eq!(resumes.len(), 1);
    assert_eq!(resumes[0].from_step, Some(4));
}

#[test]
fn test_resume_replays_steps_logged_after_last_checkpoint() {
    let temp = TempDir::new().unwrap();
    let session = start_run(&start_request(temp.path(), CONFIG, Some("crashy")), &CpuBackend).unwrap();
    let run_id = session.run().run_id().to_string();
    // The early stop checkpoints step 4.
    SmokeLoop::new(&session, &RecordingSink::default()).stop_after(4).run().unwrap();
    drop(session);

    // Simulate a crash after step 6 was logged but before it was checkpointed.
    let metrics = temp.path().join("runs").join(&run_id).join("logs").join("metrics.jsonl");
    let mut text = std::fs::read_to_string(&metrics).unwrap();
    text.push_str("{\"step\":5,\"time\":1.0,\"scalar\":0.0}\n{\"step\":6,\"time\":1.0,\"scalar\":0.0}\n");
    std::fs::write(&metrics, text).unwrap();

    let resumed = resume_run(&resume_request(temp.path(), &run_id), &CpuBackend).unwrap();
    let outcome = SmokeLoop::new(&resumed, &RecordingSink::default()).run().unwrap();
    assert_eq!(outcome.final_step, Some(9));
    assert_eq!(outcome.steps_run, 5);

    let steps: Vec<u64> = read_events(resumed.run()).unwrap().iter().map(|e| e.step).collect();
    assert_eq!(steps, (0..10).collect::<Vec<_>>());
    assert!(steps.windows(2).all(|w| w[0] <= w[1]), "{steps:?}");
}

#[test]
fn test_resume_without_checkpoint_does_not_relog_steps() {
    let temp = TempDir::new().unwrap();
    let session = start_run(&start_request(temp.path(), CONFIG, Some("early")), &CpuBackend).unwrap();
    let run_id = session.run().run_id().to_string();
    drop(session);

    // Crash before the first checkpoint, with steps 0 and 1 already logged.
    let metrics = temp.path().join("runs").join(&run_id).join("logs").join("metrics.jsonl");
    std::fs::write(&metrics, "{\"step\":0,\"time\":0.5}\n{\"step\":1,\"time\":0.9}\n").unwrap();

    let resumed = resume_run(&resume_request(temp.path(), &run_id), &CpuBackend).unwrap();
    assert_eq!(resumed.start_step(), 0);
    let sink = RecordingSink::default();
    SmokeLoop::new(&resumed, &sink).run().unwrap();
    assert_eq!(sink.steps(), (0..10).collect::<Vec<_>>());

    let steps: Vec<u64> = read_events(resumed.run()).unwrap().iter().map(|e| e.step).collect();
    assert_eq!(steps, (0..10).collect::<Vec<_>>());
}

#[test]
fn test_resume_after_torn_metrics_line() {
    let temp = TempDir::new().unwrap();
    let reference = run_to_end(temp.path(), CONFIG, "whole");

    let session = start_run(&start_request(temp.path(), CONFIG, Some("torn")), &CpuBackend).unwrap();
    let run_id = session.run().run_id().to_string();
    SmokeLoop::new(&session, &RecordingSink::default()).stop_after(4).run().unwrap();
    drop(session);

    let metrics = temp.path().join("runs").join(&run_id).join("logs").join("metrics.jsonl");
    let mut text = std::fs::read_to_string(&metrics).unwrap();
    text.push_str("{\"step\":5,\"ti");
    std::fs::write(&metrics, text).unwrap();

    let resumed = resume_run(&resume_request(temp.path(), &run_id), &CpuBackend).unwrap();
    let outcome = SmokeLoop::new(&resumed, &RecordingSink::default()).run().unwrap();
    assert!(tolerance_for(1234).matches(outcome.scalar, reference.scalar));

    let steps: Vec<u64> = read_events(resumed.run()).unwrap().iter().map(|e| e.step).collect();
    assert_eq!(steps, (0..10).collect::<Vec<_>>());
    assert!(std::fs::read_to_string(&metrics).unwrap().ends_with('\n'));
}

#[test]
fn test_resume_rejects_missing_run() {
    let temp = TempDir::new().unwrap();
    let err = resume_run(&resume_request(temp.path(), "does-not-exist"), &CpuBackend).err().unwrap();
    assert!(matches!(err, RunError::RunNotFound { .. }), "{err}");
}

#[test]
fn test_resume_rejects_run_missing_required_entry() {
    let temp = TempDir::new().unwrap();
    let session = start_run(&start_request(temp.path(), CONFIG, Some("broken")), &CpuBackend).unwrap();
    let run_id = session.run().run_id().to_string();
    std::fs::remove_dir_all(session.run().artifacts_dir()).unwrap();
    drop(session);

    let err = resume_run(&resume_request(temp.path(), &run_id), &CpuBackend).err().unwrap();
    assert!(err.to_string().contains("artifacts"), "{err}");
}

#[test]
fn test_second_lock_holder_is_rejected() {
    let temp = TempDir::new().unwrap();
    let session = start_run(&start_request(temp.path(), CONFIG, None), &CpuBackend).unwrap();
    let err = RunLock::acquire(session.run()).unwrap_err();
    assert!(matches!(err, RunError::RunLocked { .. }), "{err}");

    let run = session.run().clone();
    drop(session);
    assert!(!run.lock_path().exists());
    drop(RunLock::acquire(&run).unwrap());
    assert!(!RunLock::force_release(&run).unwrap());
}

#[test]
fn test_run_id_prefix_collision_fails() {
    let temp = TempDir::new().unwrap();
    let first = start_run(&start_request(temp.path(), CONFIG, Some("fixed")), &CpuBackend).unwrap();
    let err = start_run(&start_request(temp.path(), CONFIG, Some("fixed")), &CpuBackend).err().unwrap();
    assert!(matches!(err, RunError::RunCreation { .. }), "{err}");
    assert!(first.run().provenance_path().is_file());
}

#[test]
fn test_layout_open_round_trips_handle() {
    let temp = TempDir::new().unwrap();
    let session = start_run(&start_request(temp.path(), CONFIG, None), &CpuBackend).unwrap();
    let opened = RunLayout::new(temp.path().join("runs")).open(session.run().run_id().as_str()).unwrap();
    assert_eq!(opened.run_id(), session.run().run_id());
    assert_eq!(opened.config_sha256(), session.run().config_sha256());

    let by_dir = RunLayout::open_dir(session.run().root_path()).unwrap();
    assert_eq!(by_dir.root_path(), session.run().root_path());
}

#[test]
fn test_overrides_reach_the_snapshot() {
    let temp = TempDir::new().unwrap();
    let mut request = start_request(temp.path(), CONFIG, None);
    request.overrides = vec![Override::parse("trainer.max_steps=2").unwrap()];
    let session = start_run(&request, &CpuBackend).unwrap();

    let snapshot = ConfigResolver::application().load(&session.run().config_path(), &[]).unwrap();
    assert_eq!(snapshot.get_u64("trainer.max_steps").unwrap(), 2);
    let outcome = SmokeLoop::new(&session, &RecordingSink::default()).run().unwrap();
    assert_eq!(outcome.final_step, Some(1));
}

fn git_available() -> bool {
    Command::new("git").arg("--version").output().is_ok_and(|o| o.status.success())
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git").args(args).current_dir(dir).status().unwrap();
    assert!(status.success(), "git {args:?} failed");
}

#[test]
fn test_git_capture_in_repository() {
    if !git_available() {
        eprintln!("skipping: git is not installed");
        return;
    }
    let temp = TempDir::new().unwrap();
    git(temp.path(), &["init", "-q"]);
    git(temp.path(), &["config", "user.email", "runs@example.com"]);
    git(temp.path(), &["config", "user.name", "Runs"]);
    std::fs::write(temp.path().join("train.txt"), "v1").unwrap();
    git(temp.path(), &["add", "train.txt"]);
    git(temp.path(), &["commit", "-q", "-m", "init"]);

    let clean = GitInfo::capture(temp.path()).unwrap();
    assert_eq!(clean.source, GitSource::Git);
    assert_eq!(clean.repo_sha.len(), 40);
    assert!(!clean.is_dirty);

    std::fs::write(temp.path().join("train.txt"), "v2").unwrap();
    assert!(GitInfo::capture(temp.path()).unwrap().is_dirty);
}

#[test]
fn test_tracked_run_requires_lockfile() {
    if !git_available() {
        eprintln!("skipping: git is not installed");
        return;
    }
    let temp = TempDir::new().unwrap();
    git(temp.path(), &["init", "-q"]);
    git(temp.path(), &["config", "user.email", "runs@example.com"]);
    git(temp.path(), &["config", "user.name", "Runs"]);
    std::fs::write(temp.path().join("train.txt"), "v1").unwrap();
    git(temp.path(), &["add", "train.txt"]);
    git(temp.path(), &["commit", "-q", "-m", "init"]);

    let mut request = start_request(temp.path(), CONFIG, None);
    request.allow_untracked = false;
    let err = start_run(&request, &CpuBackend).err().unwrap();
    assert!(matches!(err, RunError::Provenance(_)), "{err}");
    assert!(err.to_string().contains("Cargo.lock"), "{err}");
    assert!(!temp.path().join("runs").exists());

    std::fs::write(temp.path().join("Cargo.lock"), "version = 3\n").unwrap();
    let session = start_run(&request, &CpuBackend).unwrap();
    assert_eq!(session.provenance().git.source, GitSource::Git);
    assert!(session.provenance().env.lockfile.as_ref().unwrap().path.ends_with("Cargo.lock"));
}

#[test]
fn test_git_capture_outside_repository_fails_unless_allowed() {
    if !git_available() {
        eprintln!("skipping: git is not installed");
        return;
    }
    let temp = TempDir::new().unwrap();
    if GitInfo::capture(temp.path()).is_ok() {
        eprintln!("skipping: temp dir is inside a git repository");
        return;
    }

    let mut request = start_request(temp.path(), CONFIG, None);
    request.allow_untracked = false;
    let err = start_run(&request, &CpuBackend).err().unwrap();
    assert!(matches!(err, RunError::Provenance(_)), "{err}");
    assert!(!temp.path().join("runs").exists());

    request.allow_untracked = true;
    let session = start_run(&request, &CpuBackend).unwrap();
    assert_eq!(session.provenance().git.source, GitSource::Placeholder);
}
