//! Provenance: ties a run to the code, invocation and environment that
//! produced it.
//!
//! `meta/provenance.json` is written exactly once, right after the run
//! directory is created and before the first step. Anything learned later
//! (resumes, for instance) goes to a separate file.

use crate::clock;
use crate::determinism::BackendInfo;
use crate::error::{RunError, RunResult};
use crate::layout::{publish_new, RunDirectory, LAYOUT_VERSION};
use crate::manifest::sha256_file;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Minimum length of an abbreviated commit SHA.
pub const MIN_SHA_LEN: usize = 7;

const PLACEHOLDER_SHA: &str = "0000000";

/// Dependency lockfile recorded under `env.lockfile`.
pub const LOCKFILE_NAME: &str = "Cargo.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitSource {
    Git,
    /// Substituted explicitly by the caller when no repository is available.
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submodule {
    pub path: String,
    pub sha: String,
    /// One of ` `, `-`, `+`, `U` as printed by `git submodule status`.
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitInfo {
    pub repo_sha: String,
    pub is_dirty: bool,
    #[serde(default)]
    pub submodules: Vec<Submodule>,
    pub source: GitSource,
}

impl GitInfo {
    /// Query git in `dir`. Fails if `dir` is not inside a repository or HEAD
    /// cannot be resolved.
    pub fn capture(dir: &Path) -> RunResult<Self> {
        let top = repository_root(dir).ok_or_else(|| {
            RunError::Provenance(format!("git.repo_sha: {} is not inside a git repository", dir.display()))
        })?;

        let repo_sha = run_git(&top, &["rev-parse", "HEAD"])
            .filter(|(ok, out)| *ok && !out.is_empty())
            .map(|(_, out)| out)
            .ok_or_else(|| RunError::Provenance("git.repo_sha: cannot resolve HEAD".to_string()))?;

        // `git diff --quiet` exits 1 when the tree differs from the index or HEAD.
        let unstaged = run_git(&top, &["diff", "--quiet"]).is_none_or(|(ok, _)| !ok);
        let staged = run_git(&top, &["diff", "--cached", "--quiet"]).is_none_or(|(ok, _)| !ok);

        let submodules = run_git(&top, &["submodule", "status", "--recursive"])
            .filter(|(ok, _)| *ok)
            .map(|(_, out)| parse_submodules(&out))
            .unwrap_or_default();

        debug!(sha = %repo_sha, dirty = unstaged || staged, "captured git metadata");
        Ok(Self { repo_sha, is_dirty: unstaged || staged, submodules, source: GitSource::Git })
    }

    /// Explicit stand-in for runs outside a repository. Marked as dirty and
    /// tagged so it can never be mistaken for real attribution.
    pub fn placeholder() -> Self {
        Self {
            repo_sha: PLACEHOLDER_SHA.to_string(),
            is_dirty: true,
            submodules: Vec::new(),
            source: GitSource::Placeholder,
        }
    }
}

/// Top level of the git work tree containing `dir`, if any.
pub fn repository_root(dir: &Path) -> Option<PathBuf> {
    run_git(dir, &["rev-parse", "--show-toplevel"])
        .filter(|(ok, out)| *ok && !out.is_empty())
        .map(|(_, out)| PathBuf::from(out))
}

fn run_git(dir: &Path, args: &[&str]) -> Option<(bool, String)> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Some((output.status.success(), stdout))
}

fn parse_submodules(out: &str) -> Vec<Submodule> {
    out.lines()
        .filter_map(|line| {
            let mut chars = line.chars();
            let status = chars.next()?;
            let mut parts = chars.as_str().split_whitespace();
            let sha = parts.next()?;
            let path = parts.next()?;
            Some(Submodule { path: path.to_string(), sha: sha.to_string(), status: status.to_string() })
        })
        .collect()
}

/// Snapshot of the dependency lockfile the run was started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockfileRef {
    pub path: String,
    pub sha256: String,
}

impl LockfileRef {
    /// Hash the first [`LOCKFILE_NAME`] found in `dirs`, searched in order.
    pub fn locate(dirs: &[PathBuf]) -> RunResult<Option<Self>> {
        for dir in dirs {
            let path = dir.join(LOCKFILE_NAME);
            if path.is_file() {
                let sha256 = sha256_file(&path)?;
                debug!(path = %path.display(), "captured lockfile");
                return Ok(Some(Self { path: path.display().to_string(), sha256 }));
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvInfo {
    pub language: String,
    pub runtime_version: String,
    pub platform: String,
    pub crate_version: String,
    pub numeric_backend: BackendInfo,
    /// `None` only for runs started with `allow_untracked`.
    #[serde(default)]
    pub lockfile: Option<LockfileRef>,
}

impl EnvInfo {
    pub fn capture(backend: BackendInfo) -> Self {
        Self {
            language: "rust".to_string(),
            runtime_version: env!("DIFFUSION_CORE_RUSTC_VERSION").to_string(),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            numeric_backend: backend,
            lockfile: None,
        }
    }

    #[must_use]
    pub fn with_lockfile(mut self, lockfile: Option<LockfileRef>) -> Self {
        self.lockfile = lockfile;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub argv: Vec<String>,
    pub cwd: String,
    /// Command line that reproduces this invocation.
    pub recommended: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRef {
    pub resolved_path: String,
    pub resolved_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngInfo {
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub layout_version: u32,
    pub run_id: String,
    pub created_at_utc: String,
    pub command: CommandInfo,
    pub git: GitInfo,
    pub env: EnvInfo,
    pub config: ConfigRef,
    pub rng: RngInfo,
}

impl ProvenanceRecord {
    /// Every required field present and non-empty; errors name the field.
    pub fn validate(&self) -> RunResult<()> {
        fn non_empty(field: &str, value: &str) -> RunResult<()> {
            if value.trim().is_empty() {
                return Err(RunError::Provenance(format!("{field} is empty")));
            }
            Ok(())
        }

        if self.layout_version == 0 {
            return Err(RunError::Provenance("layout_version is not set".to_string()));
        }
        non_empty("run_id", &self.run_id)?;
        non_empty("created_at_utc", &self.created_at_utc)?;
        if clock::parse_utc(&self.created_at_utc).is_none() {
            return Err(RunError::Provenance(format!(
                "created_at_utc `{}` is not a UTC timestamp ending in `Z`",
                self.created_at_utc
            )));
        }
        if self.command.argv.is_empty() {
            return Err(RunError::Provenance("command.argv is empty".to_string()));
        }
        non_empty("command.argv[0]", &self.command.argv[0])?;
        non_empty("command.cwd", &self.command.cwd)?;
        non_empty("git.repo_sha", &self.git.repo_sha)?;
        if self.git.repo_sha.len() < MIN_SHA_LEN {
            return Err(RunError::Provenance(format!(
                "git.repo_sha `{}` is shorter than {MIN_SHA_LEN} characters",
                self.git.repo_sha
            )));
        }
        non_empty("env.language", &self.env.language)?;
        non_empty("env.runtime_version", &self.env.runtime_version)?;
        non_empty("env.platform", &self.env.platform)?;
        non_empty("env.numeric_backend.name", &self.env.numeric_backend.name)?;
        non_empty("env.numeric_backend.version", &self.env.numeric_backend.version)?;
        if let Some(lockfile) = &self.env.lockfile {
            non_empty("env.lockfile.path", &lockfile.path)?;
            non_empty("env.lockfile.sha256", &lockfile.sha256)?;
        }
        non_empty("config.resolved_path", &self.config.resolved_path)?;
        non_empty("config.resolved_sha256", &self.config.resolved_sha256)?;
        Ok(())
    }
}

fn recommended_command(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(char::is_whitespace) || arg.contains('\'') {
                format!("'{}'", arg.replace('\'', r"'\''"))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build, validate and write `meta/provenance.json`. A run can be stamped
/// once; a second call fails without touching the existing file.
pub fn stamp(
    run: &RunDirectory,
    argv: &[String],
    cwd: &Path,
    git: GitInfo,
    env: EnvInfo,
    seed: u64,
) -> RunResult<ProvenanceRecord> {
    let config_path = run.config_path();
    let record = ProvenanceRecord {
        layout_version: run.layout_version(),
        run_id: run.run_id().0.clone(),
        created_at_utc: clock::utc_now(),
        command: CommandInfo {
            argv: argv.to_vec(),
            cwd: cwd.display().to_string(),
            recommended: recommended_command(argv),
        },
        git,
        env,
        config: ConfigRef {
            resolved_path: config_path.display().to_string(),
            resolved_sha256: run.config_sha256().to_string(),
        },
        rng: RngInfo { seed },
    };
    record.validate()?;

    let mut json = serde_json::to_vec_pretty(&record)?;
    json.push(b'\n');
    match publish_new(&run.provenance_path(), &json) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(RunError::Provenance(format!(
                "{} already exists; provenance is written once per run",
                run.provenance_path().display()
            )));
        }
        Err(e) => {
            return Err(RunError::Provenance(format!("cannot write {}: {e}", run.provenance_path().display())));
        }
    }

    info!(run_id = %run.run_id(), sha = %record.git.repo_sha, "stamped provenance");
    Ok(record)
}

pub fn read_provenance(run: &RunDirectory) -> RunResult<ProvenanceRecord> {
    let path = run.provenance_path();
    let bytes = std::fs::read(&path)
        .map_err(|e| RunError::Provenance(format!("cannot read {}: {e}", path.display())))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Check a provenance file: schema, required fields, and that the resolved
/// config and the recorded lockfile still hash to the recorded values.
pub fn validate_provenance_file(path: &Path) -> RunResult<ProvenanceRecord> {
    let bytes = std::fs::read(path)
        .map_err(|e| RunError::Provenance(format!("cannot read {}: {e}", path.display())))?;
    let record: ProvenanceRecord = serde_json::from_slice(&bytes)
        .map_err(|e| RunError::Provenance(format!("{} does not match the provenance schema: {e}", path.display())))?;
    record.validate()?;

    if record.layout_version != LAYOUT_VERSION {
        return Err(RunError::Provenance(format!(
            "layout_version {} is not supported (expected {LAYOUT_VERSION})",
            record.layout_version
        )));
    }

    let config_path = Path::new(&record.config.resolved_path);
    if !config_path.is_file() {
        return Err(RunError::Provenance(format!("config.resolved_path {} does not exist", config_path.display())));
    }
    let actual = sha256_file(config_path)?;
    if actual != record.config.resolved_sha256 {
        return Err(RunError::Provenance(format!(
            "config.resolved_sha256 mismatch: recorded {}, file hashes to {actual}",
            record.config.resolved_sha256
        )));
    }

    if let Some(lockfile) = &record.env.lockfile {
        let lock_path = Path::new(&lockfile.path);
        if !lock_path.is_file() {
            return Err(RunError::Provenance(format!("env.lockfile.path {} does not exist", lock_path.display())));
        }
        let actual = sha256_file(lock_path)?;
        if actual != lockfile.sha256 {
            return Err(RunError::Provenance(format!(
                "env.lockfile.sha256 mismatch: recorded {}, {} hashes to {actual}",
                lockfile.sha256,
                lock_path.display()
            )));
        }
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_submodules() {
        let out = " 1234567abc vendor/lib (heads/main)\n-89abcdef0 third_party/x\n";
        let subs = parse_submodules(out);
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].path, "vendor/lib");
        assert_eq!(subs[0].status, " ");
        assert_eq!(subs[1].sha, "89abcdef0");
        assert_eq!(subs[1].status, "-");
    }

    #[test]
    fn test_recommended_command_quotes() {
        let argv = vec!["diffusion-core".to_string(), "smoke".to_string(), "--config".to_string(), "my cfg.yaml".to_string()];
        assert_eq!(recommended_command(&argv), "diffusion-core smoke --config 'my cfg.yaml'");
    }

    #[test]
    fn test_lockfile_search_order() {
        let temp = tempfile::TempDir::new().unwrap();
        let first = temp.path().join("top");
        let second = temp.path().join("cwd");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        let dirs = vec![first.clone(), second.clone()];
        assert!(LockfileRef::locate(&dirs).unwrap().is_none());

        std::fs::write(second.join(LOCKFILE_NAME), "version = 3\n").unwrap();
        let found = LockfileRef::locate(&dirs).unwrap().unwrap();
        assert_eq!(found.path, second.join(LOCKFILE_NAME).display().to_string());
        assert_eq!(found.sha256.len(), 64);

        std::fs::write(first.join(LOCKFILE_NAME), "version = 4\n").unwrap();
        let found = LockfileRef::locate(&dirs).unwrap().unwrap();
        assert_eq!(found.path, first.join(LOCKFILE_NAME).display().to_string());
    }

    #[test]
    fn test_placeholder_is_tagged_and_long_enough() {
        let git = GitInfo::placeholder();
        assert_eq!(git.source, GitSource::Placeholder);
        assert!(git.repo_sha.len() >= MIN_SHA_LEN);
        assert!(git.is_dirty);
    }
}
