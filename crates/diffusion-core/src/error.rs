use crate::config::ConfigValidationError;
use std::path::PathBuf;
use thiserror::Error;

pub type RunResult<T> = std::result::Result<T, RunError>;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid config: {0}")]
    ConfigValidation(#[from] ConfigValidationError),

    #[error("cannot create run under {root}: {reason}")]
    RunCreation { root: PathBuf, reason: String },

    #[error("run not found or corrupt at {run_dir}: {reason}")]
    RunNotFound { run_dir: PathBuf, reason: String },

    #[error("run {run_dir} is locked by {holder}")]
    RunLocked { run_dir: PathBuf, holder: String },

    #[error("provenance error: {0}")]
    Provenance(String),

    #[error("metric event error: {0}")]
    MetricEvent(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl RunError {
    pub(crate) fn creation(root: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::RunCreation { root: root.into(), reason: reason.into() }
    }

    pub(crate) fn not_found(run_dir: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::RunNotFound { run_dir: run_dir.into(), reason: reason.into() }
    }

    pub(crate) fn checkpoint_io(action: &str, path: &std::path::Path, err: &std::io::Error) -> Self {
        Self::Checkpoint(format!("{action} {}: {err}", path.display()))
    }
}
