//! CLI defaults file support.
//!
//! Precedence, highest first:
//! 1. Command-line flags (handled by clap)
//! 2. Local defaults (`./.diffusionrc`)
//! 3. Global defaults (`~/.diffusion-core/config.toml`)
//! 4. Values from the run config itself

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CliConfig {
    /// Default `--run-root`.
    #[serde(default)]
    pub run_root: Option<String>,

    #[serde(default)]
    pub log_level: Option<String>,

    /// Default for `--allow-untracked`.
    #[serde(default)]
    pub allow_untracked: Option<bool>,
}

impl CliConfig {
    /// Load a TOML defaults file. A missing file yields `None`.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let config = toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(config))
    }

    pub fn default_global_path() -> PathBuf {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".diffusion-core")
            .join("config.toml")
    }

    pub fn default_local_path() -> PathBuf {
        PathBuf::from(".diffusionrc")
    }

    /// Global defaults, then local defaults on top.
    pub fn discover_and_load() -> anyhow::Result<Self> {
        let mut config = Self::default();
        for path in [Self::default_global_path(), Self::default_local_path()] {
            if let Some(found) = Self::load_from_file(&path)? {
                config.merge(&found);
            }
        }
        Ok(config)
    }

    /// Values set in `other` win.
    pub fn merge(&mut self, other: &Self) {
        if let Some(ref run_root) = other.run_root {
            self.run_root = Some(run_root.clone());
        }
        if let Some(ref log_level) = other.log_level {
            self.log_level = Some(log_level.clone());
        }
        if let Some(allow) = other.allow_untracked {
            self.allow_untracked = Some(allow);
        }
    }

    pub fn allow_untracked(&self) -> bool {
        self.allow_untracked.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_none() {
        let temp = TempDir::new().unwrap();
        assert!(CliConfig::load_from_file(&temp.path().join("nope.toml")).unwrap().is_none());
    }

    #[test]
    fn test_merge_prefers_other() {
        let mut base = CliConfig { run_root: Some("a".to_string()), log_level: Some("info".to_string()), allow_untracked: None };
        base.merge(&CliConfig { run_root: Some("b".to_string()), log_level: None, allow_untracked: Some(true) });
        assert_eq!(base.run_root.as_deref(), Some("b"));
        assert_eq!(base.log_level.as_deref(), Some("info"));
        assert!(base.allow_untracked());
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "run_rot = \"x\"\n").unwrap();
        assert!(CliConfig::load_from_file(&path).is_err());
    }
}
