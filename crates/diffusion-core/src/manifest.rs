use crate::clock;
use crate::error::{RunError, RunResult};
use crate::layout::{write_atomic, RunDirectory, CONFIG_FILE, METRICS_FILE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestKind {
    Config,
    Metrics,
    Artifact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub kind: ManifestKind,
    /// Path relative to the run directory, `/`-separated.
    pub relpath: String,
    pub bytes: u64,
    pub sha256: String,
}

/// Content listing of a run's human- and machine-facing outputs.
/// Checkpoints are excluded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub generated_at_utc: String,
    pub entries: Vec<ManifestEntry>,
}

pub fn sha256_file(path: &Path) -> RunResult<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn make_entry(kind: ManifestKind, run_dir: &Path, path: &Path) -> RunResult<ManifestEntry> {
    if !path.is_file() {
        return Err(RunError::not_found(run_dir, format!("manifest entry does not exist: {}", path.display())));
    }
    let rel = path.strip_prefix(run_dir).unwrap_or(path);
    let relpath = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/");
    Ok(ManifestEntry { kind, relpath, bytes: path.metadata()?.len(), sha256: sha256_file(path)? })
}

/// Hash the current outputs and (re)write `meta/manifest.json`.
pub fn write_manifest(run: &RunDirectory) -> RunResult<RunManifest> {
    let root = run.root_path();
    let mut entries = vec![
        make_entry(ManifestKind::Config, root, &root.join(CONFIG_FILE))?,
        make_entry(ManifestKind::Metrics, root, &root.join(METRICS_FILE))?,
    ];

    let mut artifacts: Vec<PathBuf> = WalkDir::new(run.artifacts_dir())
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .collect();
    artifacts.sort();
    for path in artifacts {
        entries.push(make_entry(ManifestKind::Artifact, root, &path)?);
    }

    let manifest = RunManifest {
        run_id: run.run_id().0.clone(),
        run_dir: root.to_path_buf(),
        generated_at_utc: clock::utc_now(),
        entries,
    };
    let mut json = serde_json::to_vec_pretty(&manifest)?;
    json.push(b'\n');
    write_atomic(&run.manifest_path(), &json)?;
    debug!(run_id = %run.run_id(), entries = manifest.entries.len(), "wrote run manifest");
    Ok(manifest)
}

pub fn read_manifest(run: &RunDirectory) -> RunResult<Option<RunManifest>> {
    let path = run.manifest_path();
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&std::fs::read(path)?)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_file_known_value() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_make_entry_requires_file() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing.bin");
        assert!(make_entry(ManifestKind::Artifact, temp.path(), &missing).is_err());
    }

    #[test]
    fn test_make_entry_relpath_is_slash_separated() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("artifacts").join("samples");
        std::fs::create_dir_all(&nested).unwrap();
        let file = nested.join("grid.png");
        std::fs::write(&file, b"png").unwrap();
        let entry = make_entry(ManifestKind::Artifact, temp.path(), &file).unwrap();
        assert_eq!(entry.relpath, "artifacts/samples/grid.png");
        assert_eq!(entry.bytes, 3);
    }
}
