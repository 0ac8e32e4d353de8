//! Command implementations for the diffusion-core CLI.

pub mod config;
pub mod resume;
pub mod smoke;
pub mod validate;

use anyhow::Context;
use diffusion_core::Override;

/// Parse repeated `--set key.path=value` flags.
pub(crate) fn parse_overrides(raw: &[String]) -> anyhow::Result<Vec<Override>> {
    raw.iter()
        .map(|spec| Override::parse(spec).with_context(|| format!("Invalid --set `{spec}`")))
        .collect()
}

/// The process argv and working directory, as recorded in provenance.
pub(crate) fn invocation() -> anyhow::Result<(Vec<String>, std::path::PathBuf)> {
    let argv = std::env::args().collect();
    let cwd = std::env::current_dir().context("Failed to determine the working directory")?;
    Ok((argv, cwd))
}
