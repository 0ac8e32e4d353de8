//! `config`: print the resolved configuration.

use anyhow::Context;
use diffusion_core::ConfigResolver;
use std::path::Path;

/// Resolve `config` with overrides and print the YAML snapshot a run would
/// record. Nothing is written.
pub fn execute(config: &Path, overrides: &[String]) -> anyhow::Result<()> {
    let overrides = super::parse_overrides(overrides)?;
    let resolved = ConfigResolver::application()
        .load(config, &overrides)
        .with_context(|| format!("Failed to resolve {}", config.display()))?;
    print!("{}", resolved.to_yaml()?);
    Ok(())
}
