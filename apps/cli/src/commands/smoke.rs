//! `smoke`: start a run and drive the smoke loop.

use anyhow::Context;
use colored::Colorize;
use diffusion_core::{start_run, CpuBackend, SmokeLoop, StartRequest, TracingProgressSink};
use std::path::PathBuf;

use crate::config::CliConfig;

#[derive(Debug)]
pub struct SmokeOptions {
    pub config: PathBuf,
    pub run_root: Option<PathBuf>,
    pub run_id: Option<String>,
    pub overrides: Vec<String>,
    pub stop_after: Option<u64>,
    pub allow_untracked: bool,
}

pub fn execute(options: SmokeOptions, cli_config: &CliConfig) -> anyhow::Result<()> {
    let (argv, cwd) = super::invocation()?;
    let request = StartRequest {
        config_path: options.config,
        overrides: super::parse_overrides(&options.overrides)?,
        run_root: options.run_root.or_else(|| cli_config.run_root.clone().map(PathBuf::from)),
        run_id_prefix: options.run_id,
        argv,
        cwd,
        allow_untracked: options.allow_untracked || cli_config.allow_untracked(),
    };

    let session = start_run(&request, &CpuBackend).context("Failed to start run")?;
    println!("RUN_DIR: {}", session.run().root_path().display());

    let mut smoke = SmokeLoop::new(&session, &TracingProgressSink);
    if let Some(step) = options.stop_after {
        smoke = smoke.stop_after(step);
    }
    let outcome = smoke.run().context("Smoke loop failed")?;

    let status = if outcome.completed { "completed".green() } else { "stopped".yellow() };
    eprintln!(
        "{} run {} {} at step {} (scalar {:.6})",
        "✓".green(),
        session.run().run_id().to_string().bold(),
        status,
        outcome.final_step.map_or_else(|| "-".to_string(), |s| s.to_string()),
        outcome.scalar
    );
    Ok(())
}
