//! `resume`: continue a run from its last checkpoint.

use anyhow::Context;
use colored::Colorize;
use diffusion_core::{resume_run, CpuBackend, ResumeRequest, SmokeLoop, TracingProgressSink};
use std::path::PathBuf;

use crate::config::CliConfig;

pub fn execute(
    run_root: Option<PathBuf>,
    run_id: String,
    allow_untracked: bool,
    cli_config: &CliConfig,
) -> anyhow::Result<()> {
    let (argv, cwd) = super::invocation()?;
    let run_root = run_root
        .or_else(|| cli_config.run_root.clone().map(PathBuf::from))
        .context("--run-root is required (or set run_root in .diffusionrc)")?;

    let request = ResumeRequest {
        run_root,
        run_id,
        argv,
        cwd,
        allow_untracked: allow_untracked || cli_config.allow_untracked(),
    };
    let session = resume_run(&request, &CpuBackend)
        .with_context(|| format!("Failed to resume run `{}`", request.run_id))?;

    println!("RUN_DIR: {}", session.run().root_path().display());
    match session.resumed_from() {
        Some(state) => println!("RESUMED_FROM: {}", state.step),
        None => println!("RESUMED_FROM: none"),
    }

    let outcome = SmokeLoop::new(&session, &TracingProgressSink).run().context("Smoke loop failed")?;
    eprintln!(
        "{} run {} resumed for {} step(s), final step {}",
        "✓".green(),
        session.run().run_id().to_string().bold(),
        outcome.steps_run,
        outcome.final_step.map_or_else(|| "-".to_string(), |s| s.to_string()),
    );
    Ok(())
}
