//! `validate`: check a run directory against the layout contract.

use colored::Colorize;
use diffusion_core::layout::PROVENANCE_FILE;
use diffusion_core::{read_events, validate_provenance_file, CheckpointManager, RunDirectory, RunLayout, RunResult};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
struct Check {
    name: &'static str,
    ok: bool,
    detail: String,
}

impl Check {
    fn from_result(name: &'static str, result: RunResult<String>) -> Self {
        match result {
            Ok(detail) => Self { name, ok: true, detail },
            Err(e) => Self { name, ok: false, detail: e.to_string() },
        }
    }
}

#[derive(Debug, Serialize)]
struct Report {
    run_dir: String,
    valid: bool,
    checks: Vec<Check>,
}

pub fn execute(run_dir: &Path, json: bool) -> anyhow::Result<()> {
    let mut checks = Vec::new();

    let run = RunLayout::open_dir(run_dir);
    checks.push(match &run {
        Ok(run) => Check { name: "layout", ok: true, detail: format!("layout_version {}", run.layout_version()) },
        Err(e) => Check { name: "layout", ok: false, detail: e.to_string() },
    });
    checks.push(Check::from_result(
        "provenance",
        validate_provenance_file(&run_dir.join(PROVENANCE_FILE)).map(|record| {
            format!("git {} ({:?}){}", record.git.repo_sha, record.git.source, if record.git.is_dirty { ", dirty" } else { "" })
        }),
    ));
    if let Ok(run) = &run {
        checks.push(Check::from_result("metrics", read_events(run).map(|events| format!("{} event(s)", events.len()))));
        checks.push(Check::from_result("checkpoint", verify_checkpoint(run)));
    }

    let report = Report {
        run_dir: run_dir.display().to_string(),
        valid: checks.iter().all(|c| c.ok),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{} {}", "Validating".bold().cyan(), report.run_dir);
        for check in &report.checks {
            let mark = if check.ok { "✓".green() } else { "✗".red() };
            println!("  {mark} {:<11} {}", check.name, check.detail);
        }
    }

    if !report.valid {
        anyhow::bail!("{} failed validation", report.run_dir);
    }
    Ok(())
}

/// Load the last checkpoint and re-hash every blob.
fn verify_checkpoint(run: &RunDirectory) -> RunResult<String> {
    let Some(record) = CheckpointManager::for_run(run).load()? else {
        return Ok("no checkpoint published".to_string());
    };
    for blob in &record.blobs {
        record.read_blob(&blob.name)?;
    }
    Ok(format!("step {} ({} blob(s) verified)", record.step, record.blobs.len()))
}
