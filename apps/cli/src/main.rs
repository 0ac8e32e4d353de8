//! diffusion-core CLI
//!
//! Creates, resumes and validates run directories. Machine-readable lines
//! (`RUN_DIR: ...`) go to stdout; logs go to stderr.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{config as config_cmd, resume, smoke, validate};

#[derive(Parser, Debug)]
#[command(
    name = "diffusion-core",
    version,
    about = "Run lifecycle driver for diffusion-model training",
    long_about = "Creates auditable, resumable run directories: strict config resolution,\nprovenance, append-only metrics and crash-safe checkpoints."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new run and drive the smoke loop to completion
    Smoke {
        /// Run config (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Directory that holds run directories (overrides `run.run_root`)
        #[arg(long)]
        run_root: Option<PathBuf>,

        /// Fixed run id prefix; fails if the run already exists
        #[arg(long)]
        run_id: Option<String>,

        /// Config override, e.g. `--set trainer.max_steps=3` (repeatable)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,

        /// Stop after checkpointing this step
        #[arg(long)]
        stop_after: Option<u64>,

        /// Record placeholder git metadata when not inside a repository
        #[arg(long)]
        allow_untracked: bool,
    },

    /// Resume a run from its last checkpoint
    Resume {
        #[arg(long)]
        run_root: Option<PathBuf>,

        #[arg(long)]
        run_id: String,

        #[arg(long)]
        allow_untracked: bool,
    },

    /// Check a run directory against the layout contract
    Validate {
        #[arg(long)]
        run_dir: PathBuf,

        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the resolved config without creating anything
    Config {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cli_config = config::CliConfig::discover_and_load()?;

    let level = match args.log_level.as_deref().or(cli_config.log_level.as_deref()).unwrap_or("info") {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Smoke { config, run_root, run_id, overrides, stop_after, allow_untracked } => {
            smoke::execute(
                smoke::SmokeOptions { config, run_root, run_id, overrides, stop_after, allow_untracked },
                &cli_config,
            )?;
        }
        Command::Resume { run_root, run_id, allow_untracked } => {
            resume::execute(run_root, run_id, allow_untracked, &cli_config)?;
        }
        Command::Validate { run_dir, json } => {
            validate::execute(&run_dir, json)?;
        }
        Command::Config { config, overrides } => {
            config_cmd::execute(&config, &overrides)?;
        }
    }

    Ok(())
}
