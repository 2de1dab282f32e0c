//! # block-cli
//!
//! Binary entry point for block runs.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`, one subcommand per flow
//! - Logging and configuration initialization
//! - Exit-code policy: non-zero on any validation or calibration failure,
//!   zero once the recording or playback output has drained

use anyhow::{Context, Result};
use block_adapters::{OutputFilter, ProcessStageRunner};
use block_core::{BlockError, BlockFlow, BlockRunner, OrchestratorConfig, RunOptions};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Calibrate, then record responses to a block of video clips.
#[derive(Parser, Debug)]
#[command(name = "block", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML file locating the stage programs
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the stage programs (overrides the config file)
    #[arg(long, global = true)]
    programs_dir: Option<PathBuf>,

    /// Never hand the terminal foreground to stage programs
    #[arg(long, global = true)]
    no_terminal_handoff: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Calibrate, then record responses to a block of video clips
    Run(RunArgs),

    /// Record responses without calibration
    Monkey(MonkeyArgs),

    /// Play multiple stimuli
    Play(PlayArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the block parameters JSON file
    parameters: PathBuf,

    /// Overwrite output files if they exist
    #[arg(short, long)]
    force: bool,

    /// Do not calibrate before recording
    #[arg(short, long)]
    skip_calibration: bool,

    /// Do not hide the GPU messages
    #[arg(short = 'g', long)]
    show_gpu: bool,

    /// Send fake button pushes periodically
    #[arg(short = 'e', long)]
    fake_events: bool,
}

#[derive(Args, Debug)]
struct MonkeyArgs {
    /// Path to the block parameters JSON file
    parameters: PathBuf,

    /// Overwrite output files if they exist
    #[arg(short, long)]
    force: bool,

    /// Do not hide the GPU messages
    #[arg(short = 'g', long)]
    show_gpu: bool,
}

#[derive(Args, Debug)]
struct PlayArgs {
    /// Path to the block parameters JSON file
    parameters: PathBuf,

    /// Do not hide the GPU messages
    #[arg(short = 'g', long)]
    show_gpu: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging on stderr; stdout carries the stage output.
    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    let terminal_handoff = config.terminal_handoff && !cli.no_terminal_handoff;

    let (parameters, options, show_gpu) = match cli.command {
        Commands::Run(args) => (
            args.parameters,
            RunOptions {
                flow: BlockFlow::Calibrated,
                force: args.force,
                skip_calibration: args.skip_calibration,
                fake_events: args.fake_events,
                terminal_handoff,
            },
            args.show_gpu,
        ),
        Commands::Monkey(args) => (
            args.parameters,
            RunOptions {
                flow: BlockFlow::Monkey,
                force: args.force,
                skip_calibration: false,
                fake_events: false,
                terminal_handoff,
            },
            args.show_gpu,
        ),
        Commands::Play(args) => (
            args.parameters,
            RunOptions {
                flow: BlockFlow::Playback,
                force: false,
                skip_calibration: false,
                fake_events: false,
                terminal_handoff,
            },
            args.show_gpu,
        ),
    };

    run_block(config, &parameters, options, show_gpu).await
}

fn load_config(cli: &Cli) -> Result<OrchestratorConfig> {
    let mut config = match &cli.config {
        Some(path) => OrchestratorConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => OrchestratorConfig::default(),
    };
    if let Some(dir) = &cli.programs_dir {
        config.programs_dir = Some(dir.clone());
    }
    debug!(programs_dir = %config.programs_dir().display(), "Using stage programs");
    Ok(config)
}

async fn run_block(
    config: OrchestratorConfig,
    parameters: &Path,
    options: RunOptions,
    show_gpu: bool,
) -> Result<()> {
    let runner = ProcessStageRunner::new(OutputFilter::new(show_gpu), std::io::stdout());
    let mut block = BlockRunner::new(runner, config, options);

    let outcome = block.run_document(parameters).await.map_err(with_kind)?;

    // The final stage's status does not change our exit code; surface it instead.
    if !outcome.final_stage_succeeded() {
        warn!(
            exit_code = ?outcome.final_stage.exit_code,
            "{} did not exit cleanly; inspect its output for failures",
            outcome.final_stage.stage
        );
    }
    debug!(
        forwarded = outcome.final_stage.lines_forwarded,
        suppressed = outcome.final_stage.lines_suppressed,
        "Block complete"
    );
    Ok(())
}

/// Wraps a block error so the report leads with its category.
fn with_kind(err: BlockError) -> anyhow::Error {
    let kind = err.kind();
    anyhow::Error::new(err).context(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from(["block", "run", "block.json", "-f", "-s", "-g", "-e"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.parameters, PathBuf::from("block.json"));
        assert!(args.force && args.skip_calibration && args.show_gpu && args.fake_events);
    }

    #[test]
    fn test_monkey_rejects_skip_calibration() {
        assert!(Cli::try_parse_from(["block", "monkey", "block.json", "--skip-calibration"]).is_err());
    }

    #[test]
    fn test_play_rejects_force() {
        assert!(Cli::try_parse_from(["block", "play", "block.json", "--force"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "block",
            "play",
            "block.json",
            "--programs-dir",
            "/opt/rig/bin",
            "--no-terminal-handoff",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.programs_dir, Some(PathBuf::from("/opt/rig/bin")));
        assert!(cli.no_terminal_handoff);
        assert!(cli.verbose);
    }

    #[test]
    fn test_error_report_leads_with_kind() {
        let err = with_kind(BlockError::OutputExists {
            path: PathBuf::from("/exp/out.log"),
        });
        assert_eq!(err.to_string(), "ConflictError");
        assert!(format!("{err:#}").contains("output exists /exp/out.log"));
    }
}
