use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tempo::{execute, Config};
use tracing_subscriber::EnvFilter;

// CLI
// ================================================================================================

/// Static WCET estimation from an annotated control-flow graph.
#[derive(Debug, Parser)]
#[command(name = "tempo", version)]
struct Cli {
    /// Path to the analysis configuration file.
    config: PathBuf,

    /// Suppress per-pass timing printouts.
    #[arg(short = 't')]
    no_timing: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("tempo: {message}");
            ExitCode::FAILURE
        },
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let text = std::fs::read_to_string(&cli.config)
        .map_err(|e| format!("cannot read {}: {e}", cli.config.display()))?;
    let config = Config::from_xml(&text).map_err(|e| e.to_string())?;
    execute(&config, !cli.no_timing).map_err(|e| e.to_string())
}
