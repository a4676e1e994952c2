//! Binary entry point for memdedup.
//!
//! Runs deduplication over a JSON file of memory records and inspects the
//! effective configuration.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow needless_pass_by_value for command functions
#![allow(clippy::needless_pass_by_value)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use commands::{RunArgs, cmd_config, cmd_run};
use memdedup::config::EngineConfig;
use memdedup::observability::{self, InitOptions, LogFormat};

/// memdedup - Deduplication and consolidation for memory records.
#[derive(Parser)]
#[command(name = "memdedup")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "MEMDEDUP_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format: pretty or json.
    #[arg(long, global = true, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Deduplicate a JSON file of memory records.
    Run(RunArgs),

    /// Print the effective configuration as TOML.
    Config,
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    LogFormat::parse(value).ok_or_else(|| format!("unknown log format '{value}' (pretty, json)"))
}

/// Main entry point.
#[tokio::main]
async fn main() -> ExitCode {
    // Missing .env files are normal.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        },
    };

    let metrics = matches!(&cli.command, Commands::Run(args) if args.metrics);
    let observability = match observability::init_from_settings(
        &config.logging,
        InitOptions {
            verbose: cli.verbose,
            metrics,
            format: cli.log_format,
        },
    ) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to initialize observability: {e}");
            return ExitCode::FAILURE;
        },
    };

    let result = match cli.command {
        Commands::Run(args) => cmd_run(config, args, &observability).await,
        Commands::Config => cmd_config(&config, cli.config.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

/// Loads configuration from an explicit path or the default locations.
fn load_config(path: Option<&std::path::Path>) -> memdedup::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load_from_file(path),
        None => EngineConfig::load_default(),
    }
}
