//! QuadEarth CLI
//!
//! Drives the QuadEarth tile engine from the command line: scripted camera
//! flights against a texture group, and management of the config file.

mod commands;
mod error;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use quadearth::config::config_file_path;
use quadearth::logging::{default_log_dir, default_log_file, init_logging};

use commands::config::ConfigCommands;
use commands::simulate::SimulateArgs;
use error::CliError;

#[derive(Parser)]
#[command(name = "quadearth")]
#[command(version = quadearth::VERSION)]
#[command(about = "Stream textured globe tiles from a spherical quad-tree", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.config/quadearth/config.ini)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG still takes precedence)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fly a scripted camera over the globe and report what was drawn
    Simulate(SimulateArgs),

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

fn main() {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(config_file_path);

    let result = match cli.command {
        Commands::Config(command) => commands::config::run(command, &config_path),
        Commands::Simulate(args) => run_simulate(args, &config_path, cli.debug),
    };

    if let Err(e) = result {
        e.exit();
    }
}

fn run_simulate(args: SimulateArgs, config_path: &Path, debug: bool) -> Result<(), CliError> {
    let config = commands::config::load(config_path)?;

    let level = if debug { "debug" } else { "info" };
    let _guard = init_logging(&default_log_dir(), default_log_file(), level)
        .map_err(CliError::LoggingInit)?;

    tracing::info!("QuadEarth v{}", quadearth::VERSION);
    tracing::info!(config = %config_path.display(), "Loaded configuration");
    commands::simulate::run(args, config)
}
