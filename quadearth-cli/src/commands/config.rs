//! Configuration file commands.
//!
//! `config show`, `config init` and `config path` operate on the file given
//! with `--config`, or on `~/.config/quadearth/config.ini`.

use std::path::Path;

use clap::Subcommand;
use quadearth::config::ConfigFile;

use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as INI
    Show,

    /// Write a configuration file with default settings
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the configuration file path
    Path,
}

/// Run a config subcommand against `path`.
pub fn run(command: ConfigCommands, path: &Path) -> Result<(), CliError> {
    match command {
        ConfigCommands::Show => {
            print!("{}", render(path)?);
            Ok(())
        }
        ConfigCommands::Init { force } => {
            if init(path, force)? {
                println!("Wrote default configuration to {}", path.display());
            } else {
                println!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            Ok(())
        }
        ConfigCommands::Path => {
            println!("{}", path.display());
            Ok(())
        }
    }
}

/// Loads `path` (or defaults) and renders it back as INI.
fn render(path: &Path) -> Result<String, CliError> {
    let config = load(path)?;
    Ok(config.to_ini_string())
}

/// Writes defaults to `path`. Returns false if a file was kept.
fn init(path: &Path, force: bool) -> Result<bool, CliError> {
    if path.exists() && !force {
        return Ok(false);
    }
    ConfigFile::default()
        .save_to(path)
        .map_err(|error| CliError::ConfigFile {
            path: path.to_path_buf(),
            error,
        })?;
    Ok(true)
}

/// Loads the configuration at `path`, falling back to defaults if absent.
pub fn load(path: &Path) -> Result<ConfigFile, CliError> {
    ConfigFile::load_from(path).map_err(|error| CliError::ConfigFile {
        path: path.to_path_buf(),
        error,
    })
}
