//! CLI error handling with user-friendly messages.

use std::fmt;
use std::path::PathBuf;
use std::process;

use quadearth::config::ConfigFileError;
use quadearth::source::SourceError;
use quadearth::LayerError;

/// CLI-specific errors.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(std::io::Error),
    /// Invalid settings or arguments
    Config(String),
    /// Config file could not be read or written
    ConfigFile {
        path: PathBuf,
        error: ConfigFileError,
    },
    /// Texture source could not be created
    Source(SourceError),
    /// The layer failed to start or tear down
    Layer(LayerError),
    /// Failed to build the async runtime
    Runtime(std::io::Error),
}

impl CliError {
    /// Exit the process with an error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        match self {
            CliError::ConfigFile { .. } => {
                eprintln!();
                eprintln!("Check the file with 'quadearth config show', or write a fresh one");
                eprintln!("with 'quadearth config init --force'.");
            }
            CliError::Source(_) => {
                eprintln!();
                eprintln!("Directory sources need [layer] location = <root directory>.");
                eprintln!("HTTP sources need a URL template using {{level}}, {{x}} and {{y}}.");
            }
            _ => {}
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(e) => write!(f, "Failed to initialize logging: {}", e),
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::ConfigFile { path, error } => {
                write!(f, "Config file '{}': {}", path.display(), error)
            }
            CliError::Source(e) => write!(f, "Failed to create texture source: {}", e),
            CliError::Layer(e) => write!(f, "Layer error: {}", e),
            CliError::Runtime(e) => write!(f, "Failed to start runtime: {}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::LoggingInit(e) => Some(e),
            CliError::ConfigFile { error, .. } => Some(error),
            CliError::Source(e) => Some(e),
            CliError::Layer(e) => Some(e),
            CliError::Runtime(e) => Some(e),
            CliError::Config(_) => None,
        }
    }
}

impl From<SourceError> for CliError {
    fn from(e: SourceError) -> Self {
        CliError::Source(e)
    }
}

impl From<LayerError> for CliError {
    fn from(e: LayerError) -> Self {
        CliError::Layer(e)
    }
}
