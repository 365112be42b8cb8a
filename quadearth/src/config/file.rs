//! INI configuration file at `<config dir>/quadearth/config.ini`.
//!
//! Missing files and missing keys fall back to defaults; present keys must
//! parse or loading fails with [`ConfigFileError::InvalidValue`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};
use thiserror::Error;

use super::size::{format_size, parse_size};
use super::{ConfigError, EngineConfig};
use crate::coord::TilingScheme;
use crate::loader::{RetryPolicy, DEFAULT_INITIAL_DELAY};
use crate::scene::{SwapOrdering, DEFAULT_BATCH_CAPACITY};

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] ini::Error),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("Invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Invalid(#[from] ConfigError),

    #[error("Failed to create config directory: {0}")]
    DirectoryError(std::io::Error),
}

/// Where a layer's textures come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourceKind {
    /// Generated in memory.
    #[default]
    Synthetic,
    /// Files under a root directory.
    Directory,
    /// A URL template.
    Http,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Synthetic => "synthetic",
            SourceKind::Directory => "directory",
            SourceKind::Http => "http",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synthetic" => Ok(SourceKind::Synthetic),
            "directory" | "dir" => Ok(SourceKind::Directory),
            "http" => Ok(SourceKind::Http),
            other => Err(format!(
                "unknown source '{}' (expected synthetic, directory or http)",
                other
            )),
        }
    }
}

/// Texture source selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSettings {
    pub kind: SourceKind,
    /// Directory root or URL template, depending on `kind`.
    pub location: Option<String>,
}

/// Everything stored in `config.ini`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigFile {
    pub engine: EngineConfig,
    pub source: SourceSettings,
    /// Capacity of the scene's batch broadcast channel.
    pub batch_capacity: usize,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            source: SourceSettings::default(),
            batch_capacity: DEFAULT_BATCH_CAPACITY,
        }
    }
}

impl ConfigFile {
    /// Loads from [`config_file_path`], or defaults if absent.
    pub fn load() -> Result<Self, ConfigFileError> {
        Self::load_from(&config_file_path())
    }

    /// Loads from `path`, or defaults if absent.
    pub fn load_from(path: &Path) -> Result<Self, ConfigFileError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(path)?;
        parse_ini(&ini)
    }

    /// Parses INI text.
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigFileError> {
        let ini = Ini::load_from_str(text).map_err(ini::Error::Parse)?;
        parse_ini(&ini)
    }

    pub fn save(&self) -> Result<(), ConfigFileError> {
        self.save_to(&config_file_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigFileError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigFileError::DirectoryError)?;
        }
        std::fs::write(path, self.to_ini_string())
            .map_err(|e| ConfigFileError::WriteError(e.to_string()))
    }

    /// Writes defaults to [`config_file_path`] unless a file exists.
    pub fn ensure_exists() -> Result<PathBuf, ConfigFileError> {
        let path = config_file_path();
        if !path.exists() {
            Self::default().save_to(&path)?;
        }
        Ok(path)
    }

    /// Commented INI text for this configuration.
    pub fn to_ini_string(&self) -> String {
        let engine = &self.engine;
        let (retry, max_attempts, retry_delay, max_retry_delay) = match &engine.scheduler.retry {
            RetryPolicy::None => ("none", 1, Duration::ZERO, Duration::ZERO),
            RetryPolicy::Fixed {
                max_attempts,
                delay,
            } => ("fixed", *max_attempts, *delay, *delay),
            RetryPolicy::ExponentialBackoff {
                max_attempts,
                initial_delay,
                max_delay,
                ..
            } => ("exponential", *max_attempts, *initial_delay, *max_delay),
        };
        let failed_retry_secs = engine
            .lod
            .failed_retry_after
            .map(|d| d.as_secs())
            .unwrap_or(0);

        format!(
            r#"[layer]
; Texture group drawn by the layer
texture_group = {}
; Texture source: synthetic, directory or http
source = {}
; Directory root (directory) or URL template with {{group}} {{level}} {{x}} {{y}} (http)
location = {}
; Globe radius in meters
globe_radius = {}
; Root tile grid
root_columns = {}
root_rows = {}

[lod]
; Split when a tile's projected error exceeds this many pixels
max_pixel_error = {}
; Merge once the error falls below max_pixel_error * merge_ratio
merge_ratio = {}
tile_texels = {}
max_level = {}
; Seconds before failed tiles are requested again (0 disables)
failed_retry_secs = {}

[fetch]
max_concurrent = {}
timeout_secs = {}
; Retry policy: none, fixed or exponential
retry = {}
max_attempts = {}
retry_delay_ms = {}
max_retry_delay_ms = {}

[cache]
; Memory budget for decoded tiles (e.g. 256MB, 1GB)
budget = {}

[mesh]
; Quads per tile edge
tessellation = {}

[scene]
; add-then-remove or remove-then-add
ordering = {}
batch_capacity = {}
"#,
            engine.texture_group,
            self.source.kind,
            self.source.location.as_deref().unwrap_or(""),
            engine.globe_radius,
            engine.tiling.root_columns(),
            engine.tiling.root_rows(),
            engine.lod.max_pixel_error,
            engine.lod.merge_ratio,
            engine.lod.tile_texels,
            engine.lod.max_level,
            failed_retry_secs,
            engine.scheduler.max_concurrent,
            engine.scheduler.fetch_timeout.as_secs(),
            retry,
            max_attempts,
            retry_delay.as_millis(),
            max_retry_delay.as_millis(),
            format_size(engine.cache.budget_bytes),
            engine.mesh.tessellation,
            engine.ordering,
            self.batch_capacity,
        )
    }
}

/// `<config dir>/quadearth`.
pub fn config_directory() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("quadearth")
}

/// `<config dir>/quadearth/config.ini`.
pub fn config_file_path() -> PathBuf {
    config_directory().join("config.ini")
}

fn invalid(section: &str, key: &str, value: &str, reason: impl Into<String>) -> ConfigFileError {
    ConfigFileError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_key<T: FromStr>(
    props: &Properties,
    section: &str,
    key: &str,
    reason: &str,
) -> Result<Option<T>, ConfigFileError> {
    match props.get(key) {
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(section, key, v, reason)),
        None => Ok(None),
    }
}

fn parse_ini(ini: &Ini) -> Result<ConfigFile, ConfigFileError> {
    let mut config = ConfigFile::default();
    let engine = &mut config.engine;

    if let Some(props) = ini.section(Some("layer")) {
        if let Some(v) = props.get("texture_group") {
            let v = v.trim();
            if v.is_empty() {
                return Err(invalid("layer", "texture_group", v, "must not be empty"));
            }
            engine.texture_group = v.to_string();
        }
        if let Some(v) = props.get("source") {
            config.source.kind = v
                .parse()
                .map_err(|reason: String| invalid("layer", "source", v, reason))?;
        }
        if let Some(v) = props.get("location") {
            let v = v.trim();
            if !v.is_empty() {
                config.source.location = Some(v.to_string());
            }
        }
        if let Some(r) = parse_key(props, "layer", "globe_radius", "expected a number")? {
            engine.globe_radius = r;
        }
        let columns: Option<u32> =
            parse_key(props, "layer", "root_columns", "expected a positive integer")?;
        let rows: Option<u32> =
            parse_key(props, "layer", "root_rows", "expected a positive integer")?;
        if columns.is_some() || rows.is_some() {
            let columns = columns.unwrap_or(engine.tiling.root_columns());
            let rows = rows.unwrap_or(engine.tiling.root_rows());
            engine.tiling = TilingScheme::new(columns, rows).map_err(|e| {
                invalid("layer", "root_columns", &format!("{}x{}", columns, rows), e.to_string())
            })?;
        }
    }

    if let Some(props) = ini.section(Some("lod")) {
        if let Some(v) = parse_key(props, "lod", "max_pixel_error", "expected a number")? {
            engine.lod.max_pixel_error = v;
        }
        if let Some(v) = parse_key(props, "lod", "merge_ratio", "expected a number")? {
            engine.lod.merge_ratio = v;
        }
        if let Some(v) = parse_key(props, "lod", "tile_texels", "expected an integer")? {
            engine.lod.tile_texels = v;
        }
        if let Some(v) = parse_key(props, "lod", "max_level", "expected an integer")? {
            engine.lod.max_level = v;
        }
        if let Some(secs) = parse_key::<u64>(props, "lod", "failed_retry_secs", "expected seconds")?
        {
            engine.lod.failed_retry_after = (secs > 0).then(|| Duration::from_secs(secs));
        }
    }

    if let Some(props) = ini.section(Some("fetch")) {
        if let Some(v) = parse_key(props, "fetch", "max_concurrent", "expected an integer")? {
            engine.scheduler.max_concurrent = v;
        }
        if let Some(secs) = parse_key(props, "fetch", "timeout_secs", "expected seconds")? {
            engine.scheduler.fetch_timeout = Duration::from_secs(secs);
        }
        let attempts: Option<u32> =
            parse_key(props, "fetch", "max_attempts", "expected an integer")?;
        let delay: Option<u64> =
            parse_key(props, "fetch", "retry_delay_ms", "expected milliseconds")?;
        let max_delay: Option<u64> =
            parse_key(props, "fetch", "max_retry_delay_ms", "expected milliseconds")?;
        let kind = props.get("retry").map(|v| v.trim().to_ascii_lowercase());
        engine.scheduler.retry = build_retry(
            &engine.scheduler.retry,
            kind.as_deref(),
            attempts,
            delay.map(Duration::from_millis),
            max_delay.map(Duration::from_millis),
        )?;
    }

    if let Some(props) = ini.section(Some("cache")) {
        if let Some(v) = props.get("budget") {
            engine.cache.budget_bytes = parse_size(v).map_err(|_| {
                invalid("cache", "budget", v, "expected format like '256MB' or '1GB'")
            })?;
        }
    }

    if let Some(props) = ini.section(Some("mesh")) {
        if let Some(v) = parse_key(props, "mesh", "tessellation", "expected an integer")? {
            engine.mesh.tessellation = v;
        }
    }

    if let Some(props) = ini.section(Some("scene")) {
        if let Some(v) = props.get("ordering") {
            engine.ordering = v
                .parse::<SwapOrdering>()
                .map_err(|reason| invalid("scene", "ordering", v, reason))?;
        }
        if let Some(v) = parse_key(props, "scene", "batch_capacity", "expected an integer")? {
            config.batch_capacity = v;
        }
    }

    config.engine.validate()?;
    Ok(config)
}

fn build_retry(
    current: &RetryPolicy,
    kind: Option<&str>,
    attempts: Option<u32>,
    delay: Option<Duration>,
    max_delay: Option<Duration>,
) -> Result<RetryPolicy, ConfigFileError> {
    let kind = match kind {
        Some(k) => k,
        None => match current {
            RetryPolicy::None => "none",
            RetryPolicy::Fixed { .. } => "fixed",
            RetryPolicy::ExponentialBackoff { .. } => "exponential",
        },
    };
    let attempts = attempts.unwrap_or_else(|| current.max_attempts());
    match kind {
        "none" => Ok(RetryPolicy::None),
        "fixed" => Ok(RetryPolicy::fixed(
            attempts,
            delay.unwrap_or(DEFAULT_INITIAL_DELAY),
        )),
        "exponential" => {
            let mut policy = RetryPolicy::exponential(attempts);
            if let RetryPolicy::ExponentialBackoff {
                initial_delay,
                max_delay: cap,
                ..
            } = &mut policy
            {
                if let Some(d) = delay {
                    *initial_delay = d;
                }
                if let Some(d) = max_delay {
                    *cap = d;
                }
            }
            Ok(policy)
        }
        other => Err(invalid(
            "fetch",
            "retry",
            other,
            "must be one of: none, fixed, exponential",
        )),
    }
}
