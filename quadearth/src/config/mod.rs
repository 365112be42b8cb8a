//! Engine configuration.
//!
//! [`EngineConfig`] groups the settings of every component, each part with
//! its own defaults and `with_*` builders:
//!
//! ```
//! use quadearth::config::{CacheConfig, EngineConfig};
//! use quadearth::lod::LodConfig;
//!
//! let config = EngineConfig::new("satellite")
//!     .with_lod(LodConfig::default().with_max_level(12))
//!     .with_cache(CacheConfig::new(64 * 1024 * 1024));
//! assert!(config.validate().is_ok());
//! ```
//!
//! [`ConfigFile`] persists the same settings as INI.

mod file;
mod size;

pub use file::{
    config_directory, config_file_path, ConfigFile, ConfigFileError, SourceKind, SourceSettings,
};
pub use size::{format_size, parse_size, Size, SizeParseError};

use thiserror::Error;

use crate::coord::{TilingScheme, MAX_LEVEL};
use crate::loader::SchedulerConfig;
use crate::lod::LodConfig;
use crate::scene::SwapOrdering;
use crate::tile::DEFAULT_TESSELLATION;

/// WGS84 equatorial radius in meters.
pub const DEFAULT_GLOBE_RADIUS: f64 = 6_378_137.0;

/// Default texture group name.
pub const DEFAULT_TEXTURE_GROUP: &str = "earth";

/// Default cache budget (256 MB).
pub const DEFAULT_CACHE_BUDGET: usize = 256 * 1024 * 1024;

/// Largest accepted mesh tessellation.
pub const MAX_TESSELLATION: u32 = 256;

/// A setting outside its valid range.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Invalid {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Tile cache settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub budget_bytes: usize,
}

impl CacheConfig {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_BUDGET)
    }
}

/// Tile mesh settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshConfig {
    /// Quads per tile edge.
    pub tessellation: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            tessellation: DEFAULT_TESSELLATION,
        }
    }
}

/// Everything a [`TileEngine`](crate::engine::TileEngine) needs.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Name of the texture group the layer draws.
    pub texture_group: String,
    pub globe_radius: f64,
    pub tiling: TilingScheme,
    pub lod: LodConfig,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    pub mesh: MeshConfig,
    pub ordering: SwapOrdering,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(DEFAULT_TEXTURE_GROUP)
    }
}

impl EngineConfig {
    pub fn new(texture_group: impl Into<String>) -> Self {
        Self {
            texture_group: texture_group.into(),
            globe_radius: DEFAULT_GLOBE_RADIUS,
            tiling: TilingScheme::default(),
            lod: LodConfig::default(),
            scheduler: SchedulerConfig::default(),
            cache: CacheConfig::default(),
            mesh: MeshConfig::default(),
            ordering: SwapOrdering::default(),
        }
    }

    pub fn with_globe_radius(mut self, radius: f64) -> Self {
        self.globe_radius = radius;
        self
    }

    pub fn with_tiling(mut self, tiling: TilingScheme) -> Self {
        self.tiling = tiling;
        self
    }

    pub fn with_lod(mut self, lod: LodConfig) -> Self {
        self.lod = lod;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_mesh(mut self, mesh: MeshConfig) -> Self {
        self.mesh = mesh;
        self
    }

    pub fn with_ordering(mut self, ordering: SwapOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Checks every setting is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.texture_group.trim().is_empty() {
            return Err(ConfigError::new("texture_group", "must not be empty"));
        }
        if !(self.globe_radius.is_finite() && self.globe_radius > 0.0) {
            return Err(ConfigError::new(
                "globe_radius",
                format!("must be positive, got {}", self.globe_radius),
            ));
        }
        if !(self.lod.max_pixel_error.is_finite() && self.lod.max_pixel_error > 0.0) {
            return Err(ConfigError::new(
                "max_pixel_error",
                format!("must be positive, got {}", self.lod.max_pixel_error),
            ));
        }
        if !(self.lod.merge_ratio > 0.0 && self.lod.merge_ratio < 1.0) {
            return Err(ConfigError::new(
                "merge_ratio",
                format!("must be between 0 and 1, got {}", self.lod.merge_ratio),
            ));
        }
        if self.lod.tile_texels == 0 {
            return Err(ConfigError::new("tile_texels", "must be at least 1"));
        }
        if self.lod.max_level > MAX_LEVEL {
            return Err(ConfigError::new(
                "max_level",
                format!("must be at most {}, got {}", MAX_LEVEL, self.lod.max_level),
            ));
        }
        if let Err(e) = self.tiling.check_depth(self.lod.max_level) {
            return Err(ConfigError::new("max_level", e.to_string()));
        }
        if self.scheduler.max_concurrent == 0 {
            return Err(ConfigError::new("max_concurrent", "must be at least 1"));
        }
        if self.scheduler.fetch_timeout.is_zero() {
            return Err(ConfigError::new("fetch_timeout", "must be non-zero"));
        }
        if self.cache.budget_bytes == 0 {
            return Err(ConfigError::new("cache budget", "must be non-zero"));
        }
        if self.mesh.tessellation == 0 || self.mesh.tessellation > MAX_TESSELLATION {
            return Err(ConfigError::new(
                "tessellation",
                format!(
                    "must be between 1 and {}, got {}",
                    MAX_TESSELLATION, self.mesh.tessellation
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.texture_group, DEFAULT_TEXTURE_GROUP);
        assert_eq!(config.ordering, SwapOrdering::AddThenRemove);
        assert_eq!(config.tiling.roots().len(), 4);
    }

    #[test]
    fn test_rejects_bad_merge_ratio() {
        let config = EngineConfig::default().with_lod(LodConfig::default().with_merge_ratio(1.0));
        let err = config.validate().unwrap_err();
        assert_eq!(err.field, "merge_ratio");
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let config = EngineConfig::default()
            .with_scheduler(SchedulerConfig::default().with_fetch_timeout(Duration::ZERO));
        assert_eq!(config.validate().unwrap_err().field, "fetch_timeout");
    }

    #[test]
    fn test_rejects_empty_group_and_radius() {
        assert!(EngineConfig::new(" ").validate().is_err());
        assert!(EngineConfig::default()
            .with_globe_radius(f64::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn test_rejects_root_grid_overflowing_at_max_level() {
        let tiling = TilingScheme::new(512, 256).unwrap();
        let deep = EngineConfig::default()
            .with_tiling(tiling)
            .with_lod(LodConfig::default().with_max_level(MAX_LEVEL));
        let err = deep.validate().unwrap_err();
        assert_eq!(err.field, "max_level");
        assert!(err.to_string().contains("512x256"));

        let shallow = deep.with_lod(LodConfig::default().with_max_level(8));
        assert!(shallow.validate().is_ok());
    }

    #[test]
    fn test_rejects_deep_max_level() {
        let config =
            EngineConfig::default().with_lod(LodConfig::default().with_max_level(MAX_LEVEL + 1));
        assert_eq!(config.validate().unwrap_err().field, "max_level");
    }
}
