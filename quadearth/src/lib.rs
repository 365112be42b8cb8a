//! QuadEarth - streaming textured globes from a spherical quad-tree.
//!
//! The globe is tiled into a quad-tree of geographic patches. Every frame the
//! engine decides which patches need geometry and texture at which
//! resolution, fetches imagery asynchronously from a texture group, and hands
//! finished drawables to the renderer through versioned scene snapshots.
//!
//! - [`coord`]: tile identities, extents and bounding spheres
//! - [`node`]: the quad-tree node store
//! - [`lod`]: camera-driven split, merge and fetch decisions
//! - [`loader`]: bounded-concurrency fetch scheduling with retry
//! - [`cache`]: memory-bounded LRU of decoded tiles with pinning
//! - [`drawable`]: renderer drawables built from cached tiles
//! - [`scene`]: atomic, versioned publishing to the renderer
//! - [`engine`]: the per-frame core and the layer façade
//! - [`source`]: texture groups (directory, HTTP, synthetic)

pub mod cache;
pub mod config;
pub mod coord;
pub mod drawable;
pub mod engine;
pub mod loader;
pub mod lod;
pub mod logging;
pub mod node;
pub mod scene;
pub mod source;
pub mod telemetry;
pub mod tile;

pub use engine::{LayerError, LayerHandle, QuadEarthLayer, TileEngine};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
