//! Turns fetched payloads into cache entries.

use std::sync::Arc;

use thiserror::Error;

use super::{TileImage, TileMesh};
use crate::cache::CacheEntry;
use crate::coord::{NodeId, TilingScheme};
use crate::source::TilePayload;

/// Errors decoding a tile payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TileBuildError {
    /// The texture bytes are not a decodable image.
    #[error("Failed to decode texture for {node}: {reason}")]
    Decode { node: NodeId, reason: String },

    /// The decoded image has no pixels.
    #[error("Texture for {0} is empty")]
    EmptyImage(NodeId),
}

/// Builds [`CacheEntry`]s from texture payloads.
///
/// Cheap to clone; fetch tasks each hold their own copy.
#[derive(Debug, Clone)]
pub struct TileBuilder {
    scheme: TilingScheme,
    globe_radius: f64,
    tessellation: u32,
}

impl TileBuilder {
    pub fn new(scheme: TilingScheme, globe_radius: f64, tessellation: u32) -> Self {
        Self {
            scheme,
            globe_radius,
            tessellation,
        }
    }

    /// Decodes the texture and generates the mesh for `node`.
    pub fn build(&self, node: NodeId, payload: &TilePayload) -> Result<CacheEntry, TileBuildError> {
        let texture = decode_texture(node, &payload.texture)?;
        let mesh = TileMesh::sphere_patch(
            &self.scheme.extent(node),
            self.globe_radius,
            self.tessellation,
        );
        Ok(CacheEntry::new(Arc::new(mesh), Arc::new(texture)))
    }
}

/// Decodes an encoded image (PNG, JPEG, ...) into RGBA8.
pub(crate) fn decode_texture(node: NodeId, bytes: &[u8]) -> Result<TileImage, TileBuildError> {
    let decoded = image::load_from_memory(bytes).map_err(|e| TileBuildError::Decode {
        node,
        reason: e.to_string(),
    })?;
    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    if width == 0 || height == 0 {
        return Err(TileBuildError::EmptyImage(node));
    }
    Ok(TileImage {
        width,
        height,
        pixels: rgba.into_raw(),
    })
}
