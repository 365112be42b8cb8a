//! Texture group sources.
//!
//! A texture group is a named set of per-tile images. The engine only needs
//! one operation from it: fetch the encoded image for a node, asynchronously,
//! or report a typed failure. Three reference sources ship with the crate:
//!
//! - [`DirectoryTextureGroup`]: `<root>/<group>/<level>/<x>_<y>.<ext>` on disk
//! - [`HttpTextureGroup`]: URL template over HTTP
//! - [`SyntheticTextureGroup`]: generated tiles with scriptable failures

mod directory;
mod http;
mod synthetic;

pub use directory::DirectoryTextureGroup;
pub use http::HttpTextureGroup;
pub use synthetic::SyntheticTextureGroup;

use std::future::Future;
use std::io::Cursor;
use std::pin::Pin;

use bytes::Bytes;
use thiserror::Error;

use crate::coord::NodeId;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Encoded texture bytes for one tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePayload {
    pub texture: Bytes,
}

impl TilePayload {
    pub fn new(texture: impl Into<Bytes>) -> Self {
        Self {
            texture: texture.into(),
        }
    }
}

/// Failures reported by a texture source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// The group has no image for this tile. Not retried.
    #[error("No texture for tile {0}")]
    NotFound(NodeId),

    /// I/O or network failure that may succeed on retry.
    #[error("Transient source failure: {0}")]
    Transient(String),
}

/// Asynchronous supplier of tile textures.
///
/// Uses [`BoxFuture`] rather than `async fn` so the engine can hold an
/// `Arc<dyn TextureSource>`.
pub trait TextureSource: Send + Sync + 'static {
    /// Texture group name, used in logs.
    fn name(&self) -> &str;

    /// Fetches the encoded texture for `node`.
    fn fetch(&self, node: NodeId) -> BoxFuture<'_, Result<TilePayload, SourceError>>;
}

/// Encodes a solid-colour RGBA image as PNG.
pub fn encode_png(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let image = image::RgbaImage::from_pixel(width, height, image::Rgba(rgba));
    let mut out = Cursor::new(Vec::new());
    // Writing a valid RgbaImage to memory cannot fail.
    if let Err(e) = image.write_to(&mut out, image::ImageFormat::Png) {
        tracing::error!(error = %e, "PNG encoding failed");
    }
    out.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_png_round_trips_through_image() {
        let png = encode_png(3, 2, [1, 2, 3, 4]);
        assert_eq!(&png[1..4], b"PNG");
        let decoded = image::load_from_memory(&png).unwrap().to_rgba8();
        assert_eq!(decoded.dimensions(), (3, 2));
        assert_eq!(decoded.get_pixel(2, 1).0, [1, 2, 3, 4]);
    }

    #[test]
    fn test_source_error_display() {
        let err = SourceError::NotFound(NodeId::new(3, 2, 5));
        assert_eq!(err.to_string(), "No texture for tile 3/2/5");
    }
}
