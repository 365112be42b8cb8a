//! Decoded tile artefacts.
//!
//! A loaded tile is a sphere-patch mesh plus the RGBA texture draped over it.
//! The mesh is generated locally from the tile's extent; only the texture
//! comes from the texture group.

mod builder;

pub use builder::{TileBuildError, TileBuilder};

use glam::DVec3;

use crate::coord::{geodetic_to_cartesian, GeoExtent};

/// Default number of mesh cells along each tile edge.
pub const DEFAULT_TESSELLATION: u32 = 16;

/// Sphere-patch mesh for one tile.
///
/// Positions are `f32` offsets from `center` so that vertex precision does
/// not degrade at globe scale.
#[derive(Debug, Clone, PartialEq)]
pub struct TileMesh {
    /// Origin the vertex positions are relative to.
    pub center: DVec3,
    pub positions: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
}

impl TileMesh {
    /// Builds a regular `tessellation × tessellation` grid over `extent`.
    pub fn sphere_patch(extent: &GeoExtent, globe_radius: f64, tessellation: u32) -> Self {
        let cells = tessellation.max(1);
        let verts_per_edge = cells + 1;
        let (center_lon, center_lat) = extent.center();
        let center = geodetic_to_cartesian(center_lon, center_lat, globe_radius);

        let vertex_count = (verts_per_edge * verts_per_edge) as usize;
        let mut positions = Vec::with_capacity(vertex_count);
        let mut uvs = Vec::with_capacity(vertex_count);

        for row in 0..verts_per_edge {
            let v = row as f64 / cells as f64;
            let lat = extent.south + extent.height() * v;
            for col in 0..verts_per_edge {
                let u = col as f64 / cells as f64;
                let lon = extent.west + extent.width() * u;
                let p = geodetic_to_cartesian(lon, lat, globe_radius) - center;
                positions.push([p.x as f32, p.y as f32, p.z as f32]);
                // Image rows run north to south.
                uvs.push([u as f32, (1.0 - v) as f32]);
            }
        }

        let mut indices = Vec::with_capacity((cells * cells * 6) as usize);
        for row in 0..cells {
            for col in 0..cells {
                let sw = row * verts_per_edge + col;
                let se = sw + 1;
                let nw = sw + verts_per_edge;
                let ne = nw + 1;
                indices.extend_from_slice(&[sw, se, ne, sw, ne, nw]);
            }
        }

        Self {
            center,
            positions,
            uvs,
            indices,
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Approximate memory held by the mesh buffers.
    pub fn footprint(&self) -> usize {
        self.positions.len() * std::mem::size_of::<[f32; 3]>()
            + self.uvs.len() * std::mem::size_of::<[f32; 2]>()
            + self.indices.len() * std::mem::size_of::<u32>()
    }
}

/// Decoded RGBA8 texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileImage {
    pub width: u32,
    pub height: u32,
    /// Row-major RGBA8 pixels, `width * height * 4` bytes.
    pub pixels: Vec<u8>,
}

impl TileImage {
    /// Approximate memory held by the pixel buffer.
    pub fn footprint(&self) -> usize {
        self.pixels.len()
    }
}
