//! Bounding volumes for tiles on the sphere.

use glam::DVec3;

use super::GeoExtent;

/// Samples per edge used when fitting a bounding sphere to a tile.
const BOUNDS_SAMPLES: usize = 5;

/// Converts geodetic `(lon, lat)` in radians to a point on a sphere.
///
/// The frame is Earth-centered: +Z through the north pole, +X through
/// `(0°, 0°)`, +Y through `(90°E, 0°)`.
pub fn geodetic_to_cartesian(lon: f64, lat: f64, radius: f64) -> DVec3 {
    let cos_lat = lat.cos();
    DVec3::new(
        radius * cos_lat * lon.cos(),
        radius * cos_lat * lon.sin(),
        radius * lat.sin(),
    )
}

/// Bounding sphere of a tile patch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SphereBounds {
    /// Center in world space.
    pub center: DVec3,
    /// Radius in world units.
    pub radius: f64,
}

impl SphereBounds {
    /// Fits a bounding sphere around the patch of the globe covered by `extent`.
    ///
    /// The center is the midpoint of the sampled points' axis-aligned box and the
    /// radius the largest distance from it to any sample, so the sphere is
    /// conservative for the sampled surface.
    pub fn from_extent(extent: &GeoExtent, globe_radius: f64) -> Self {
        let mut min = DVec3::splat(f64::INFINITY);
        let mut max = DVec3::splat(f64::NEG_INFINITY);
        let mut samples = Vec::with_capacity(BOUNDS_SAMPLES * BOUNDS_SAMPLES);

        let steps = (BOUNDS_SAMPLES - 1) as f64;
        for i in 0..BOUNDS_SAMPLES {
            for j in 0..BOUNDS_SAMPLES {
                let lon = extent.west + extent.width() * (i as f64 / steps);
                let lat = extent.south + extent.height() * (j as f64 / steps);
                let p = geodetic_to_cartesian(lon, lat, globe_radius);
                min = min.min(p);
                max = max.max(p);
                samples.push(p);
            }
        }

        let center = (min + max) * 0.5;
        let radius = samples
            .iter()
            .map(|p| p.distance(center))
            .fold(0.0_f64, f64::max);

        Self { center, radius }
    }

    /// Distance from `point` to the sphere surface, zero when inside.
    pub fn distance_to(&self, point: DVec3) -> f64 {
        (point.distance(self.center) - self.radius).max(0.0)
    }

    /// Returns true if `point` lies inside the sphere.
    pub fn contains(&self, point: DVec3) -> bool {
        point.distance(self.center) <= self.radius
    }
}
