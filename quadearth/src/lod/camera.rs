//! Per-frame camera state.

use glam::DVec3;

use crate::coord::{geodetic_to_cartesian, SphereBounds};

/// Camera pose and viewport supplied with every update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraState {
    /// Eye position in the globe's Earth-centered frame.
    pub position: DVec3,
    /// Unit view direction.
    pub forward: DVec3,
    /// Vertical field of view in radians.
    pub fov_y: f64,
    pub viewport_width: u32,
    pub viewport_height: u32,
}

impl CameraState {
    /// Camera at `position` looking towards `target`.
    pub fn looking_at(
        position: DVec3,
        target: DVec3,
        fov_y: f64,
        viewport_width: u32,
        viewport_height: u32,
    ) -> Self {
        let forward = (target - position).try_normalize().unwrap_or(DVec3::NEG_Z);
        Self {
            position,
            forward,
            fov_y,
            viewport_width,
            viewport_height,
        }
    }

    /// Camera above `(lon, lat)` at `altitude`, looking at the globe center.
    pub fn orbit(
        lon: f64,
        lat: f64,
        altitude: f64,
        globe_radius: f64,
        fov_y: f64,
        viewport_width: u32,
        viewport_height: u32,
    ) -> Self {
        let position = geodetic_to_cartesian(lon, lat, globe_radius + altitude);
        Self::looking_at(position, DVec3::ZERO, fov_y, viewport_width, viewport_height)
    }

    pub fn aspect(&self) -> f64 {
        self.viewport_width.max(1) as f64 / self.viewport_height.max(1) as f64
    }

    /// Half-angle of the cone circumscribing the view frustum.
    pub fn half_cone_angle(&self) -> f64 {
        let half_tan = (self.fov_y * 0.5).tan();
        (half_tan * (1.0 + self.aspect() * self.aspect()).sqrt()).atan()
    }

    /// True if the bounding sphere may intersect the view cone.
    pub fn sees(&self, bounds: &SphereBounds) -> bool {
        let to_center = bounds.center - self.position;
        let distance = to_center.length();
        if distance <= bounds.radius {
            return true;
        }
        let cos_angle = to_center.dot(self.forward) / distance;
        let angle = cos_angle.clamp(-1.0, 1.0).acos();
        let angular_radius = (bounds.radius / distance).asin();
        angle - angular_radius <= self.half_cone_angle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_3;

    const RADIUS: f64 = 6_378_137.0;

    #[test]
    fn test_orbit_looks_at_center() {
        let camera = CameraState::orbit(0.0, 0.0, RADIUS, RADIUS, FRAC_PI_3, 1920, 1080);
        assert!((camera.position.length() - 2.0 * RADIUS).abs() < 1e-3);
        assert!((camera.forward - DVec3::NEG_X).length() < 1e-12);
    }

    #[test]
    fn test_sees_in_front_not_behind() {
        let camera = CameraState::looking_at(DVec3::ZERO, DVec3::X, FRAC_PI_3, 800, 600);
        let ahead = SphereBounds {
            center: DVec3::new(100.0, 10.0, 0.0),
            radius: 1.0,
        };
        let behind = SphereBounds {
            center: DVec3::new(-100.0, 0.0, 0.0),
            radius: 1.0,
        };
        let beside = SphereBounds {
            center: DVec3::new(0.0, 100.0, 0.0),
            radius: 5.0,
        };
        assert!(camera.sees(&ahead));
        assert!(!camera.sees(&behind));
        assert!(!camera.sees(&beside));
    }

    #[test]
    fn test_large_sphere_beside_is_seen() {
        let camera = CameraState::looking_at(DVec3::ZERO, DVec3::X, FRAC_PI_3, 800, 600);
        let huge = SphereBounds {
            center: DVec3::new(0.0, 100.0, 0.0),
            radius: 99.0,
        };
        assert!(camera.sees(&huge));
    }
}
