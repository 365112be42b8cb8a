//! Horizon culling against the globe.

use glam::DVec3;

/// Horizon test for a camera above a sphere centred at the origin.
#[derive(Clone, Debug)]
pub struct HorizonCuller {
    camera_pos: DVec3,
    radius: f64,
    camera_distance: f64,
    /// cos of the half-angle of the visible cap, seen from the globe center.
    cos_horizon: f64,
}

impl HorizonCuller {
    pub fn new(camera_pos: DVec3, radius: f64) -> Self {
        let camera_distance = camera_pos.length();
        let cos_horizon = if camera_distance > radius {
            radius / camera_distance
        } else {
            0.0
        };
        Self {
            camera_pos,
            radius,
            camera_distance,
            cos_horizon,
        }
    }

    /// True if a bounding sphere may be above the horizon.
    ///
    /// Conservative: the cap is widened by the sphere's angular radius.
    pub fn is_above_horizon(&self, center: DVec3, radius: f64) -> bool {
        if self.camera_distance <= self.radius {
            return true;
        }
        let center_dist = center.length();
        if center_dist < 1e-10 || radius >= center_dist {
            return true;
        }

        let cos_angle = center.dot(self.camera_pos) / (center_dist * self.camera_distance);
        let sin_margin = radius / center_dist;
        let cos_margin = (1.0 - sin_margin * sin_margin).max(0.0).sqrt();
        let sin_horizon = (1.0 - self.cos_horizon * self.cos_horizon).max(0.0).sqrt();
        // cos(horizon + margin)
        let threshold = self.cos_horizon * cos_margin - sin_horizon * sin_margin;

        cos_angle >= threshold
    }

    /// Height of the camera above the surface.
    pub fn camera_altitude(&self) -> f64 {
        (self.camera_distance - self.radius).max(0.0)
    }
}
