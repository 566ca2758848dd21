//! Vector and cone types shared by listeners and sound sources.

pub use glam::Vec3;

use core::f32::consts::TAU;

/// Default facing direction for listeners and sources (right-handed, -Z forward).
pub const DEFAULT_DIRECTION: Vec3 = Vec3::new(0.0, 0.0, -1.0);

/// Default world-up vector.
pub const DEFAULT_WORLD_UP: Vec3 = Vec3::new(0.0, 1.0, 0.0);

/// A directional cone.
///
/// Angles are full apertures in radians, clamped to `[0, 2π]` with
/// `inner <= outer`. Outside the outer cone the gain is `outer_gain`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Cone {
    pub inner_angle: f32,
    pub outer_angle: f32,
    pub outer_gain: f32,
}

impl Default for Cone {
    fn default() -> Self {
        Self {
            inner_angle: TAU,
            outer_angle: TAU,
            outer_gain: 0.0,
        }
    }
}

impl Cone {
    /// Build a cone, silently clamping out-of-range input.
    pub fn new(inner_angle: f32, outer_angle: f32, outer_gain: f32) -> Self {
        let inner = sanitize(inner_angle, TAU).clamp(0.0, TAU);
        let outer = sanitize(outer_angle, TAU).clamp(inner, TAU);
        Self {
            inner_angle: inner,
            outer_angle: outer,
            outer_gain: sanitize(outer_gain, 0.0).max(0.0),
        }
    }

    /// Gain for a direction that deviates `angle` radians from the cone axis.
    pub fn gain_at(&self, angle: f32) -> f32 {
        let half_inner = self.inner_angle * 0.5;
        let half_outer = self.outer_angle * 0.5;

        if angle <= half_inner {
            1.0
        } else if angle >= half_outer {
            self.outer_gain
        } else {
            let t = (angle - half_inner) / (half_outer - half_inner);
            1.0 + (self.outer_gain - 1.0) * t
        }
    }

    /// Gain for a source facing `axis` heard along `towards`.
    ///
    /// A degenerate axis or direction is treated as "inside the cone".
    pub fn gain(&self, axis: Vec3, towards: Vec3) -> f32 {
        if self.inner_angle >= TAU {
            return 1.0;
        }
        let (Some(axis), Some(towards)) = (axis.try_normalize(), towards.try_normalize()) else {
            return 1.0;
        };
        let angle = axis.dot(towards).clamp(-1.0, 1.0).acos();
        self.gain_at(angle)
    }
}

/// Replace NaN with `fallback`.
#[inline]
pub(crate) fn sanitize(value: f32, fallback: f32) -> f32 {
    if value.is_nan() {
        fallback
    } else {
        value
    }
}

/// Replace any non-finite component with the matching component of `fallback`.
#[inline]
pub(crate) fn sanitize_vec(value: Vec3, fallback: Vec3) -> Vec3 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::f32::consts::{FRAC_PI_2, PI};

    #[test]
    fn clamps_inputs() {
        let cone = Cone::new(-1.0, 100.0, -0.5);
        assert_eq!(cone.inner_angle, 0.0);
        assert_eq!(cone.outer_angle, TAU);
        assert_eq!(cone.outer_gain, 0.0);

        let cone = Cone::new(2.0, 1.0, 0.5);
        assert_eq!(cone.outer_angle, 2.0);
    }

    #[test]
    fn interpolates_between_inner_and_outer() {
        let cone = Cone::new(FRAC_PI_2, PI, 0.25);
        assert_eq!(cone.gain_at(0.0), 1.0);
        assert_eq!(cone.gain_at(FRAC_PI_2 * 0.5), 1.0);
        assert_eq!(cone.gain_at(FRAC_PI_2), 0.25);
        assert_eq!(cone.gain_at(PI), 0.25);
        let mid = cone.gain_at((FRAC_PI_2 * 0.5 + FRAC_PI_2) * 0.5);
        assert!((mid - 0.625).abs() < 1e-6);
    }

    #[test]
    fn default_cone_is_omnidirectional() {
        let cone = Cone::default();
        assert_eq!(cone.gain(Vec3::Z, -Vec3::Z), 1.0);
    }
}
