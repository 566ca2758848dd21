//! Listeners: the virtual ears sources are spatialized against.

use crate::math::{sanitize_vec, Cone, Vec3, DEFAULT_DIRECTION, DEFAULT_WORLD_UP};

/// Upper bound on listeners per engine.
pub const MAX_LISTENERS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Listener {
    pub position: Vec3,
    pub direction: Vec3,
    pub velocity: Vec3,
    pub world_up: Vec3,
    pub cone: Cone,
    pub enabled: bool,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            direction: DEFAULT_DIRECTION,
            velocity: Vec3::ZERO,
            world_up: DEFAULT_WORLD_UP,
            cone: Cone::default(),
            enabled: true,
        }
    }
}

impl Listener {
    /// Express a world-space offset from this listener in listener space
    /// (+X right, +Y up, -Z forward).
    pub fn to_local(&self, offset: Vec3) -> Vec3 {
        let forward = self.direction.try_normalize().unwrap_or(DEFAULT_DIRECTION);
        let right = forward
            .cross(self.world_up)
            .try_normalize()
            .unwrap_or(Vec3::X);
        let up = right.cross(forward);
        Vec3::new(offset.dot(right), offset.dot(up), -offset.dot(forward))
    }
}

/// Fixed-size listener set. Its size is chosen at engine creation.
///
/// The set is `Copy` so the render thread can take a consistent snapshot
/// each block.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ListenerSet {
    count: usize,
    listeners: [Listener; MAX_LISTENERS],
}

impl ListenerSet {
    /// `count` is clamped to `1..=MAX_LISTENERS`.
    pub fn new(count: usize) -> Self {
        Self {
            count: count.clamp(1, MAX_LISTENERS),
            listeners: [Listener::default(); MAX_LISTENERS],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, index: usize) -> Option<&Listener> {
        self.as_slice().get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Listener> {
        let count = self.count;
        self.listeners[..count].get_mut(index)
    }

    pub fn as_slice(&self) -> &[Listener] {
        &self.listeners[..self.count]
    }

    pub fn set_position(&mut self, index: usize, position: Vec3) {
        if let Some(l) = self.get_mut(index) {
            l.position = sanitize_vec(position, l.position);
        }
    }

    pub fn set_direction(&mut self, index: usize, direction: Vec3) {
        if let Some(l) = self.get_mut(index) {
            l.direction = sanitize_vec(direction, l.direction);
        }
    }

    pub fn set_velocity(&mut self, index: usize, velocity: Vec3) {
        if let Some(l) = self.get_mut(index) {
            l.velocity = sanitize_vec(velocity, l.velocity);
        }
    }

    pub fn set_world_up(&mut self, index: usize, world_up: Vec3) {
        if let Some(l) = self.get_mut(index) {
            l.world_up = sanitize_vec(world_up, l.world_up);
        }
    }

    pub fn set_cone(&mut self, index: usize, cone: Cone) {
        if let Some(l) = self.get_mut(index) {
            l.cone = cone;
        }
    }

    pub fn set_enabled(&mut self, index: usize, enabled: bool) {
        if let Some(l) = self.get_mut(index) {
            l.enabled = enabled;
        }
    }

    /// Index of the enabled listener nearest to `point`.
    ///
    /// Ties go to the lowest index. Returns 0 when no listener is enabled.
    pub fn closest(&self, point: Vec3) -> usize {
        let mut closest = 0;
        let mut best = f32::INFINITY;
        for (index, listener) in self.as_slice().iter().enumerate() {
            if !listener.enabled {
                continue;
            }
            let distance = listener.position.distance_squared(point);
            if distance < best {
                best = distance;
                closest = index;
            }
        }
        closest
    }

    /// The listener a source should be heard by: `pinned` if valid, else the nearest.
    pub fn resolve(&self, pinned: Option<usize>, point: Vec3) -> usize {
        match pinned {
            Some(index) if index < self.count => index,
            _ => self.closest(point),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closest_prefers_lowest_index_on_ties() {
        let mut set = ListenerSet::new(3);
        set.set_position(0, Vec3::new(5.0, 0.0, 0.0));
        set.set_position(1, Vec3::new(0.0, 2.0, 0.0));
        set.set_position(2, Vec3::new(0.0, 0.0, 2.0));
        assert_eq!(set.closest(Vec3::ZERO), 1);
    }

    #[test]
    fn closest_skips_disabled() {
        let mut set = ListenerSet::new(2);
        set.set_position(1, Vec3::new(10.0, 0.0, 0.0));
        set.set_enabled(0, false);
        assert_eq!(set.closest(Vec3::ZERO), 1);
        set.set_enabled(1, false);
        assert_eq!(set.closest(Vec3::ZERO), 0);
    }

    #[test]
    fn count_is_clamped_and_out_of_range_is_ignored() {
        let mut set = ListenerSet::new(0);
        assert_eq!(set.len(), 1);
        set.set_position(3, Vec3::ONE);
        assert!(set.get(3).is_none());
        assert_eq!(ListenerSet::new(64).len(), MAX_LISTENERS);
    }

    #[test]
    fn resolve_honours_valid_pin() {
        let mut set = ListenerSet::new(2);
        set.set_position(1, Vec3::new(100.0, 0.0, 0.0));
        assert_eq!(set.resolve(Some(1), Vec3::ZERO), 1);
        assert_eq!(set.resolve(Some(7), Vec3::ZERO), 0);
        assert_eq!(set.resolve(None, Vec3::new(99.0, 0.0, 0.0)), 1);
    }

    #[test]
    fn local_space_of_default_listener() {
        let listener = Listener::default();
        let local = listener.to_local(Vec3::new(1.0, 2.0, -3.0));
        assert!((local - Vec3::new(1.0, 2.0, -3.0)).length() < 1e-6);
    }
}
