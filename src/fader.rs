//! Linear volume envelopes against the engine clock.

/// A time-bounded linear volume transition.
///
/// Times are absolute engine frames. Setting a new fade replaces the old one
/// outright; there is no blending between envelopes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fader {
    pub volume_begin: f32,
    pub volume_end: f32,
    pub frame_begin: u64,
    pub frame_length: u64,
}

impl Default for Fader {
    fn default() -> Self {
        Self::constant(1.0)
    }
}

impl Fader {
    /// A flat envelope at `volume`.
    pub fn constant(volume: f32) -> Self {
        Self {
            volume_begin: volume,
            volume_end: volume,
            frame_begin: 0,
            frame_length: 0,
        }
    }

    pub fn new(volume_begin: f32, volume_end: f32, frame_begin: u64, frame_length: u64) -> Self {
        Self {
            volume_begin,
            volume_end,
            frame_begin,
            frame_length,
        }
    }

    /// First frame at which the envelope holds `volume_end`.
    #[inline]
    pub fn frame_end(&self) -> u64 {
        self.frame_begin.saturating_add(self.frame_length)
    }

    /// Envelope volume at absolute frame `now`.
    #[inline]
    pub fn current_volume(&self, now: u64) -> f32 {
        if now <= self.frame_begin {
            return self.volume_begin;
        }
        if now >= self.frame_end() {
            return self.volume_end;
        }
        let t = (now - self.frame_begin) as f64 / self.frame_length as f64;
        (self.volume_begin as f64 + (self.volume_end as f64 - self.volume_begin as f64) * t) as f32
    }

    /// True while `now` lies inside the transition.
    #[inline]
    pub fn is_active(&self, now: u64) -> bool {
        self.frame_length > 0 && now < self.frame_end()
    }

    /// True if every frame in `[now, now + frames)` has the same volume.
    #[inline]
    pub fn is_flat_over(&self, now: u64, frames: u64) -> bool {
        self.volume_begin == self.volume_end
            || now >= self.frame_end()
            || now.saturating_add(frames) <= self.frame_begin
    }
}
