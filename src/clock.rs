//! Engine clock.
//!
//! The render thread is the only writer of the rendered-frame counter. Control
//! threads rebase the clock by moving an offset, so `set_absolute` never
//! touches the counter a render in flight is about to advance.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic PCM-frame clock shared by the control and render contexts.
#[derive(Debug, Default)]
pub struct Clock {
    rendered: AtomicU64,
    offset: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current absolute time in PCM frames.
    #[inline]
    pub fn frames(&self) -> u64 {
        let rendered = self.rendered.load(Ordering::Acquire);
        rendered.wrapping_add(self.offset.load(Ordering::Acquire))
    }

    /// Advance by `frames`. Called by the render thread once per graph block.
    #[inline]
    pub fn advance(&self, frames: u64) {
        self.rendered.fetch_add(frames, Ordering::AcqRel);
    }

    /// Rebind the base so that the next [`frames`](Self::frames) returns `frames`.
    pub fn set_absolute(&self, frames: u64) {
        let rendered = self.rendered.load(Ordering::Acquire);
        self.offset
            .store(frames.wrapping_sub(rendered), Ordering::Release);
    }

    /// Total frames rendered since creation, unaffected by `set_absolute`.
    pub fn rendered(&self) -> u64 {
        self.rendered.load(Ordering::Acquire)
    }
}

/// Frames to milliseconds, rounding down.
#[inline]
pub fn frames_to_ms(frames: u64, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    ((frames as u128 * 1000) / sample_rate as u128) as u64
}

/// Milliseconds to frames, rounding up.
///
/// Paired with the flooring [`frames_to_ms`] this makes
/// `frames_to_ms(ms_to_frames(ms)) == ms` for every sample rate of at least 1 kHz.
#[inline]
pub fn ms_to_frames(ms: u64, sample_rate: u32) -> u64 {
    let num = ms as u128 * sample_rate as u128;
    ((num + 999) / 1000) as u64
}

/// Frames to seconds.
#[inline]
pub fn frames_to_seconds(frames: u64, sample_rate: u32) -> f32 {
    if sample_rate == 0 {
        return 0.0;
    }
    (frames as f64 / sample_rate as f64) as f32
}

/// Seconds to frames, rounding down. Negative input maps to frame 0.
#[inline]
pub fn seconds_to_frames(seconds: f32, sample_rate: u32) -> u64 {
    (seconds.max(0.0) as f64 * sample_rate as f64) as u64
}
