//! Linear-interpolating resampler for sound sources.
//!
//! Reads frames one at a time from a [`FrameSupply`] and steps through them
//! at an arbitrary rate, which covers both sample-rate conversion and pitch.

use dasp_graph::Buffer;

use crate::source::MAX_CHANNELS;

/// Largest source frames advanced per output frame.
pub(crate) const MAX_STEP: f64 = 16.0;

/// Result of pulling one source frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Fetch {
    /// A frame at this source index.
    Frame(u64),
    /// The source is exhausted.
    End,
    /// No data ready yet.
    Starved,
}

pub(crate) trait FrameSupply {
    fn channels(&self) -> usize;

    fn next_frame(&mut self, frame: &mut [f32; MAX_CHANNELS]) -> Fetch;
}

/// How a block render finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Complete,
    /// Ran out of ready data at this frame; the rest of the block is silent.
    Starved(usize),
    /// The source ended at this frame; the rest of the block is silent.
    Ended(usize),
}

enum Step {
    Ready,
    /// The supply just ended; the last real frame is still playing out.
    Drained,
    /// Nothing left at all.
    End,
    Starved,
}

pub(crate) struct Resampler {
    prev: [f32; MAX_CHANNELS],
    curr: [f32; MAX_CHANNELS],
    /// Fractional position between `prev` and `curr`.
    position: f64,
    filled: u8,
    draining: bool,
    prev_index: u64,
    curr_index: u64,
}

impl Resampler {
    pub fn new() -> Self {
        Self {
            prev: [0.0; MAX_CHANNELS],
            curr: [0.0; MAX_CHANNELS],
            position: 0.0,
            filled: 0,
            draining: false,
            prev_index: 0,
            curr_index: 0,
        }
    }

    /// Forget buffered frames; the next frame pulled is source frame `index`.
    pub fn reset(&mut self, index: u64) {
        *self = Self::new();
        self.prev_index = index;
        self.curr_index = index;
    }

    /// Source frame currently playing.
    #[inline]
    pub fn cursor(&self) -> u64 {
        self.prev_index
    }

    fn advance<S: FrameSupply>(&mut self, supply: &mut S) -> Step {
        if self.draining {
            self.prev_index = self.curr_index;
            return Step::End;
        }
        let mut next = [0.0; MAX_CHANNELS];
        match supply.next_frame(&mut next) {
            Fetch::Frame(index) => {
                self.prev = self.curr;
                self.curr = next;
                self.prev_index = self.curr_index;
                self.curr_index = index;
                Step::Ready
            }
            Fetch::End => {
                self.prev = self.curr;
                self.curr = [0.0; MAX_CHANNELS];
                self.prev_index = self.curr_index;
                self.curr_index += 1;
                self.draining = true;
                Step::Drained
            }
            Fetch::Starved => Step::Starved,
        }
    }

    /// Render frames `[begin, end)` of `outputs`, advancing `step` source
    /// frames per output frame.
    pub fn render<S: FrameSupply>(
        &mut self,
        supply: &mut S,
        step: f64,
        outputs: &mut [Buffer],
        begin: usize,
        end: usize,
    ) -> Outcome {
        while self.filled < 2 {
            match self.advance(supply) {
                Step::Ready => self.filled += 1,
                Step::Drained if self.filled > 0 => self.filled = 2,
                Step::Drained | Step::End => {
                    silence(outputs, begin, end);
                    return Outcome::Ended(begin);
                }
                Step::Starved => {
                    silence(outputs, begin, end);
                    return Outcome::Starved(begin);
                }
            }
        }

        let channels = supply.channels().clamp(1, MAX_CHANNELS);
        let mut frame = [0.0f32; MAX_CHANNELS];
        for i in begin..end {
            while self.position >= 1.0 {
                match self.advance(supply) {
                    Step::Ready | Step::Drained => self.position -= 1.0,
                    Step::End => {
                        silence(outputs, i, end);
                        return Outcome::Ended(i);
                    }
                    Step::Starved => {
                        silence(outputs, i, end);
                        return Outcome::Starved(i);
                    }
                }
            }

            let t = self.position as f32;
            for ch in 0..channels {
                let prev = self.prev[ch];
                frame[ch] = prev + t * (self.curr[ch] - prev);
            }
            map_channels(&frame[..channels], outputs, i);

            self.position += step;
        }
        Outcome::Complete
    }
}

/// Write one source frame to output frame `i`.
///
/// Mono is duplicated, a mono bus gets the average, anything else maps
/// channel `c` to source channel `c % source_channels`.
fn map_channels(frame: &[f32], outputs: &mut [Buffer], i: usize) {
    if outputs.len() == 1 && frame.len() > 1 {
        outputs[0][i] = frame.iter().sum::<f32>() / frame.len() as f32;
        return;
    }
    for (ch, buf) in outputs.iter_mut().enumerate() {
        buf[i] = frame[ch % frame.len()];
    }
}

fn silence(outputs: &mut [Buffer], from: usize, to: usize) {
    for buf in outputs.iter_mut() {
        buf[from..to].iter_mut().for_each(|s| *s = 0.0);
    }
}
