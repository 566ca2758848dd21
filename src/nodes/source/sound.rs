//! Leaf node playing a data source.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use dasp_graph::{Buffer, Input};

use super::resampler::{Fetch, FrameSupply, Outcome, Resampler, MAX_STEP};
use crate::error::Error;
use crate::node::{AudioNode, NodeId, NodeShared, ProcessContext, NO_TIME};
use crate::nodes::effect::EffectChain;
use crate::resource::{LoadStatus, ResourceEntry, StreamReader};
use crate::source::{DataSource, MemorySource, MAX_CHANNELS};

/// Frames read from the source per refill.
const FETCH_FRAMES: usize = 256;

/// Where a sound node reads from.
pub(crate) enum SourceSlot {
    Memory(MemorySource),
    /// Decoded data that arrived after the node was created. The entry stays
    /// with the node so its last reference is never dropped while rendering.
    Loaded(MemorySource, Arc<ResourceEntry>),
    Stream(StreamReader),
    Custom(Box<dyn DataSource>),
    /// An asynchronous decode that has not finished yet, or failed.
    Pending(Arc<ResourceEntry>),
    Failed,
}

impl SourceSlot {
    /// Swap a finished pending load for its data. Never allocates.
    fn resolve(&mut self) {
        let SourceSlot::Pending(entry) = self else {
            return;
        };
        if entry.status() != LoadStatus::Ready {
            return;
        }
        let Some(buffer) = entry.buffer().cloned() else {
            return;
        };
        let entry = entry.clone();
        *self = SourceSlot::Loaded(MemorySource::new(buffer), entry);
    }

    fn as_source(&mut self) -> Option<&mut dyn DataSource> {
        match self {
            SourceSlot::Memory(s) | SourceSlot::Loaded(s, _) => Some(s),
            SourceSlot::Stream(s) => Some(s),
            SourceSlot::Custom(s) => Some(s.as_mut()),
            SourceSlot::Pending(_) | SourceSlot::Failed => None,
        }
    }
}

/// Read-ahead buffer between a data source and the resampler.
struct Fetcher {
    buf: Vec<f32>,
    frames: usize,
    pos: usize,
    next_index: u64,
}

impl Fetcher {
    fn new() -> Self {
        Self {
            buf: vec![0.0; FETCH_FRAMES * MAX_CHANNELS],
            frames: 0,
            pos: 0,
            next_index: 0,
        }
    }

    fn reset(&mut self, index: u64) {
        self.frames = 0;
        self.pos = 0;
        self.next_index = index;
    }

    fn refill(&mut self, source: &mut dyn DataSource, looping: bool) -> Option<Fetch> {
        self.pos = 0;
        self.frames = 0;
        match source.read_frames(&mut self.buf, FETCH_FRAMES) {
            Ok(n) if n > 0 => {
                self.frames = n;
                return None;
            }
            Ok(_) | Err(Error::AtEnd) => {}
            Err(_) => return Some(Fetch::Starved),
        }

        // A source that ends before producing anything would loop forever.
        if !looping || self.next_index == 0 || source.seek_to_frame(0).is_err() {
            return Some(Fetch::End);
        }
        self.next_index = 0;
        match source.read_frames(&mut self.buf, FETCH_FRAMES) {
            Ok(n) if n > 0 => {
                self.frames = n;
                None
            }
            Ok(_) | Err(Error::AtEnd) => Some(Fetch::End),
            Err(_) => Some(Fetch::Starved),
        }
    }
}

struct SourceSupply<'a> {
    fetcher: &'a mut Fetcher,
    source: &'a mut dyn DataSource,
    looping: bool,
    channels: usize,
}

impl FrameSupply for SourceSupply<'_> {
    fn channels(&self) -> usize {
        self.channels
    }

    fn next_frame(&mut self, frame: &mut [f32; MAX_CHANNELS]) -> Fetch {
        if self.fetcher.pos >= self.fetcher.frames {
            if let Some(status) = self.fetcher.refill(self.source, self.looping) {
                return status;
            }
        }
        let ch = self.channels;
        let start = self.fetcher.pos * ch;
        frame[..ch].copy_from_slice(&self.fetcher.buf[start..start + ch]);
        self.fetcher.pos += 1;
        self.fetcher.next_index += 1;
        Fetch::Frame(self.fetcher.next_index - 1)
    }
}

pub(crate) struct SoundNode {
    id: NodeId,
    pub(crate) shared: Arc<NodeShared>,
    pub(crate) chain: EffectChain,
    slot: SourceSlot,
    fetcher: Fetcher,
    resampler: Resampler,
    channels: usize,
    no_pitch: bool,
    ended: bool,
}

impl SoundNode {
    pub fn new(
        id: NodeId,
        shared: Arc<NodeShared>,
        slot: SourceSlot,
        channels: usize,
        no_pitch: bool,
        chain: EffectChain,
    ) -> Self {
        Self {
            id,
            shared,
            chain,
            slot,
            fetcher: Fetcher::new(),
            resampler: Resampler::new(),
            channels,
            no_pitch,
            ended: false,
        }
    }

    /// The id of this sound if it reached its end since the last call.
    pub fn take_ended(&mut self) -> Option<NodeId> {
        core::mem::take(&mut self.ended).then_some(self.id)
    }
}

impl AudioNode for SoundNode {
    fn process(&mut self, ctx: &ProcessContext, _inputs: &[Input], outputs: &mut [Buffer]) {
        self.slot.resolve();

        if let Some(source) = self.slot.as_source() {
            let target = self.shared.seek_target.swap(NO_TIME, Ordering::AcqRel);
            if target != NO_TIME && source.seek_to_frame(target).is_ok() {
                self.fetcher.reset(target);
                self.resampler.reset(target);
            }
        }

        let Some(mut window) = self
            .shared
            .begin_block(ctx.time, &self.chain.params().fader)
        else {
            EffectChain::silence(outputs);
            return;
        };

        let looping = self.shared.looping.load(Ordering::Acquire);
        if let SourceSlot::Stream(reader) = &self.slot {
            reader.set_looping(looping);
        }

        let Some(source) = self.slot.as_source() else {
            EffectChain::silence(outputs);
            self.shared.end_block(window);
            return;
        };

        let format = source.format();
        let params = self.chain.params();
        let mut step = format.sample_rate as f64 / ctx.sample_rate as f64;
        if !self.no_pitch {
            step *= (params.pitch * ctx.pitch * self.chain.doppler()) as f64;
        }

        let mut supply = SourceSupply {
            fetcher: &mut self.fetcher,
            source,
            looping,
            channels: format.channels.clamp(1, MAX_CHANNELS),
        };
        let outcome = self.resampler.render(
            &mut supply,
            step.clamp(0.0, MAX_STEP),
            outputs,
            window.begin,
            window.end,
        );

        let mut exhausted = false;
        if let Outcome::Ended(at) = outcome {
            if !looping {
                window.end = at;
                exhausted = true;
            }
        }

        self.chain.apply(ctx, outputs, window);
        self.shared.end_block(window);
        self.shared
            .cursor
            .store(self.resampler.cursor(), Ordering::Release);

        if exhausted {
            self.shared.at_end.store(true, Ordering::Release);
            if self.shared.finish_playback() && !self.shared.ended.swap(true, Ordering::AcqRel) {
                self.ended = true;
            }
        }
    }

    fn num_inputs(&self) -> usize {
        0
    }

    #[inline]
    fn num_outputs(&self) -> usize {
        self.channels
    }
}
