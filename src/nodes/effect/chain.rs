//! The per-node processing stages applied after a node has produced (or
//! summed) its raw frames: spatial gain and balance, user pan, volume and
//! the fade envelope.

use dasp_graph::Buffer;

use crate::node::{BlockWindow, NodeParams, NodeShared, ProcessContext};
use crate::spatializer::{apply_pan, spatialize, GainSmoother, PanMode, Spatialization};

pub(crate) struct EffectChain {
    params: NodeParams,
    spatial: Spatialization,
    spatial_gain: GainSmoother,
    volume: GainSmoother,
    primed: bool,
}

impl EffectChain {
    pub fn new(gain_smooth_frames: u32, volume_smooth_frames: u32) -> Self {
        Self {
            params: NodeParams::default(),
            spatial: Spatialization::IDENTITY,
            spatial_gain: GainSmoother::new(1.0, gain_smooth_frames),
            volume: GainSmoother::new(1.0, volume_smooth_frames),
            primed: false,
        }
    }

    /// Take this block's parameter snapshot and spatialize against it.
    pub fn prepare(&mut self, shared: &NodeShared, ctx: &ProcessContext) {
        self.params = shared.params();
        self.spatial = if self.params.spatialization {
            spatialize(&self.params.emitter, &ctx.listeners, self.params.pinned_listener)
        } else {
            Spatialization::IDENTITY
        };
        if !self.primed {
            self.spatial_gain.reset(self.spatial.gain);
            self.volume.reset(self.params.volume);
            self.primed = true;
        }
    }

    #[inline]
    pub fn params(&self) -> &NodeParams {
        &self.params
    }

    /// Doppler pitch from the last `prepare`.
    #[inline]
    pub fn doppler(&self) -> f32 {
        self.spatial.pitch
    }

    /// Apply the chain to the frames in `window`; everything else is silenced.
    pub fn apply(&mut self, ctx: &ProcessContext, outputs: &mut [Buffer], window: BlockWindow) {
        let BlockWindow { begin, end, .. } = window;
        for buf in outputs.iter_mut() {
            buf[..begin].iter_mut().for_each(|s| *s = 0.0);
            buf[end..].iter_mut().for_each(|s| *s = 0.0);
        }

        let params = self.params;
        let fader = params.fader;
        let flat = fader
            .is_flat_over(ctx.time, ctx.buffer_size as u64)
            .then(|| fader.current_volume(ctx.time));

        for i in begin..end {
            let fade = match flat {
                Some(v) => v,
                None => fader.current_volume(ctx.time.saturating_add(i as u64)),
            };
            let gain =
                self.spatial_gain.next(self.spatial.gain) * self.volume.next(params.volume) * fade;
            for buf in outputs.iter_mut() {
                buf[i] *= gain;
            }
        }

        if let [left, right] = outputs {
            let (left, right) = (&mut left[begin..end], &mut right[begin..end]);
            if params.spatialization {
                apply_pan(left, right, self.spatial.pan, PanMode::Balance, ctx.pan_law);
            }
            apply_pan(left, right, params.pan, params.pan_mode, ctx.pan_law);
        }
    }

    /// Silence every output for a block the node does not play in.
    pub fn silence(outputs: &mut [Buffer]) {
        for buf in outputs.iter_mut() {
            buf.silence();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fader::Fader;
    use crate::node::PlayState;

    fn ones() -> [Buffer; 2] {
        let one = || {
            let mut b = Buffer::SILENT;
            b.iter_mut().for_each(|s| *s = 1.0);
            b
        };
        [one(), one()]
    }

    fn ctx() -> ProcessContext {
        ProcessContext::new(48_000, 1, Default::default())
    }

    #[test]
    fn volume_and_window() {
        let shared = NodeShared::new(NodeParams::default(), PlayState::Playing);
        shared.update(|p| {
            p.volume = 0.5;
            p.spatialization = false;
        });
        let mut chain = EffectChain::new(0, 0);
        let ctx = ctx();
        chain.prepare(&shared, &ctx);

        let mut out = ones();
        let window = BlockWindow { begin: 16, end: 32, stops: false };
        chain.apply(&ctx, &mut out, window);
        assert_eq!(out[0][15], 0.0);
        assert_eq!(out[0][16], 0.5);
        assert_eq!(out[1][31], 0.5);
        assert_eq!(out[1][32], 0.0);
    }

    #[test]
    fn fade_is_per_frame() {
        let shared = NodeShared::new(NodeParams::default(), PlayState::Playing);
        shared.update(|p| {
            p.spatialization = false;
            p.fader = Fader::new(0.0, 1.0, 0, 64);
        });
        let mut chain = EffectChain::new(0, 0);
        let ctx = ctx();
        chain.prepare(&shared, &ctx);
        let mut out = ones();
        chain.apply(&ctx, &mut out, BlockWindow { begin: 0, end: 64, stops: false });
        assert_eq!(out[0][0], 0.0);
        assert_eq!(out[0][32], 0.5);
    }

    #[test]
    fn pan_only_on_stereo() {
        let shared = NodeShared::new(NodeParams::default(), PlayState::Playing);
        shared.update(|p| {
            p.spatialization = false;
            p.pan = 1.0;
        });
        let mut chain = EffectChain::new(0, 0);
        let ctx = ctx();
        chain.prepare(&shared, &ctx);
        let mut out = ones();
        chain.apply(&ctx, &mut out, BlockWindow { begin: 0, end: 64, stops: false });
        assert_eq!(out[0][10], 0.0);
        assert_eq!(out[1][10], 1.0);
    }
}
