//! Mixing bus node backing a sound group.

use std::sync::Arc;

use dasp_graph::{Buffer, Input};

use super::chain::EffectChain;
use super::mixer::mix_inputs;
use crate::node::{AudioNode, NodeShared, ProcessContext};

/// Sums its children, then runs the group's own effect chain.
///
/// A stopped group silences its output; its children keep their own state.
pub(crate) struct GroupNode {
    pub(crate) shared: Arc<NodeShared>,
    pub(crate) chain: EffectChain,
    channels: usize,
}

impl GroupNode {
    pub fn new(shared: Arc<NodeShared>, channels: usize, chain: EffectChain) -> Self {
        Self {
            shared,
            chain,
            channels,
        }
    }
}

impl AudioNode for GroupNode {
    fn process(&mut self, ctx: &ProcessContext, inputs: &[Input], outputs: &mut [Buffer]) {
        let Some(window) = self
            .shared
            .begin_block(ctx.time, &self.chain.params().fader)
        else {
            EffectChain::silence(outputs);
            return;
        };

        mix_inputs(inputs, outputs);
        self.chain.apply(ctx, outputs, window);
        self.shared.end_block(window);
    }

    #[inline]
    fn num_inputs(&self) -> usize {
        self.channels
    }

    #[inline]
    fn num_outputs(&self) -> usize {
        self.channels
    }
}
