//! The graph's mix destination.

use dasp_graph::{Buffer, Input};

use crate::node::{AudioNode, ProcessContext};
use crate::nodes::effect::mix_inputs;

/// Sums everything attached to it. Engine volume is applied when the block
/// is copied out of the graph.
pub(crate) struct Endpoint {
    channels: usize,
}

impl Endpoint {
    pub fn new(channels: usize) -> Self {
        Self { channels }
    }
}

impl AudioNode for Endpoint {
    fn process(&mut self, _ctx: &ProcessContext, inputs: &[Input], outputs: &mut [Buffer]) {
        mix_inputs(inputs, outputs);
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
