//! Render-side node variants.
//!
//! The graph holds a closed set of node kinds:
//!
//! - [`SoundNode`] plays a data source through the resampler and its effect chain
//! - [`GroupNode`] sums its children and applies its own effect chain
//! - [`Endpoint`] sums everything attached to the engine
//!
//! They are dispatched through [`EngineNode`] by `match`, so the render path
//! has no virtual calls or per-node boxing.

pub(crate) mod effect;
pub(crate) mod sink;
pub(crate) mod source;

use dasp_graph::{Buffer, Input};

use crate::node::{AudioNode, NodeId, ProcessContext};

pub(crate) use effect::{EffectChain, GroupNode};
pub(crate) use sink::Endpoint;
pub(crate) use source::{SoundNode, SourceSlot};

pub(crate) enum EngineNode {
    Endpoint(Endpoint),
    Sound(SoundNode),
    Group(GroupNode),
}

impl AudioNode for EngineNode {
    fn process(&mut self, ctx: &ProcessContext, inputs: &[Input], outputs: &mut [Buffer]) {
        match self {
            EngineNode::Endpoint(n) => n.process(ctx, inputs, outputs),
            EngineNode::Sound(n) => n.process(ctx, inputs, outputs),
            EngineNode::Group(n) => n.process(ctx, inputs, outputs),
        }
    }

    fn num_inputs(&self) -> usize {
        match self {
            EngineNode::Endpoint(n) => n.num_inputs(),
            EngineNode::Sound(n) => n.num_inputs(),
            EngineNode::Group(n) => n.num_inputs(),
        }
    }

    fn num_outputs(&self) -> usize {
        match self {
            EngineNode::Endpoint(n) => n.num_outputs(),
            EngineNode::Sound(n) => n.num_outputs(),
            EngineNode::Group(n) => n.num_outputs(),
        }
    }
}

/// What the graph stores per node: the node and the context it renders with.
pub(crate) struct GraphNode {
    pub ctx: ProcessContext,
    pub node: EngineNode,
}

impl GraphNode {
    /// Refresh parameters for the coming block. Returns the pitch this
    /// node's children inherit.
    pub fn prepare(&mut self) -> f32 {
        match &mut self.node {
            EngineNode::Endpoint(_) => self.ctx.pitch,
            EngineNode::Sound(n) => {
                n.chain.prepare(&n.shared, &self.ctx);
                self.ctx.pitch
            }
            EngineNode::Group(n) => {
                n.chain.prepare(&n.shared, &self.ctx);
                self.ctx.pitch * n.chain.params().pitch
            }
        }
    }

    /// A sound that reached its end during the last block.
    pub fn take_ended(&mut self) -> Option<NodeId> {
        match &mut self.node {
            EngineNode::Sound(n) => n.take_ended(),
            _ => None,
        }
    }
}

impl dasp_graph::Node for GraphNode {
    fn process(&mut self, inputs: &[Input], outputs: &mut [Buffer]) {
        self.node.process(&self.ctx, inputs, outputs);
    }
}
