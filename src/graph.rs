//! Node graph: control-side topology plus the render-side arena.
//!
//! Control threads never touch the arena directly. Every structural change is
//! validated against [`Topology`], a plain mirror of the attachment tree, and
//! then shipped to the [`Renderer`] as a [`Command`] through an `rtrb` ring.
//! The renderer drains the ring at the start of each render call, so a render
//! always sees one consistent topology.
//!
//! Removed nodes leave the arena on the render thread and are handed back
//! through a second ring, the graveyard, to be dropped on a control thread.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use dasp_graph::{Buffer, NodeData, Processor};
use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction::{Incoming, Outgoing};
use rtrb::{Consumer, Producer, PushError, RingBuffer};
use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::engine::EngineEvent;
use crate::error::{Error, Result};
use crate::listener::ListenerSet;
use crate::node::{AudioNode, NodeId, ProcessContext, BLOCK_FRAMES};
use crate::nodes::{Endpoint, EngineNode, GraphNode};
use crate::spatializer::PanLaw;

type Arena = StableGraph<NodeData<GraphNode>, ()>;

/// What a node is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Endpoint,
    Sound,
    Group,
}

/// State shared by the whole engine and read by the renderer every block.
#[derive(Debug)]
pub(crate) struct GraphState {
    pub clock: Clock,
    pub listeners: AtomicCell<ListenerSet>,
    /// Engine volume as `f32` bits.
    pub volume: AtomicU32,
    /// Completed render calls.
    pub epoch: AtomicU64,
}

impl GraphState {
    pub fn new(listener_count: usize) -> Self {
        Self {
            clock: Clock::new(),
            listeners: AtomicCell::new(ListenerSet::new(listener_count)),
            volume: AtomicU32::new(1.0f32.to_bits()),
            epoch: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume.to_bits(), Ordering::Release);
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct GraphConfig {
    pub channels: usize,
    pub sample_rate: u32,
    pub listener_count: usize,
    pub pan_law: PanLaw,
    pub max_nodes: usize,
    pub command_queue_capacity: usize,
}

/// Structural change, applied by the renderer at the next render boundary.
pub(crate) enum Command {
    Insert {
        id: NodeId,
        node: NodeData<GraphNode>,
    },
    Attach {
        child: NodeId,
        parent: NodeId,
    },
    Detach {
        child: NodeId,
    },
    Remove {
        id: NodeId,
    },
}

#[derive(Clone, Copy, Debug)]
struct TopoNode {
    kind: NodeKind,
    inputs: usize,
    outputs: usize,
    parent: Option<NodeId>,
}

/// Control-side mirror of the attachment tree.
#[derive(Debug, Default)]
pub(crate) struct Topology {
    nodes: HashMap<NodeId, TopoNode>,
}

impl Topology {
    fn insert(&mut self, id: NodeId, kind: NodeKind, inputs: usize, outputs: usize) {
        self.nodes.insert(
            id,
            TopoNode {
                kind,
                inputs,
                outputs,
                parent: None,
            },
        );
    }

    /// Would attaching `child` under `parent` keep the graph a well-formed tree?
    fn check_attach(&self, child: NodeId, parent: NodeId) -> Result<()> {
        let c = self.nodes.get(&child).ok_or(Error::InvalidArgs)?;
        let p = self.nodes.get(&parent).ok_or(Error::InvalidArgs)?;

        if c.kind == NodeKind::Endpoint || p.inputs == 0 || c.outputs != p.inputs {
            return Err(Error::InvalidOperation);
        }

        // Walk up from the parent; meeting the child means a cycle.
        let mut cursor = Some(parent);
        while let Some(id) = cursor {
            if id == child {
                return Err(Error::InvalidOperation);
            }
            cursor = self.nodes.get(&id).and_then(|n| n.parent);
        }
        Ok(())
    }

    fn set_parent(&mut self, child: NodeId, parent: Option<NodeId>) {
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parent = parent;
        }
    }

    fn remove(&mut self, id: NodeId) {
        self.nodes.remove(&id);
    }

    fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|n| n.parent)
    }

    fn children(&self, id: NodeId) -> Vec<NodeId> {
        let mut children: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.parent == Some(id))
            .map(|(&child, _)| child)
            .collect();
        children.sort_unstable();
        children
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }
}

/// The render-side half: the arena, the processor and the block loop.
///
/// Lives behind the [`RenderSlot`] mutex. Nothing in here allocates once the
/// engine is built: the arena, index map and traversal queue are sized for
/// `max_nodes` up front.
pub(crate) struct Renderer {
    arena: Arena,
    processor: Processor<Arena>,
    indices: HashMap<NodeId, NodeIndex>,
    endpoint: NodeIndex,
    commands: Consumer<Command>,
    graveyard: Producer<NodeData<GraphNode>>,
    events: Producer<EngineEvent>,
    state: Arc<GraphState>,
    base: ProcessContext,
    channels: usize,
    queue: Vec<NodeIndex>,
    carry: Vec<f32>,
    carry_pos: usize,
}

impl Renderer {
    /// Apply every queued structural change.
    pub fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.pop() {
            match command {
                Command::Insert { id, node } => {
                    let index = self.arena.add_node(node);
                    self.indices.insert(id, index);
                }
                Command::Attach { child, parent } => {
                    if let (Some(&c), Some(&p)) = (self.indices.get(&child), self.indices.get(&parent)) {
                        self.unlink(c);
                        self.arena.add_edge(c, p, ());
                    }
                }
                Command::Detach { child } => {
                    if let Some(&c) = self.indices.get(&child) {
                        self.unlink(c);
                    }
                }
                Command::Remove { id } => {
                    let Some(index) = self.indices.remove(&id) else {
                        continue;
                    };
                    if let Some(data) = self.arena.remove_node(index) {
                        if let Err(PushError::Full(data)) = self.graveyard.push(data) {
                            warn!("graveyard full, dropping node on the render thread");
                            drop(data);
                        }
                    }
                }
            }
        }
    }

    fn unlink(&mut self, child: NodeIndex) {
        loop {
            let Some(edge) = self.arena.edges_directed(child, Outgoing).next().map(|e| e.id())
            else {
                break;
            };
            self.arena.remove_edge(edge);
        }
    }

    /// Breadth-first from the endpoint: hand every reachable node its
    /// context for this block, parents before children.
    fn prepare(&mut self, base: ProcessContext) {
        self.queue.clear();
        self.arena[self.endpoint].node.ctx = base;
        self.queue.push(self.endpoint);

        let mut head = 0;
        while head < self.queue.len() {
            let index = self.queue[head];
            head += 1;
            let pitch = self.arena[index].node.prepare();

            let mut children = self.arena.neighbors_directed(index, Incoming).detach();
            while let Some(child) = children.next_node(&self.arena) {
                self.arena[child].node.ctx = ProcessContext { pitch, ..base };
                self.queue.push(child);
            }
        }
    }

    fn render_block(&mut self) {
        let mut base = self.base;
        base.time = self.state.clock.frames();
        base.listeners = self.state.listeners.load();

        self.prepare(base);
        self.processor.process(&mut self.arena, self.endpoint);

        for i in 0..self.queue.len() {
            let index = self.queue[i];
            if let Some(id) = self.arena[index].node.take_ended() {
                if self.events.push(EngineEvent::SoundEnded { id }).is_err() {
                    warn!(id = id.raw(), "event queue full, end notification lost");
                }
            }
        }

        let volume = self.state.volume();
        let out = &self.arena[self.endpoint].buffers;
        for (frame, samples) in self.carry.chunks_exact_mut(self.channels).enumerate() {
            for (sample, buf) in samples.iter_mut().zip(out.iter()) {
                *sample = buf[frame] * volume;
            }
        }

        self.state.clock.advance(BLOCK_FRAMES as u64);
    }

    /// Fill `out` with interleaved frames. Any length that is a whole number
    /// of frames works; leftover frames of the last block carry over.
    pub fn render(&mut self, out: &mut [f32]) {
        self.apply_commands();

        let mut written = 0;
        while written < out.len() {
            if self.carry_pos >= self.carry.len() {
                self.render_block();
                self.carry_pos = 0;
            }
            let n = (self.carry.len() - self.carry_pos).min(out.len() - written);
            out[written..written + n]
                .copy_from_slice(&self.carry[self.carry_pos..self.carry_pos + n]);
            written += n;
            self.carry_pos += n;
        }

        self.state.epoch.fetch_add(1, Ordering::Release);
    }
}

/// The real-time entry point handed to backends.
///
/// Cloning yields another handle to the same renderer.
#[derive(Clone)]
pub struct RenderSlot {
    renderer: Arc<Mutex<Renderer>>,
    channels: usize,
    sample_rate: u32,
}

impl RenderSlot {
    /// Render interleaved frames into `out`.
    ///
    /// Never blocks: if a control thread holds the renderer, this block is
    /// silence.
    pub fn render(&self, out: &mut [f32]) {
        match self.renderer.try_lock() {
            Some(mut renderer) => renderer.render(out),
            None => out.fill(0.0),
        }
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Renderer> {
        self.renderer.lock()
    }
}

/// Attachment graph of an engine.
///
/// All methods are callable from any control thread. Structural errors leave
/// the graph untouched.
pub struct NodeGraph {
    topology: Mutex<Topology>,
    commands: Mutex<Producer<Command>>,
    graveyard: Mutex<Consumer<NodeData<GraphNode>>>,
    slot: RenderSlot,
    /// A backend is rendering; commands wait for the render thread.
    realtime: AtomicBool,
    endpoint: NodeId,
    next_id: AtomicU32,
    max_nodes: usize,
    base: ProcessContext,
}

impl NodeGraph {
    pub(crate) fn new(
        config: GraphConfig,
        state: Arc<GraphState>,
        events: Producer<EngineEvent>,
    ) -> Self {
        let max_nodes = config.max_nodes.max(1);
        let channels = config.channels.max(1);
        let base = ProcessContext::new(config.sample_rate, config.listener_count, config.pan_law);

        let (commands_tx, commands_rx) = RingBuffer::new(config.command_queue_capacity.max(16));
        let (graveyard_tx, graveyard_rx) = RingBuffer::new(max_nodes);

        let endpoint_id = NodeId(0);
        let mut arena = Arena::with_capacity(max_nodes, max_nodes);
        let endpoint = arena.add_node(node_data(
            base,
            EngineNode::Endpoint(Endpoint::new(channels)),
        ));
        let mut indices = HashMap::with_capacity(max_nodes);
        indices.insert(endpoint_id, endpoint);

        let mut topology = Topology::default();
        topology.insert(endpoint_id, NodeKind::Endpoint, channels, channels);

        let renderer = Renderer {
            arena,
            processor: Processor::with_capacity(max_nodes),
            indices,
            endpoint,
            commands: commands_rx,
            graveyard: graveyard_tx,
            events,
            state,
            base,
            channels,
            queue: Vec::with_capacity(max_nodes),
            carry: vec![0.0; BLOCK_FRAMES * channels],
            carry_pos: BLOCK_FRAMES * channels,
        };

        debug!(channels, sample_rate = config.sample_rate, max_nodes, "node graph created");

        Self {
            topology: Mutex::new(topology),
            commands: Mutex::new(commands_tx),
            graveyard: Mutex::new(graveyard_rx),
            slot: RenderSlot {
                renderer: Arc::new(Mutex::new(renderer)),
                channels,
                sample_rate: config.sample_rate,
            },
            realtime: AtomicBool::new(false),
            endpoint: endpoint_id,
            next_id: AtomicU32::new(1),
            max_nodes,
            base,
        }
    }

    /// The mix destination.
    #[inline]
    pub fn endpoint(&self) -> NodeId {
        self.endpoint
    }

    pub fn render_slot(&self) -> RenderSlot {
        self.slot.clone()
    }

    pub(crate) fn set_realtime(&self, realtime: bool) {
        self.realtime.store(realtime, Ordering::Release);
        if !realtime {
            self.flush();
        }
    }

    /// Apply queued commands now if no backend is rendering.
    fn flush(&self) {
        if !self.realtime.load(Ordering::Acquire) {
            self.slot.lock().apply_commands();
        }
    }

    fn submit(&self, command: Command) -> Result<()> {
        if self.commands.lock().push(command).is_err() {
            warn!("command queue full");
            return Err(Error::Busy);
        }
        self.flush();
        Ok(())
    }

    /// Add a node built by `build` from its new id. It starts detached.
    pub(crate) fn insert(
        &self,
        kind: NodeKind,
        build: impl FnOnce(NodeId) -> EngineNode,
    ) -> Result<NodeId> {
        let mut topology = self.topology.lock();
        if topology.len() >= self.max_nodes {
            warn!(max_nodes = self.max_nodes, "node graph full");
            return Err(Error::OutOfMemory);
        }

        let id = NodeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let node = build(id);
        let (inputs, outputs) = (node.num_inputs(), node.num_outputs());
        self.submit(Command::Insert {
            id,
            node: node_data(self.base, node),
        })?;
        topology.insert(id, kind, inputs, outputs);
        trace!(id = id.raw(), ?kind, "node inserted");
        Ok(id)
    }

    /// Attach `child` to `parent`'s input bus, detaching it from any previous
    /// parent.
    ///
    /// Fails with [`Error::InvalidOperation`] if this would create a cycle or
    /// the bus shapes differ.
    pub fn attach(&self, child: NodeId, parent: NodeId) -> Result<()> {
        let mut topology = self.topology.lock();
        topology.check_attach(child, parent)?;
        self.submit(Command::Attach { child, parent })?;
        topology.set_parent(child, Some(parent));
        trace!(child = child.raw(), parent = parent.raw(), "node attached");
        Ok(())
    }

    /// Detach `child` from its parent. Detaching a detached node is a no-op.
    ///
    /// Takes effect at the next render boundary.
    pub fn detach(&self, child: NodeId) -> Result<()> {
        let mut topology = self.topology.lock();
        if !topology.contains(child) {
            return Err(Error::InvalidArgs);
        }
        if topology.parent(child).is_none() {
            return Ok(());
        }
        self.submit(Command::Detach { child })?;
        topology.set_parent(child, None);
        trace!(child = child.raw(), "node detached");
        Ok(())
    }

    /// Remove a node. Its children are detached first.
    pub(crate) fn remove(&self, id: NodeId) -> Result<()> {
        if id == self.endpoint {
            return Err(Error::InvalidOperation);
        }
        let mut topology = self.topology.lock();
        if !topology.contains(id) {
            return Ok(());
        }
        for child in topology.children(id) {
            self.submit_patiently(Command::Detach { child })?;
            topology.set_parent(child, None);
        }
        self.submit_patiently(Command::Remove { id })?;
        topology.remove(id);
        drop(topology);

        trace!(id = id.raw(), "node removed");
        self.collect_garbage();
        Ok(())
    }

    /// Like `submit`, but gives a running render thread a moment to drain a
    /// full queue. Used where giving up would leak a node.
    fn submit_patiently(&self, mut command: Command) -> Result<()> {
        for _ in 0..100 {
            let pushed = self.commands.lock().push(command);
            match pushed {
                Ok(()) => {
                    self.flush();
                    return Ok(());
                }
                Err(PushError::Full(c)) if self.realtime.load(Ordering::Acquire) => {
                    command = c;
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(_) => break,
            }
        }
        warn!("command queue full");
        Err(Error::Busy)
    }

    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.topology.lock().parent(id)
    }

    /// Children attached to `id`, in id order.
    pub fn children_of(&self, id: NodeId) -> Vec<NodeId> {
        self.topology.lock().children(id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.topology.lock().contains(id)
    }

    pub fn kind_of(&self, id: NodeId) -> Option<NodeKind> {
        self.topology.lock().nodes.get(&id).map(|n| n.kind)
    }

    /// Number of nodes, the endpoint included.
    pub fn node_count(&self) -> usize {
        self.topology.lock().len()
    }

    /// Drop nodes the renderer has released. Returns how many were freed.
    pub fn collect_garbage(&self) -> usize {
        let mut graveyard = self.graveyard.lock();
        let mut freed = 0;
        while let Ok(node) = graveyard.pop() {
            drop(node);
            freed += 1;
        }
        freed
    }

    /// Render synchronously from a control thread.
    pub(crate) fn read(&self, out: &mut [f32]) {
        self.slot.lock().render(out);
    }
}

fn node_data(base: ProcessContext, node: EngineNode) -> NodeData<GraphNode> {
    let buffers = (0..node.num_outputs().max(1)).map(|_| Buffer::SILENT).collect();
    NodeData::new(GraphNode { ctx: base, node }, buffers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeParams, NodeShared, PlayState};
    use crate::nodes::{EffectChain, GroupNode};

    fn graph(channels: usize) -> (NodeGraph, Arc<GraphState>, Consumer<EngineEvent>) {
        let state = Arc::new(GraphState::new(1));
        let (tx, rx) = RingBuffer::new(16);
        let config = GraphConfig {
            channels,
            sample_rate: 48_000,
            listener_count: 1,
            pan_law: PanLaw::default(),
            max_nodes: 16,
            command_queue_capacity: 16,
        };
        (NodeGraph::new(config, state.clone(), tx), state, rx)
    }

    fn group(graph: &NodeGraph, channels: usize) -> NodeId {
        graph
            .insert(NodeKind::Group, |_| {
                let shared = Arc::new(NodeShared::new(NodeParams::default(), PlayState::Playing));
                EngineNode::Group(GroupNode::new(shared, channels, EffectChain::new(0, 0)))
            })
            .unwrap()
    }

    #[test]
    fn empty_graph_renders_silence() {
        let (graph, state, _) = graph(2);
        let mut out = vec![1.0; 2 * 100];
        graph.read(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(state.clock.frames(), 128);
        assert_eq!(state.epoch.load(Ordering::Acquire), 1);
    }

    #[test]
    fn cycles_are_rejected_without_changes() {
        let (graph, _, _) = graph(2);
        let a = group(&graph, 2);
        let b = group(&graph, 2);
        let c = group(&graph, 2);
        graph.attach(b, a).unwrap();
        graph.attach(c, b).unwrap();

        assert_eq!(graph.attach(a, c), Err(Error::InvalidOperation));
        assert_eq!(graph.attach(a, a), Err(Error::InvalidOperation));
        assert_eq!(graph.parent_of(a), None);
        assert_eq!(graph.parent_of(c), Some(b));
    }

    #[test]
    fn shape_and_endpoint_rules() {
        let (graph, _, _) = graph(2);
        let mono = group(&graph, 1);
        let stereo = group(&graph, 2);
        assert_eq!(graph.attach(mono, stereo), Err(Error::InvalidOperation));
        assert_eq!(graph.attach(graph.endpoint(), stereo), Err(Error::InvalidOperation));
        assert_eq!(graph.attach(NodeId(99), stereo), Err(Error::InvalidArgs));
        graph.attach(stereo, graph.endpoint()).unwrap();
    }

    #[test]
    fn detach_is_idempotent_and_remove_orphans_children() {
        let (graph, _, _) = graph(2);
        let parent = group(&graph, 2);
        let child = group(&graph, 2);
        graph.attach(parent, graph.endpoint()).unwrap();
        graph.attach(child, parent).unwrap();

        graph.detach(child).unwrap();
        graph.detach(child).unwrap();
        graph.attach(child, parent).unwrap();

        graph.remove(parent).unwrap();
        assert!(!graph.contains(parent));
        assert_eq!(graph.parent_of(child), None);
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.remove(graph.endpoint()), Err(Error::InvalidOperation));
    }

    #[test]
    fn node_limit() {
        let (graph, _, _) = graph(2);
        for _ in 1..16 {
            group(&graph, 2);
        }
        let overflow = graph.insert(NodeKind::Group, |_| {
            let shared = Arc::new(NodeShared::new(NodeParams::default(), PlayState::Playing));
            EngineNode::Group(GroupNode::new(shared, 2, EffectChain::new(0, 0)))
        });
        assert_eq!(overflow.err(), Some(Error::OutOfMemory));
    }
}
