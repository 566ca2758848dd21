//! Core node trait, per-node shared state and context types.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crossbeam::atomic::AtomicCell;
use dasp_graph::{Buffer, Input};
use parking_lot::Mutex;

use crate::fader::Fader;
use crate::listener::ListenerSet;
use crate::spatializer::{Emitter, PanLaw, PanMode};

/// Frames per graph block. Fixed by `dasp_graph`.
pub const BLOCK_FRAMES: usize = Buffer::LEN;

/// Sentinel for "no scheduled time" and "no pending seek".
pub(crate) const NO_TIME: u64 = u64::MAX;

/// Identifier of a node in an engine's graph.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Information available during audio processing.
///
/// Refreshed for every reachable node at the start of each block, before any
/// node is processed.
#[derive(Clone, Copy, Debug)]
pub struct ProcessContext {
    /// Sample rate of the graph in Hz.
    pub sample_rate: u32,
    /// Frames per block (always [`BLOCK_FRAMES`]).
    pub buffer_size: usize,
    /// Absolute engine frame at the start of this block.
    pub time: u64,
    /// Product of the pitch of every group between this node and the endpoint.
    pub pitch: f32,
    /// Listener snapshot for this block.
    pub listeners: ListenerSet,
    /// Pan law fixed at engine creation.
    pub pan_law: PanLaw,
}

impl ProcessContext {
    pub fn new(sample_rate: u32, listener_count: usize, pan_law: PanLaw) -> Self {
        Self {
            sample_rate,
            buffer_size: BLOCK_FRAMES,
            time: 0,
            pitch: 1.0,
            listeners: ListenerSet::new(listener_count),
            pan_law,
        }
    }
}

/// The render-side behaviour of a graph node.
///
/// Implemented by the endpoint, sound and group nodes. The graph dispatches
/// through a closed enum, so this trait is the shape every variant agrees on
/// rather than an extension point.
pub trait AudioNode: Send + 'static {
    /// Process one block of audio.
    ///
    /// Called once per block for every node reachable from the endpoint,
    /// inputs first.
    fn process(&mut self, ctx: &ProcessContext, inputs: &[Input], outputs: &mut [Buffer]);

    /// Number of input channels (0 for sources).
    fn num_inputs(&self) -> usize {
        0
    }

    /// Number of output channels.
    fn num_outputs(&self) -> usize {
        1
    }
}

/// Playback state of a sound or group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PlayState {
    Stopped = 0,
    /// Started, waiting for its scheduled start frame.
    PendingStart = 1,
    Playing = 2,
    /// Playing out a stop fade.
    Stopping = 3,
}

impl PlayState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PlayState::PendingStart,
            2 => PlayState::Playing,
            3 => PlayState::Stopping,
            _ => PlayState::Stopped,
        }
    }

    /// True while the node produces audio.
    #[inline]
    pub fn is_playing(self) -> bool {
        matches!(self, PlayState::Playing | PlayState::Stopping)
    }
}

/// Parameter snapshot published from control threads to the render thread.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodeParams {
    pub volume: f32,
    pub pan: f32,
    pub pan_mode: PanMode,
    pub pitch: f32,
    pub spatialization: bool,
    pub pinned_listener: Option<usize>,
    pub emitter: Emitter,
    pub fader: Fader,
}

impl Default for NodeParams {
    fn default() -> Self {
        Self {
            volume: 1.0,
            pan: 0.0,
            pan_mode: PanMode::Balance,
            pitch: 1.0,
            spatialization: true,
            pinned_listener: None,
            emitter: Emitter::default(),
            fader: Fader::default(),
        }
    }
}

/// Frames of a block a node is audible for, `[begin, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockWindow {
    pub begin: usize,
    pub end: usize,
    /// The scheduled stop time falls at or before the end of this block.
    pub stops: bool,
}

impl BlockWindow {
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.begin
    }
}

/// State shared between a node's control handle and its render-side half.
///
/// Parameters travel as a whole snapshot through an `AtomicCell`, so the
/// render thread never sees a torn update. Transport fields are individual
/// atomics: control threads `store`, the render thread moves between states
/// with compare-and-swap so a concurrent control write always wins.
#[derive(Debug)]
pub struct NodeShared {
    params: AtomicCell<NodeParams>,
    write: Mutex<()>,
    state: AtomicU8,
    pub(crate) ended: AtomicBool,
    pub(crate) at_end: AtomicBool,
    pub(crate) start_time: AtomicU64,
    pub(crate) stop_time: AtomicU64,
    pub(crate) cursor: AtomicU64,
    pub(crate) seek_target: AtomicU64,
    pub(crate) looping: AtomicBool,
    pub(crate) local_time: AtomicU64,
    pub(crate) stop_faded: AtomicBool,
}

impl NodeShared {
    pub fn new(params: NodeParams, state: PlayState) -> Self {
        Self {
            params: AtomicCell::new(params),
            write: Mutex::new(()),
            state: AtomicU8::new(state as u8),
            ended: AtomicBool::new(false),
            at_end: AtomicBool::new(false),
            start_time: AtomicU64::new(NO_TIME),
            stop_time: AtomicU64::new(NO_TIME),
            cursor: AtomicU64::new(0),
            seek_target: AtomicU64::new(NO_TIME),
            looping: AtomicBool::new(false),
            local_time: AtomicU64::new(0),
            stop_faded: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn params(&self) -> NodeParams {
        self.params.load()
    }

    /// Read-modify-write the parameter snapshot.
    ///
    /// Writers are serialized among themselves; the render thread only loads.
    pub fn update<R>(&self, f: impl FnOnce(&mut NodeParams) -> R) -> R {
        let _guard = self.write.lock();
        let mut params = self.params.load();
        let r = f(&mut params);
        self.params.store(params);
        r
    }

    #[inline]
    pub fn state(&self) -> PlayState {
        PlayState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: PlayState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    fn transition(&self, from: PlayState, to: PlayState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Stop now from the render thread, unless a control thread got there first.
    pub(crate) fn finish_playback(&self) -> bool {
        let stopped = self.transition(PlayState::Playing, PlayState::Stopped)
            || self.transition(PlayState::Stopping, PlayState::Stopped);
        if stopped {
            self.start_time.store(NO_TIME, Ordering::Release);
            self.stop_time.store(NO_TIME, Ordering::Release);
        }
        stopped
    }

    /// Resolve the transport for a block starting at `now`.
    ///
    /// Returns `None` when the node is silent for the whole block. Scheduled
    /// starts and stops are honoured to the frame.
    pub(crate) fn begin_block(&self, now: u64, fader: &Fader) -> Option<BlockWindow> {
        let horizon = now.saturating_add(BLOCK_FRAMES as u64);
        let mut begin = 0usize;

        match self.state() {
            PlayState::Stopped => return None,
            PlayState::PendingStart => {
                let start = self.start_time.load(Ordering::Acquire);
                if start != NO_TIME && start >= horizon {
                    return None;
                }
                if start != NO_TIME && start > now {
                    begin = (start - now) as usize;
                }
                if !self.transition(PlayState::PendingStart, PlayState::Playing) {
                    return None;
                }
            }
            PlayState::Playing | PlayState::Stopping => {}
        }

        let mut end = BLOCK_FRAMES;
        let mut stops = false;
        let stop = self.stop_time.load(Ordering::Acquire);
        if stop != NO_TIME {
            if stop <= horizon {
                end = stop.saturating_sub(now) as usize;
                stops = true;
            }
            if fader.frame_length > 0 && fader.frame_begin < horizon {
                self.transition(PlayState::Playing, PlayState::Stopping);
            }
        }

        if stops && end <= begin {
            self.finish_playback();
            return None;
        }
        Some(BlockWindow { begin, end, stops })
    }

    /// Close a block opened by [`begin_block`](Self::begin_block).
    pub(crate) fn end_block(&self, window: BlockWindow) {
        self.local_time
            .fetch_add(window.len() as u64, Ordering::AcqRel);
        if window.stops {
            self.finish_playback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduled_start_inside_block() {
        let shared = NodeShared::new(NodeParams::default(), PlayState::PendingStart);
        shared.start_time.store(100, Ordering::Release);
        assert!(shared.begin_block(0, &Fader::default()).is_none());
        assert_eq!(shared.state(), PlayState::PendingStart);

        let window = shared.begin_block(64, &Fader::default()).unwrap();
        assert_eq!(window.begin, 36);
        assert_eq!(window.end, BLOCK_FRAMES);
        assert_eq!(shared.state(), PlayState::Playing);
    }

    #[test]
    fn stop_at_block_boundary_stops_after_block() {
        let shared = NodeShared::new(NodeParams::default(), PlayState::Playing);
        shared.stop_time.store(128, Ordering::Release);
        let window = shared.begin_block(64, &Fader::default()).unwrap();
        assert_eq!((window.begin, window.end, window.stops), (0, 64, true));
        shared.end_block(window);
        assert_eq!(shared.state(), PlayState::Stopped);
        assert_eq!(shared.stop_time.load(Ordering::Acquire), NO_TIME);
        assert_eq!(shared.local_time.load(Ordering::Acquire), 64);
    }

    #[test]
    fn stop_fade_enters_stopping() {
        let shared = NodeShared::new(NodeParams::default(), PlayState::Playing);
        shared.stop_time.store(1_000, Ordering::Release);
        let fader = Fader::new(1.0, 0.0, 500, 500);
        shared.begin_block(0, &fader).unwrap();
        assert_eq!(shared.state(), PlayState::Playing);
        shared.begin_block(448, &fader).unwrap();
        assert_eq!(shared.state(), PlayState::Stopping);
        assert!(shared.state().is_playing());
    }

    #[test]
    fn control_write_wins_over_render_transition() {
        let shared = NodeShared::new(NodeParams::default(), PlayState::Playing);
        shared.set_state(PlayState::Stopped);
        assert!(!shared.finish_playback());
        assert!(shared.begin_block(0, &Fader::default()).is_none());
    }

    #[test]
    fn update_publishes_snapshot() {
        let shared = NodeShared::new(NodeParams::default(), PlayState::Stopped);
        shared.update(|p| p.volume = 0.25);
        assert_eq!(shared.params().volume, 0.25);
    }
}
