//! Sounds and sound groups: the control-side handles of graph nodes.
//!
//! Both expose the same parameter surface through [`NodeCore`]. Setters
//! publish a new parameter snapshot that the render thread picks up at the
//! next block; they never fail and clamp out-of-range input instead.

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use delegate::delegate;
use tracing::{debug, warn};

use crate::clock::{frames_to_ms, frames_to_seconds, ms_to_frames, seconds_to_frames};
use crate::config::{SoundConfig, SoundGroupConfig, SoundSource};
use crate::engine::{Engine, EngineShared};
use crate::error::{Error, Result};
use crate::fader::Fader;
use crate::graph::NodeKind;
use crate::math::{sanitize, sanitize_vec, Cone, Vec3};
use crate::node::{NodeId, NodeParams, NodeShared, PlayState, NO_TIME};
use crate::nodes::{EngineNode, GroupNode, SoundNode, SourceSlot};
use crate::resource::{EntryKind, Fence, LoadStatus, ResourceEntry};
use crate::source::{DataFormat, DataSource, MemorySource};
use crate::spatializer::{spatialize, AttenuationModel, PanMode, Positioning};

/// Bitmask of sound and group creation options.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SoundFlags(u32);

impl SoundFlags {
    pub const NONE: SoundFlags = SoundFlags(0);
    /// Read the source incrementally instead of decoding it up front.
    pub const STREAM: SoundFlags = SoundFlags(0x1);
    /// Decode the whole source into memory.
    pub const DECODE: SoundFlags = SoundFlags(0x2);
    /// Load on a worker thread.
    pub const ASYNC: SoundFlags = SoundFlags(0x4);
    /// With `ASYNC`, block the creating thread until the load has finished.
    pub const WAIT_INIT: SoundFlags = SoundFlags(0x8);
    pub const UNKNOWN_LENGTH: SoundFlags = SoundFlags(0x10);
    pub const LOOPING: SoundFlags = SoundFlags(0x20);
    /// Do not attach to the endpoint when no parent is given.
    pub const NO_DEFAULT_ATTACHMENT: SoundFlags = SoundFlags(0x1000);
    /// Ignore pitch and doppler.
    pub const NO_PITCH: SoundFlags = SoundFlags(0x2000);
    pub const NO_SPATIALIZATION: SoundFlags = SoundFlags(0x4000);

    const NAMES: [(SoundFlags, &'static str); 9] = [
        (Self::STREAM, "STREAM"),
        (Self::DECODE, "DECODE"),
        (Self::ASYNC, "ASYNC"),
        (Self::WAIT_INIT, "WAIT_INIT"),
        (Self::UNKNOWN_LENGTH, "UNKNOWN_LENGTH"),
        (Self::LOOPING, "LOOPING"),
        (Self::NO_DEFAULT_ATTACHMENT, "NO_DEFAULT_ATTACHMENT"),
        (Self::NO_PITCH, "NO_PITCH"),
        (Self::NO_SPATIALIZATION, "NO_SPATIALIZATION"),
    ];

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        SoundFlags(bits)
    }

    #[inline]
    pub const fn contains(self, other: SoundFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: SoundFlags) {
        self.0 |= other.0;
    }
}

impl BitOr for SoundFlags {
    type Output = SoundFlags;

    fn bitor(self, rhs: SoundFlags) -> SoundFlags {
        SoundFlags(self.0 | rhs.0)
    }
}

impl BitAnd for SoundFlags {
    type Output = SoundFlags;

    fn bitand(self, rhs: SoundFlags) -> SoundFlags {
        SoundFlags(self.0 & rhs.0)
    }
}

impl BitOrAssign for SoundFlags {
    fn bitor_assign(&mut self, rhs: SoundFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for SoundFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// The parameter and transport surface shared by [`Sound`] and [`SoundGroup`].
///
/// Dropping it stops the node and removes it from the graph.
pub struct NodeCore {
    id: NodeId,
    shared: Arc<NodeShared>,
    engine: Arc<EngineShared>,
    removed: bool,
}

impl NodeCore {
    fn new(id: NodeId, shared: Arc<NodeShared>, engine: Arc<EngineShared>) -> Self {
        Self {
            id,
            shared,
            engine,
            removed: false,
        }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Stop the node and queue its removal from the graph. Runs once.
    fn remove_node(&mut self) {
        if core::mem::replace(&mut self.removed, true) {
            return;
        }
        self.shared.set_state(PlayState::Stopped);
        if let Err(e) = self.engine.graph.remove(self.id) {
            warn!(id = self.id.raw(), ?e, "failed to remove node");
        }
    }

    #[inline]
    fn now(&self) -> u64 {
        self.engine.state.clock.frames()
    }

    #[inline]
    fn sample_rate(&self) -> u32 {
        self.engine.sample_rate
    }

    pub fn set_volume(&self, volume: f32) {
        self.shared
            .update(|p| p.volume = sanitize(volume, p.volume).max(0.0));
    }

    pub fn volume(&self) -> f32 {
        self.shared.params().volume
    }

    /// Stereo position in `[-1, 1]`.
    pub fn set_pan(&self, pan: f32) {
        self.shared
            .update(|p| p.pan = sanitize(pan, p.pan).clamp(-1.0, 1.0));
    }

    pub fn pan(&self) -> f32 {
        self.shared.params().pan
    }

    pub fn set_pan_mode(&self, mode: PanMode) {
        self.shared.update(|p| p.pan_mode = mode);
    }

    pub fn pan_mode(&self) -> PanMode {
        self.shared.params().pan_mode
    }

    /// Playback rate multiplier. Non-positive values are ignored.
    pub fn set_pitch(&self, pitch: f32) {
        if pitch > 0.0 && pitch.is_finite() {
            self.shared.update(|p| p.pitch = pitch);
        }
    }

    pub fn pitch(&self) -> f32 {
        self.shared.params().pitch
    }

    pub fn set_spatialization_enabled(&self, enabled: bool) {
        self.shared.update(|p| p.spatialization = enabled);
    }

    pub fn is_spatialization_enabled(&self) -> bool {
        self.shared.params().spatialization
    }

    /// Bind to one listener, or `None` for the nearest. Out-of-range indices
    /// unpin.
    pub fn set_pinned_listener_index(&self, index: Option<usize>) {
        let count = self.engine.listener_count();
        self.shared
            .update(|p| p.pinned_listener = index.filter(|&i| i < count));
    }

    pub fn pinned_listener_index(&self) -> Option<usize> {
        self.shared.params().pinned_listener
    }

    /// The listener this node is heard by: the pinned one, else the nearest.
    pub fn listener_index(&self) -> usize {
        let params = self.shared.params();
        self.engine
            .state
            .listeners
            .load()
            .resolve(params.pinned_listener, params.emitter.position)
    }

    /// Unit vector from this node towards its listener.
    pub fn direction_to_listener(&self) -> Vec3 {
        let params = self.shared.params();
        let listeners = self.engine.state.listeners.load();
        spatialize(&params.emitter, &listeners, params.pinned_listener).direction_to_listener
    }

    pub fn set_position(&self, position: Vec3) {
        self.shared.update(|p| {
            p.emitter.position = sanitize_vec(position, p.emitter.position);
        });
    }

    pub fn position(&self) -> Vec3 {
        self.shared.params().emitter.position
    }

    pub fn set_direction(&self, direction: Vec3) {
        self.shared.update(|p| {
            p.emitter.direction = sanitize_vec(direction, p.emitter.direction);
        });
    }

    pub fn direction(&self) -> Vec3 {
        self.shared.params().emitter.direction
    }

    pub fn set_velocity(&self, velocity: Vec3) {
        self.shared.update(|p| {
            p.emitter.velocity = sanitize_vec(velocity, p.emitter.velocity);
        });
    }

    pub fn velocity(&self) -> Vec3 {
        self.shared.params().emitter.velocity
    }

    pub fn set_attenuation_model(&self, model: AttenuationModel) {
        self.shared.update(|p| p.emitter.attenuation_model = model);
    }

    pub fn attenuation_model(&self) -> AttenuationModel {
        self.shared.params().emitter.attenuation_model
    }

    pub fn set_positioning(&self, positioning: Positioning) {
        self.shared.update(|p| p.emitter.positioning = positioning);
    }

    pub fn positioning(&self) -> Positioning {
        self.shared.params().emitter.positioning
    }

    pub fn set_rolloff(&self, rolloff: f32) {
        self.shared
            .update(|p| p.emitter.rolloff = sanitize(rolloff, p.emitter.rolloff).max(0.0));
    }

    pub fn rolloff(&self) -> f32 {
        self.shared.params().emitter.rolloff
    }

    pub fn set_min_gain(&self, gain: f32) {
        self.shared
            .update(|p| p.emitter.min_gain = sanitize(gain, p.emitter.min_gain).max(0.0));
    }

    pub fn min_gain(&self) -> f32 {
        self.shared.params().emitter.min_gain
    }

    pub fn set_max_gain(&self, gain: f32) {
        self.shared
            .update(|p| p.emitter.max_gain = sanitize(gain, p.emitter.max_gain).max(0.0));
    }

    pub fn max_gain(&self) -> f32 {
        self.shared.params().emitter.max_gain
    }

    pub fn set_min_distance(&self, distance: f32) {
        self.shared.update(|p| {
            p.emitter.min_distance = sanitize(distance, p.emitter.min_distance).max(0.0);
        });
    }

    pub fn min_distance(&self) -> f32 {
        self.shared.params().emitter.min_distance
    }

    pub fn set_max_distance(&self, distance: f32) {
        self.shared.update(|p| {
            p.emitter.max_distance = sanitize(distance, p.emitter.max_distance).max(0.0);
        });
    }

    pub fn max_distance(&self) -> f32 {
        self.shared.params().emitter.max_distance
    }

    /// Cone apertures in radians.
    pub fn set_cone(&self, inner_angle: f32, outer_angle: f32, outer_gain: f32) {
        let cone = Cone::new(inner_angle, outer_angle, outer_gain);
        self.shared.update(|p| p.emitter.cone = cone);
    }

    pub fn cone(&self) -> Cone {
        self.shared.params().emitter.cone
    }

    /// 0 disables doppler.
    pub fn set_doppler_factor(&self, factor: f32) {
        self.shared.update(|p| {
            p.emitter.doppler_factor = sanitize(factor, p.emitter.doppler_factor).max(0.0);
        });
    }

    pub fn doppler_factor(&self) -> f32 {
        self.shared.params().emitter.doppler_factor
    }

    pub fn set_directional_attenuation_factor(&self, factor: f32) {
        self.shared.update(|p| {
            p.emitter.directional_attenuation_factor =
                sanitize(factor, p.emitter.directional_attenuation_factor).max(0.0);
        });
    }

    pub fn directional_attenuation_factor(&self) -> f32 {
        self.shared.params().emitter.directional_attenuation_factor
    }

    /// Fade from `volume_begin` to `volume_end` over `frames`, starting now.
    ///
    /// A negative `volume_begin` starts from the current fade volume.
    pub fn set_fade_in_pcm_frames(&self, volume_begin: f32, volume_end: f32, frames: u64) {
        self.set_fade_start_in_pcm_frames(volume_begin, volume_end, frames, self.now());
    }

    pub fn set_fade_in_milliseconds(&self, volume_begin: f32, volume_end: f32, ms: u64) {
        let frames = ms_to_frames(ms, self.sample_rate());
        self.set_fade_in_pcm_frames(volume_begin, volume_end, frames);
    }

    /// Schedule a fade that begins at absolute engine frame `start`.
    pub fn set_fade_start_in_pcm_frames(
        &self,
        volume_begin: f32,
        volume_end: f32,
        frames: u64,
        start: u64,
    ) {
        let now = self.now();
        self.shared.update(|p| {
            let begin = if volume_begin < 0.0 {
                p.fader.current_volume(now)
            } else {
                sanitize(volume_begin, 1.0)
            };
            p.fader = Fader::new(begin, sanitize(volume_end, 1.0).max(0.0), start, frames);
        });
    }

    pub fn set_fade_start_in_milliseconds(
        &self,
        volume_begin: f32,
        volume_end: f32,
        ms: u64,
        start_ms: u64,
    ) {
        let rate = self.sample_rate();
        self.set_fade_start_in_pcm_frames(
            volume_begin,
            volume_end,
            ms_to_frames(ms, rate),
            ms_to_frames(start_ms, rate),
        );
    }

    /// Fade envelope volume right now.
    pub fn current_fade_volume(&self) -> f32 {
        self.shared.params().fader.current_volume(self.now())
    }

    /// Defer the next [`start`](Self::start) until absolute frame `frame`.
    pub fn set_start_time_in_pcm_frames(&self, frame: u64) {
        self.shared.start_time.store(frame, Ordering::Release);
    }

    pub fn set_start_time_in_milliseconds(&self, ms: u64) {
        self.set_start_time_in_pcm_frames(ms_to_frames(ms, self.sample_rate()));
    }

    /// Stop at absolute frame `frame`.
    pub fn set_stop_time_in_pcm_frames(&self, frame: u64) {
        self.shared.stop_time.store(frame, Ordering::Release);
    }

    pub fn set_stop_time_in_milliseconds(&self, ms: u64) {
        self.set_stop_time_in_pcm_frames(ms_to_frames(ms, self.sample_rate()));
    }

    /// Stop at absolute frame `stop`, fading to silence over the `fade`
    /// frames before it.
    pub fn set_stop_time_with_fade_in_pcm_frames(&self, stop: u64, fade: u64) {
        let fade = fade.min(stop);
        self.set_fade_start_in_pcm_frames(-1.0, 0.0, fade, stop - fade);
        self.shared.stop_faded.store(true, Ordering::Release);
        self.shared.stop_time.store(stop, Ordering::Release);
    }

    pub fn set_stop_time_with_fade_in_milliseconds(&self, stop_ms: u64, fade_ms: u64) {
        let rate = self.sample_rate();
        self.set_stop_time_with_fade_in_pcm_frames(
            ms_to_frames(stop_ms, rate),
            ms_to_frames(fade_ms, rate),
        );
    }

    /// Start playback, or arm a scheduled start. Starting a playing node
    /// does nothing.
    pub fn start(&self) -> Result<()> {
        if self.shared.state().is_playing() {
            return Ok(());
        }
        // A finished stop-with-fade leaves the envelope at zero.
        if self.shared.stop_time.load(Ordering::Acquire) == NO_TIME
            && self.shared.stop_faded.swap(false, Ordering::AcqRel)
        {
            self.shared.update(|p| p.fader = Fader::default());
        }

        let start = self.shared.start_time.load(Ordering::Acquire);
        if start != NO_TIME && start > self.now() {
            self.shared.set_state(PlayState::PendingStart);
        } else {
            self.shared.set_state(PlayState::Playing);
        }
        Ok(())
    }

    /// Stop immediately and clear any schedule.
    pub fn stop(&self) -> Result<()> {
        self.shared.set_state(PlayState::Stopped);
        self.shared.start_time.store(NO_TIME, Ordering::Release);
        self.shared.stop_time.store(NO_TIME, Ordering::Release);
        Ok(())
    }

    /// Fade out from the current volume over `frames`, then stop.
    pub fn stop_with_fade_in_pcm_frames(&self, frames: u64) -> Result<()> {
        if frames == 0 || !self.shared.state().is_playing() {
            return self.stop();
        }
        let now = self.now();
        self.set_fade_start_in_pcm_frames(-1.0, 0.0, frames, now);
        self.shared.stop_faded.store(true, Ordering::Release);
        // NO_TIME means unscheduled, so a saturated stop lands one frame short.
        let stop = now.saturating_add(frames).min(NO_TIME - 1);
        self.shared.stop_time.store(stop, Ordering::Release);
        self.shared.set_state(PlayState::Stopping);
        Ok(())
    }

    pub fn stop_with_fade_in_milliseconds(&self, ms: u64) -> Result<()> {
        self.stop_with_fade_in_pcm_frames(ms_to_frames(ms, self.sample_rate()))
    }

    /// True while producing audio, including a stop fade.
    pub fn is_playing(&self) -> bool {
        self.shared.state().is_playing()
    }

    pub fn play_state(&self) -> PlayState {
        self.shared.state()
    }

    /// Frames this node has rendered while playing.
    pub fn time_in_pcm_frames(&self) -> u64 {
        self.shared.local_time.load(Ordering::Acquire)
    }

    pub fn time_in_milliseconds(&self) -> u64 {
        frames_to_ms(self.time_in_pcm_frames(), self.sample_rate())
    }

    /// Attach to `parent`, which must be a group or the endpoint with a
    /// matching channel count.
    pub fn attach(&self, parent: NodeId) -> Result<()> {
        self.engine.graph.attach(self.id, parent)
    }

    pub fn detach(&self) -> Result<()> {
        self.engine.graph.detach(self.id)
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.engine.graph.parent_of(self.id)
    }
}

impl Drop for NodeCore {
    fn drop(&mut self) {
        self.remove_node();
    }
}

impl fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCore")
            .field("id", &self.id)
            .field("state", &self.shared.state())
            .finish()
    }
}

/// Forward the [`NodeCore`] surface.
macro_rules! node_surface {
    () => {
        delegate! {
            to self.core {
                pub fn id(&self) -> NodeId;
                pub fn set_volume(&self, volume: f32);
                pub fn volume(&self) -> f32;
                pub fn set_pan(&self, pan: f32);
                pub fn pan(&self) -> f32;
                pub fn set_pan_mode(&self, mode: PanMode);
                pub fn pan_mode(&self) -> PanMode;
                pub fn set_pitch(&self, pitch: f32);
                pub fn pitch(&self) -> f32;
                pub fn set_spatialization_enabled(&self, enabled: bool);
                pub fn is_spatialization_enabled(&self) -> bool;
                pub fn set_pinned_listener_index(&self, index: Option<usize>);
                pub fn pinned_listener_index(&self) -> Option<usize>;
                pub fn listener_index(&self) -> usize;
                pub fn direction_to_listener(&self) -> Vec3;
                pub fn set_position(&self, position: Vec3);
                pub fn position(&self) -> Vec3;
                pub fn set_direction(&self, direction: Vec3);
                pub fn direction(&self) -> Vec3;
                pub fn set_velocity(&self, velocity: Vec3);
                pub fn velocity(&self) -> Vec3;
                pub fn set_attenuation_model(&self, model: AttenuationModel);
                pub fn attenuation_model(&self) -> AttenuationModel;
                pub fn set_positioning(&self, positioning: Positioning);
                pub fn positioning(&self) -> Positioning;
                pub fn set_rolloff(&self, rolloff: f32);
                pub fn rolloff(&self) -> f32;
                pub fn set_min_gain(&self, gain: f32);
                pub fn min_gain(&self) -> f32;
                pub fn set_max_gain(&self, gain: f32);
                pub fn max_gain(&self) -> f32;
                pub fn set_min_distance(&self, distance: f32);
                pub fn min_distance(&self) -> f32;
                pub fn set_max_distance(&self, distance: f32);
                pub fn max_distance(&self) -> f32;
                pub fn set_cone(&self, inner_angle: f32, outer_angle: f32, outer_gain: f32);
                pub fn cone(&self) -> Cone;
                pub fn set_doppler_factor(&self, factor: f32);
                pub fn doppler_factor(&self) -> f32;
                pub fn set_directional_attenuation_factor(&self, factor: f32);
                pub fn directional_attenuation_factor(&self) -> f32;
                pub fn set_fade_in_pcm_frames(&self, volume_begin: f32, volume_end: f32, frames: u64);
                pub fn set_fade_in_milliseconds(&self, volume_begin: f32, volume_end: f32, ms: u64);
                pub fn set_fade_start_in_pcm_frames(&self, volume_begin: f32, volume_end: f32, frames: u64, start: u64);
                pub fn set_fade_start_in_milliseconds(&self, volume_begin: f32, volume_end: f32, ms: u64, start_ms: u64);
                pub fn current_fade_volume(&self) -> f32;
                pub fn set_start_time_in_pcm_frames(&self, frame: u64);
                pub fn set_start_time_in_milliseconds(&self, ms: u64);
                pub fn set_stop_time_in_pcm_frames(&self, frame: u64);
                pub fn set_stop_time_in_milliseconds(&self, ms: u64);
                pub fn set_stop_time_with_fade_in_pcm_frames(&self, stop: u64, fade: u64);
                pub fn set_stop_time_with_fade_in_milliseconds(&self, stop_ms: u64, fade_ms: u64);
                pub fn stop(&self) -> Result<()>;
                pub fn stop_with_fade_in_pcm_frames(&self, frames: u64) -> Result<()>;
                pub fn stop_with_fade_in_milliseconds(&self, ms: u64) -> Result<()>;
                pub fn is_playing(&self) -> bool;
                pub fn play_state(&self) -> PlayState;
                pub fn time_in_pcm_frames(&self) -> u64;
                pub fn time_in_milliseconds(&self) -> u64;
                pub fn attach(&self, parent: NodeId) -> Result<()>;
                pub fn detach(&self) -> Result<()>;
                pub fn parent(&self) -> Option<NodeId>;
            }
        }
    };
}

/// A playable leaf node.
pub struct Sound {
    core: NodeCore,
    entry: Option<Arc<ResourceEntry>>,
    /// Format of a directly supplied data source.
    format: Option<DataFormat>,
    length: Option<u64>,
    flags: SoundFlags,
}

impl Sound {
    /// Load `identity` through the engine's resource manager.
    pub fn init_from_file(
        engine: &Engine,
        identity: &str,
        flags: SoundFlags,
        group: Option<&SoundGroup>,
        fence: Option<&Arc<Fence>>,
    ) -> Result<Sound> {
        let mut config = SoundConfig::from_identity(identity).with_flags(flags);
        config.initial_attachment = group.map(SoundGroup::id);
        config.done_fence = fence.cloned();
        Self::init_ex(engine, config)
    }

    /// Play frames straight from `source`. The source is owned by the sound
    /// and never shared.
    pub fn init_from_data_source(
        engine: &Engine,
        source: impl DataSource + 'static,
        flags: SoundFlags,
        group: Option<&SoundGroup>,
    ) -> Result<Sound> {
        let mut config = SoundConfig::from_data_source(source).with_flags(flags);
        config.initial_attachment = group.map(SoundGroup::id);
        Self::init_ex(engine, config)
    }

    /// A new sound sharing `existing`'s decoded data.
    ///
    /// Only sounds backed by a decoded resource can be copied; streams and
    /// direct data sources fail with [`Error::InvalidOperation`].
    pub fn init_copy(
        engine: &Engine,
        existing: &Sound,
        flags: SoundFlags,
        group: Option<&SoundGroup>,
    ) -> Result<Sound> {
        let entry = existing
            .entry
            .as_ref()
            .filter(|e| e.kind() == EntryKind::Decoded)
            .ok_or(Error::InvalidOperation)?;
        let mut config = SoundConfig::from_identity(entry.identity())
            .with_flags(flags | (existing.flags & SoundFlags::ASYNC));
        config.initial_attachment = group.map(SoundGroup::id);
        Self::init_ex(engine, config)
    }

    pub fn init_ex(engine: &Engine, config: SoundConfig) -> Result<Sound> {
        let engine = engine.shared().clone();
        let SoundConfig {
            source,
            mut flags,
            initial_attachment,
            channels_out,
            looping,
            done_fence,
        } = config;
        if looping {
            flags |= SoundFlags::LOOPING;
        }

        let mut entry = None;
        let mut format = None;
        let mut length = None;
        let slot = match source.ok_or(Error::InvalidArgs)? {
            SoundSource::Identity(identity) => {
                let loaded = engine
                    .resources
                    .load(&identity, flags, done_fence.as_ref())?;
                let waited = if flags.contains(SoundFlags::ASYNC | SoundFlags::WAIT_INIT) {
                    loaded.wait()
                } else {
                    Ok(())
                };
                let slot = match waited.and_then(|()| slot_for_entry(&loaded)) {
                    Ok(slot) => slot,
                    Err(e) => {
                        engine.resources.release(loaded);
                        return Err(e);
                    }
                };
                if let SourceSlot::Stream(reader) = &slot {
                    reader.set_looping(flags.contains(SoundFlags::LOOPING));
                }
                entry = Some(loaded);
                slot
            }
            SoundSource::DataSource(source) => {
                source.format().validate()?;
                format = Some(source.format());
                length = source.length();
                if let Some(fence) = &done_fence {
                    fence.complete();
                }
                SourceSlot::Custom(source)
            }
        };

        let channels = if channels_out == 0 {
            engine.channels
        } else {
            channels_out
        };
        let mut params = NodeParams::default();
        params.spatialization = !flags.contains(SoundFlags::NO_SPATIALIZATION);
        let shared = Arc::new(NodeShared::new(params, PlayState::Stopped));
        shared
            .looping
            .store(flags.contains(SoundFlags::LOOPING), Ordering::Release);

        let no_pitch = flags.contains(SoundFlags::NO_PITCH);
        let chain = engine.effect_chain();
        let inserted = engine.graph.insert(NodeKind::Sound, |id| {
            EngineNode::Sound(SoundNode::new(
                id,
                shared.clone(),
                slot,
                channels,
                no_pitch,
                chain,
            ))
        });
        let id = match inserted {
            Ok(id) => id,
            Err(e) => {
                if let Some(entry) = entry {
                    engine.resources.release(entry);
                }
                return Err(e);
            }
        };

        // From here on, dropping the sound unwinds both the node and the entry.
        let sound = Sound {
            core: NodeCore::new(id, shared, engine),
            entry,
            format,
            length,
            flags,
        };
        sound
            .core
            .engine
            .attach_initial(id, initial_attachment, flags)?;
        debug!(id = id.raw(), ?flags, channels, "sound created");
        Ok(sound)
    }

    node_surface!();

    /// Start playback. A sound at its end rewinds first.
    ///
    /// Fails with the stored error if its asynchronous load failed.
    pub fn start(&self) -> Result<()> {
        if let Some(entry) = &self.entry {
            if entry.status() == LoadStatus::Failed {
                return entry.result();
            }
        }
        let shared = &self.core.shared;
        if shared.at_end.swap(false, Ordering::AcqRel) {
            shared.cursor.store(0, Ordering::Release);
            shared.seek_target.store(0, Ordering::Release);
        }
        shared.ended.store(false, Ordering::Release);
        self.core.start()
    }

    pub fn set_looping(&self, looping: bool) {
        self.core.shared.looping.store(looping, Ordering::Release);
    }

    pub fn is_looping(&self) -> bool {
        self.core.shared.looping.load(Ordering::Acquire)
    }

    /// True once a non-looping sound has played to its end.
    pub fn at_end(&self) -> bool {
        self.core.shared.at_end.load(Ordering::Acquire)
    }

    /// Move the playback cursor. The play state is unchanged.
    pub fn seek_to_pcm_frame(&self, frame: u64) -> Result<()> {
        self.source_ready()?;
        let shared = &self.core.shared;
        shared.at_end.store(false, Ordering::Release);
        shared.cursor.store(frame, Ordering::Release);
        shared.seek_target.store(frame, Ordering::Release);
        Ok(())
    }

    pub fn seek_to_second(&self, seconds: f32) -> Result<()> {
        let rate = self.data_format()?.sample_rate;
        self.seek_to_pcm_frame(seconds_to_frames(seconds, rate))
    }

    /// Format of the underlying data.
    pub fn data_format(&self) -> Result<DataFormat> {
        self.source_ready()?;
        self.format
            .or_else(|| self.entry.as_ref().and_then(|e| e.format()))
            .ok_or(Error::InvalidOperation)
    }

    /// Playback position in source frames.
    pub fn cursor_in_pcm_frames(&self) -> Result<u64> {
        self.source_ready()?;
        Ok(self.core.shared.cursor.load(Ordering::Acquire))
    }

    pub fn cursor_in_seconds(&self) -> Result<f32> {
        let rate = self.data_format()?.sample_rate;
        Ok(frames_to_seconds(self.cursor_in_pcm_frames()?, rate))
    }

    /// Length in source frames; 0 when unknown.
    pub fn length_in_pcm_frames(&self) -> Result<u64> {
        self.source_ready()?;
        let length = match &self.entry {
            Some(entry) => entry.length(),
            None => self.length,
        };
        Ok(length.unwrap_or(0))
    }

    pub fn length_in_seconds(&self) -> Result<f32> {
        let rate = self.data_format()?.sample_rate;
        Ok(frames_to_seconds(self.length_in_pcm_frames()?, rate))
    }

    /// Called from [`Engine::dispatch_events`] each time this sound reaches
    /// its end.
    pub fn set_end_callback(&self, callback: impl FnMut(NodeId) + Send + 'static) {
        self.core
            .engine
            .callbacks
            .lock()
            .insert(self.core.id, Box::new(callback));
    }

    pub fn clear_end_callback(&self) {
        self.core.engine.callbacks.lock().remove(&self.core.id);
    }

    /// Fade in from silence over `ms` milliseconds.
    pub fn fade_in(&self, ms: u64) {
        self.core.set_fade_in_milliseconds(0.0, 1.0, ms);
    }

    /// Fade out from the current volume over `ms` milliseconds. Playback
    /// continues.
    pub fn fade_out(&self, ms: u64) {
        self.core.set_fade_in_milliseconds(-1.0, 0.0, ms);
    }

    /// The resource backing this sound, if it was loaded by identity.
    pub fn resource(&self) -> Option<&Arc<ResourceEntry>> {
        self.entry.as_ref()
    }

    pub fn flags(&self) -> SoundFlags {
        self.flags
    }

    /// `Busy` while loading, the load error once failed.
    fn source_ready(&self) -> Result<()> {
        match &self.entry {
            Some(entry) => entry.result(),
            None => Ok(()),
        }
    }
}

impl Drop for Sound {
    fn drop(&mut self) {
        self.core.engine.callbacks.lock().remove(&self.core.id);
        // The node goes first so the render thread never holds the entry's
        // last reference.
        self.core.remove_node();
        if let Some(entry) = self.entry.take() {
            self.core.engine.resources.release(entry);
        }
    }
}

impl fmt::Debug for Sound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sound")
            .field("core", &self.core)
            .field("flags", &self.flags)
            .field("resource", &self.entry.as_ref().map(|e| e.identity()))
            .finish()
    }
}

fn slot_for_entry(entry: &Arc<ResourceEntry>) -> Result<SourceSlot> {
    match entry.kind() {
        EntryKind::Stream => entry
            .take_stream()
            .map(SourceSlot::Stream)
            .ok_or(Error::InvalidOperation),
        EntryKind::Decoded => Ok(match entry.status() {
            LoadStatus::Pending => SourceSlot::Pending(entry.clone()),
            LoadStatus::Failed => SourceSlot::Failed,
            LoadStatus::Ready => match entry.buffer() {
                Some(buffer) => SourceSlot::Memory(MemorySource::new(buffer.clone())),
                None => SourceSlot::Failed,
            },
        }),
    }
}

/// A mixing bus. Children attach to it instead of the endpoint and inherit
/// its volume, pan, pitch and fades.
///
/// Groups are created playing. Stopping a group gates its output without
/// touching the state of its children.
pub struct SoundGroup {
    core: NodeCore,
}

impl SoundGroup {
    /// A group under `parent`, or under the endpoint.
    pub fn init(engine: &Engine, parent: Option<&SoundGroup>) -> Result<SoundGroup> {
        let config = SoundGroupConfig {
            parent: parent.map(SoundGroup::id),
            ..SoundGroupConfig::default()
        };
        Self::init_ex(engine, config)
    }

    pub fn init_ex(engine: &Engine, config: SoundGroupConfig) -> Result<SoundGroup> {
        let engine = engine.shared().clone();
        let channels = if config.channels == 0 {
            engine.channels
        } else {
            config.channels
        };

        let mut params = NodeParams::default();
        params.spatialization = !config.flags.contains(SoundFlags::NO_SPATIALIZATION);
        let shared = Arc::new(NodeShared::new(params, PlayState::Playing));

        let chain = engine.effect_chain();
        let id = engine.graph.insert(NodeKind::Group, |_| {
            EngineNode::Group(GroupNode::new(shared.clone(), channels, chain))
        })?;

        let core = NodeCore::new(id, shared, engine);
        core.engine.attach_initial(id, config.parent, config.flags)?;
        debug!(id = id.raw(), channels, "sound group created");
        Ok(SoundGroup { core })
    }

    node_surface!();

    pub fn start(&self) -> Result<()> {
        self.core.start()
    }
}

impl fmt::Debug for SoundGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoundGroup").field("core", &self.core).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine_and_print() {
        let flags = SoundFlags::DECODE | SoundFlags::ASYNC;
        assert!(flags.contains(SoundFlags::ASYNC));
        assert!(!flags.contains(SoundFlags::STREAM));
        assert!(flags.contains(SoundFlags::NONE));
        assert_eq!(flags.bits(), 0x6);
        assert_eq!(format!("{flags:?}"), "{DECODE, ASYNC}");
    }
}
