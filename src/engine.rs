//! The engine: owns the graph, listeners, clock, resource manager and
//! backend, and is the context every sound and group is created in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use rtrb::{Consumer, RingBuffer};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::clock::{frames_to_ms, ms_to_frames};
use crate::config::{EngineConfig, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};
use crate::error::{Error, Result};
use crate::graph::{GraphConfig, GraphState, NodeGraph};
use crate::listener::{Listener, ListenerSet};
use crate::math::{sanitize, Cone, Vec3};
use crate::node::NodeId;
use crate::nodes::EffectChain;
use crate::resource::ResourceManager;
use crate::sound::{Sound, SoundFlags, SoundGroup};

/// Something the render thread reported, delivered by
/// [`Engine::dispatch_events`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineEvent {
    /// A non-looping sound played to its end.
    SoundEnded { id: NodeId },
}

pub(crate) type EndCallback = Box<dyn FnMut(NodeId) + Send>;

/// The part of the engine sounds and groups hold on to.
pub(crate) struct EngineShared {
    pub graph: NodeGraph,
    pub state: Arc<GraphState>,
    pub resources: ResourceManager,
    pub channels: usize,
    pub sample_rate: u32,
    pub callbacks: Mutex<HashMap<NodeId, EndCallback>>,
    listener_count: usize,
    listener_write: Mutex<()>,
    gain_smooth_frames: u32,
    volume_smooth_frames: u32,
}

impl EngineShared {
    #[inline]
    pub fn listener_count(&self) -> usize {
        self.listener_count
    }

    pub fn effect_chain(&self) -> EffectChain {
        EffectChain::new(self.gain_smooth_frames, self.volume_smooth_frames)
    }

    /// Attach a freshly created node to `parent`, or to the endpoint unless
    /// the flags say otherwise.
    pub fn attach_initial(
        &self,
        id: NodeId,
        parent: Option<NodeId>,
        flags: SoundFlags,
    ) -> Result<()> {
        match parent {
            Some(parent) => self.graph.attach(id, parent),
            None if flags.contains(SoundFlags::NO_DEFAULT_ATTACHMENT) => Ok(()),
            None => self.graph.attach(id, self.graph.endpoint()),
        }
    }

    fn update_listeners(&self, f: impl FnOnce(&mut ListenerSet)) {
        let _guard = self.listener_write.lock();
        let mut set = self.state.listeners.load();
        f(&mut set);
        self.state.listeners.store(set);
    }
}

/// A real-time audio engine.
///
/// Lifecycle: created (and started, unless configured otherwise), started
/// and stopped any number of times, then dropped. Dropping stops the
/// backend first, then tears down the graph, then the resource manager.
///
/// ```no_run
/// use raumklang::{Engine, EngineConfig, Sound, SoundFlags};
///
/// let engine = Engine::new(EngineConfig::default()).unwrap();
/// let sound = Sound::init_from_file(&engine, "music", SoundFlags::STREAM, None, None).unwrap();
/// sound.start().unwrap();
/// ```
pub struct Engine {
    shared: Arc<EngineShared>,
    backend: Mutex<Option<Box<dyn Backend>>>,
    running: AtomicBool,
    events: Mutex<Consumer<EngineEvent>>,
    inline: Mutex<HashMap<NodeId, Sound>>,
}

impl Engine {
    /// Create an engine on the default device.
    ///
    /// With `no_device` set there is no backend and audio is pulled with
    /// [`read_pcm_frames`](Self::read_pcm_frames).
    pub fn new(config: EngineConfig) -> Result<Self> {
        if config.no_device {
            return Self::build(config, None);
        }
        let backend = default_backend(&config)?;
        Self::build(config, Some(backend))
    }

    /// Create an engine driven by `backend`.
    pub fn with_backend(config: EngineConfig, backend: Box<dyn Backend>) -> Result<Self> {
        Self::build(config, Some(backend))
    }

    /// Create an engine on the system's default output device.
    #[cfg(feature = "cpal_sink")]
    pub fn default_output() -> Result<Self> {
        let backend = crate::backend::CpalBackend::default_output()?;
        Self::build(EngineConfig::default(), Some(Box::new(backend)))
    }

    fn build(config: EngineConfig, backend: Option<Box<dyn Backend>>) -> Result<Self> {
        let (sample_rate, channels) = match &backend {
            Some(b) => {
                if config.sample_rate != 0 && config.sample_rate != b.sample_rate() {
                    return Err(Error::FormatNotSupported);
                }
                if config.channels != 0 && config.channels != b.channels() {
                    return Err(Error::InvalidDeviceConfig);
                }
                (b.sample_rate(), b.channels())
            }
            None => (
                nonzero_or(config.sample_rate, DEFAULT_SAMPLE_RATE),
                nonzero_or(config.channels, DEFAULT_CHANNELS),
            ),
        };
        if sample_rate == 0 || channels == 0 {
            return Err(Error::InvalidDeviceConfig);
        }

        let backend_name = backend.as_ref().map(|b| b.name().to_owned());
        let auto_start = backend.is_some() && !config.no_auto_start;
        let listener_count = config.listeners();
        let resources = ResourceManager::new(config.resource_manager.clone())?;
        let state = Arc::new(GraphState::new(listener_count));
        let (events_tx, events_rx) = RingBuffer::new(config.event_queue_capacity.max(16));
        let graph = NodeGraph::new(
            GraphConfig {
                channels,
                sample_rate,
                listener_count,
                pan_law: config.pan_law,
                max_nodes: config.max_nodes,
                command_queue_capacity: config.command_queue_capacity,
            },
            state.clone(),
            events_tx,
        );

        let engine = Engine {
            shared: Arc::new(EngineShared {
                graph,
                state,
                resources,
                channels,
                sample_rate,
                callbacks: Mutex::new(HashMap::new()),
                listener_count,
                listener_write: Mutex::new(()),
                gain_smooth_frames: config.gain_smooth_frames(sample_rate),
                volume_smooth_frames: config.default_volume_smooth_time_in_frames,
            }),
            backend: Mutex::new(backend),
            running: AtomicBool::new(false),
            events: Mutex::new(events_rx),
            inline: Mutex::new(HashMap::new()),
        };

        info!(
            sample_rate,
            channels,
            listeners = listener_count,
            backend = ?backend_name,
            "engine initialized"
        );

        // A failed start drops `engine`, which tears everything down again.
        if auto_start {
            engine.start()?;
        }
        Ok(engine)
    }

    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    /// Start the backend.
    ///
    /// Fails with [`Error::InvalidOperation`] for an engine without one.
    pub fn start(&self) -> Result<()> {
        let mut backend = self.backend.lock();
        let backend = backend.as_mut().ok_or(Error::InvalidOperation)?;
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        self.shared.graph.set_realtime(true);
        if let Err(e) = backend.start(self.shared.graph.render_slot()) {
            self.shared.graph.set_realtime(false);
            warn!(?e, "backend failed to start");
            return Err(e);
        }
        self.running.store(true, Ordering::Release);
        info!(backend = backend.name(), "engine started");
        Ok(())
    }

    /// Stop the backend. Stopping a stopped engine does nothing.
    pub fn stop(&self) -> Result<()> {
        let mut backend = self.backend.lock();
        let Some(backend) = backend.as_mut() else {
            return Ok(());
        };
        if !self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        backend.stop()?;
        self.running.store(false, Ordering::Release);
        self.shared.graph.set_realtime(false);
        info!(backend = backend.name(), "engine stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Render interleaved frames on the calling thread. `out.len()` must be
    /// a multiple of the channel count.
    ///
    /// Only allowed while no backend is running. Returns the frames written.
    pub fn read_pcm_frames(&self, out: &mut [f32]) -> Result<usize> {
        if self.is_running() {
            return Err(Error::InvalidOperation);
        }
        if out.len() % self.shared.channels != 0 {
            return Err(Error::InvalidArgs);
        }
        self.shared.graph.read(out);
        Ok(out.len() / self.shared.channels)
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.shared.channels
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    /// Master volume applied at the endpoint.
    pub fn set_volume(&self, volume: f32) {
        let volume = sanitize(volume, self.volume()).max(0.0);
        self.shared.state.set_volume(volume);
    }

    pub fn volume(&self) -> f32 {
        self.shared.state.volume()
    }

    pub fn set_gain_db(&self, db: f32) {
        self.set_volume(10f32.powf(db / 20.0));
    }

    pub fn gain_db(&self) -> f32 {
        20.0 * self.volume().log10()
    }

    /// Engine time in PCM frames.
    pub fn time_in_pcm_frames(&self) -> u64 {
        self.shared.state.clock.frames()
    }

    pub fn set_time_in_pcm_frames(&self, frames: u64) {
        self.shared.state.clock.set_absolute(frames);
    }

    pub fn time_in_milliseconds(&self) -> u64 {
        frames_to_ms(self.time_in_pcm_frames(), self.sample_rate())
    }

    pub fn set_time_in_milliseconds(&self, ms: u64) {
        self.set_time_in_pcm_frames(ms_to_frames(ms, self.sample_rate()));
    }

    /// Alias for [`time_in_pcm_frames`](Self::time_in_pcm_frames).
    pub fn time(&self) -> u64 {
        self.time_in_pcm_frames()
    }

    /// Alias for [`set_time_in_pcm_frames`](Self::set_time_in_pcm_frames).
    pub fn set_time(&self, frames: u64) {
        self.set_time_in_pcm_frames(frames);
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listener_count()
    }

    /// Snapshot of one listener.
    pub fn listener(&self, index: usize) -> Option<Listener> {
        self.shared.state.listeners.load().get(index).copied()
    }

    /// Index of the enabled listener nearest to `position`, lowest index on ties.
    pub fn find_closest_listener(&self, position: Vec3) -> usize {
        self.shared.state.listeners.load().closest(position)
    }

    pub fn set_listener_position(&self, index: usize, position: Vec3) {
        self.shared
            .update_listeners(|set| set.set_position(index, position));
    }

    pub fn listener_position(&self, index: usize) -> Vec3 {
        self.listener(index).unwrap_or_default().position
    }

    pub fn set_listener_direction(&self, index: usize, direction: Vec3) {
        self.shared
            .update_listeners(|set| set.set_direction(index, direction));
    }

    pub fn listener_direction(&self, index: usize) -> Vec3 {
        self.listener(index).unwrap_or_default().direction
    }

    pub fn set_listener_velocity(&self, index: usize, velocity: Vec3) {
        self.shared
            .update_listeners(|set| set.set_velocity(index, velocity));
    }

    pub fn listener_velocity(&self, index: usize) -> Vec3 {
        self.listener(index).unwrap_or_default().velocity
    }

    pub fn set_listener_world_up(&self, index: usize, world_up: Vec3) {
        self.shared
            .update_listeners(|set| set.set_world_up(index, world_up));
    }

    pub fn listener_world_up(&self, index: usize) -> Vec3 {
        self.listener(index).unwrap_or_default().world_up
    }

    /// Cone apertures in radians.
    pub fn set_listener_cone(&self, index: usize, inner_angle: f32, outer_angle: f32, outer_gain: f32) {
        let cone = Cone::new(inner_angle, outer_angle, outer_gain);
        self.shared.update_listeners(|set| set.set_cone(index, cone));
    }

    pub fn listener_cone(&self, index: usize) -> Cone {
        self.listener(index).unwrap_or_default().cone
    }

    /// A disabled listener hears nothing.
    pub fn set_listener_enabled(&self, index: usize, enabled: bool) {
        self.shared
            .update_listeners(|set| set.set_enabled(index, enabled));
    }

    pub fn is_listener_enabled(&self, index: usize) -> bool {
        self.listener(index).is_some_and(|l| l.enabled)
    }

    /// Fire-and-forget playback of `identity`, under `group` or the endpoint.
    ///
    /// The sound is reclaimed by [`dispatch_events`](Self::dispatch_events)
    /// once it ends.
    pub fn play_sound(&self, identity: &str, group: Option<&SoundGroup>) -> Result<()> {
        let sound = Sound::init_from_file(self, identity, SoundFlags::DECODE, group, None)?;
        sound.start()?;
        debug!(identity, id = sound.id().raw(), "inline sound started");
        self.inline.lock().insert(sound.id(), sound);
        Ok(())
    }

    /// Inline sounds still playing.
    pub fn inline_sound_count(&self) -> usize {
        self.inline.lock().len()
    }

    /// Deliver pending render events on the calling thread: run end
    /// callbacks, reclaim finished inline sounds and free removed nodes.
    ///
    /// Returns the number of events delivered.
    pub fn dispatch_events(&self) -> usize {
        let mut delivered = 0;
        loop {
            let Ok(event) = self.events.lock().pop() else {
                break;
            };
            match event {
                EngineEvent::SoundEnded { id } => {
                    let callback = self.shared.callbacks.lock().remove(&id);
                    if let Some(mut callback) = callback {
                        callback(id);
                        if self.shared.graph.contains(id) {
                            self.shared.callbacks.lock().entry(id).or_insert(callback);
                        }
                    }
                    let finished = self.inline.lock().remove(&id);
                    drop(finished);
                }
            }
            delivered += 1;
        }
        self.shared.graph.collect_garbage();
        delivered
    }

    /// Free nodes the renderer has released.
    pub fn collect_garbage(&self) -> usize {
        self.shared.graph.collect_garbage()
    }

    /// Completed render calls. Anything removed before an epoch was observed
    /// is no longer referenced by the renderer after it.
    pub fn render_epoch(&self) -> u64 {
        self.shared.state.epoch.load(Ordering::Acquire)
    }

    pub fn node_graph(&self) -> &NodeGraph {
        &self.shared.graph
    }

    pub fn resource_manager(&self) -> &ResourceManager {
        &self.shared.resources
    }

    /// The mix destination sounds and groups attach to by default.
    pub fn endpoint(&self) -> NodeId {
        self.shared.graph.endpoint()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(?e, "backend failed to stop");
        }
        self.backend.lock().take();

        let inline = core::mem::take(&mut *self.inline.lock());
        drop(inline);
        self.shared.callbacks.lock().clear();
        self.shared.graph.collect_garbage();

        self.shared.resources.shutdown();
        debug!("engine uninitialized");
    }
}

impl core::fmt::Debug for Engine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Engine")
            .field("sample_rate", &self.shared.sample_rate)
            .field("channels", &self.shared.channels)
            .field("running", &self.is_running())
            .finish()
    }
}

fn nonzero_or<T: PartialEq + Default>(value: T, fallback: T) -> T {
    if value == T::default() {
        fallback
    } else {
        value
    }
}

#[cfg(feature = "cpal_sink")]
fn default_backend(_config: &EngineConfig) -> Result<Box<dyn Backend>> {
    Ok(Box::new(crate::backend::CpalBackend::default_output()?))
}

#[cfg(not(feature = "cpal_sink"))]
fn default_backend(config: &EngineConfig) -> Result<Box<dyn Backend>> {
    let sample_rate = nonzero_or(config.sample_rate, DEFAULT_SAMPLE_RATE);
    let channels = nonzero_or(config.channels, DEFAULT_CHANNELS);
    debug!("no device backend compiled in, using the null backend");
    Ok(Box::new(crate::backend::NullBackend::new(
        channels,
        sample_rate,
        config.period_frames(sample_rate),
    )))
}
