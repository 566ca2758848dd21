//! Engine, sound and resource manager configuration.

use std::sync::Arc;

use crate::listener::MAX_LISTENERS;
use crate::node::NodeId;
use crate::resource::Fence;
use crate::sound::SoundFlags;
use crate::source::{DataSource, SourceLoader};
use crate::spatializer::PanLaw;

pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_CHANNELS: usize = 2;

/// Configuration for [`ResourceManager`](crate::ResourceManager).
#[derive(Clone)]
pub struct ResourceManagerConfig {
    /// Worker threads for asynchronous loads. At least one is spawned.
    pub job_thread_count: usize,
    /// Frames per streaming chunk, capped by the chunk size.
    pub stream_chunk_frames: usize,
    /// Chunks buffered ahead per stream.
    pub stream_buffer_chunks: usize,
    /// Resolves source identities. Without one every load fails with
    /// [`Error::DoesNotExist`](crate::Error::DoesNotExist).
    pub loader: Option<Arc<dyn SourceLoader>>,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            job_thread_count: 1,
            stream_chunk_frames: 1024,
            stream_buffer_chunks: 8,
            loader: None,
        }
    }
}

impl core::fmt::Debug for ResourceManagerConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResourceManagerConfig")
            .field("job_thread_count", &self.job_thread_count)
            .field("stream_chunk_frames", &self.stream_chunk_frames)
            .field("stream_buffer_chunks", &self.stream_buffer_chunks)
            .field("loader", &self.loader.is_some())
            .finish()
    }
}

impl ResourceManagerConfig {
    pub fn with_loader(mut self, loader: Arc<dyn SourceLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_job_threads(mut self, count: usize) -> Self {
        self.job_thread_count = count;
        self
    }
}

/// Configuration for [`Engine`](crate::Engine).
///
/// Zero channel counts and sample rates mean "use the backend's", or the
/// defaults when there is no backend.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub listener_count: usize,
    pub channels: usize,
    pub sample_rate: u32,
    /// Cadence of the null backend. Milliseconds are used when frames is 0.
    pub period_size_in_frames: u32,
    pub period_size_in_milliseconds: u32,
    /// Smoothing of spatial gain changes. Milliseconds are used when frames is 0.
    pub gain_smooth_time_in_frames: u32,
    pub gain_smooth_time_in_milliseconds: u32,
    /// Volume smoothing for new sounds, in frames. 0 disables it.
    pub default_volume_smooth_time_in_frames: u32,
    /// Do not start the backend on creation.
    pub no_auto_start: bool,
    /// Create no backend; audio is pulled with `Engine::read_pcm_frames`.
    pub no_device: bool,
    pub pan_law: PanLaw,
    /// Graph arena capacity, including the endpoint.
    pub max_nodes: usize,
    pub command_queue_capacity: usize,
    pub event_queue_capacity: usize,
    pub resource_manager: ResourceManagerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listener_count: 1,
            channels: 0,
            sample_rate: 0,
            period_size_in_frames: 0,
            period_size_in_milliseconds: 10,
            gain_smooth_time_in_frames: 0,
            gain_smooth_time_in_milliseconds: 0,
            default_volume_smooth_time_in_frames: 0,
            no_auto_start: false,
            no_device: false,
            pan_law: PanLaw::default(),
            max_nodes: 1024,
            command_queue_capacity: 1024,
            event_queue_capacity: 256,
            resource_manager: ResourceManagerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// A device-less engine, the usual choice for offline rendering and tests.
    pub fn offline(channels: usize, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
            no_device: true,
            ..Self::default()
        }
    }

    pub fn with_listener_count(mut self, count: usize) -> Self {
        self.listener_count = count;
        self
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_pan_law(mut self, pan_law: PanLaw) -> Self {
        self.pan_law = pan_law;
        self
    }

    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    pub fn with_no_auto_start(mut self, no_auto_start: bool) -> Self {
        self.no_auto_start = no_auto_start;
        self
    }

    pub fn with_gain_smooth_time_in_frames(mut self, frames: u32) -> Self {
        self.gain_smooth_time_in_frames = frames;
        self
    }

    pub fn with_resource_manager(mut self, config: ResourceManagerConfig) -> Self {
        self.resource_manager = config;
        self
    }

    /// Listener count clamped to the supported range.
    pub(crate) fn listeners(&self) -> usize {
        self.listener_count.clamp(1, MAX_LISTENERS)
    }

    pub(crate) fn period_frames(&self, sample_rate: u32) -> u32 {
        if self.period_size_in_frames > 0 {
            self.period_size_in_frames
        } else {
            (crate::clock::ms_to_frames(self.period_size_in_milliseconds.max(1) as u64, sample_rate)
                as u32)
                .max(1)
        }
    }

    pub(crate) fn gain_smooth_frames(&self, sample_rate: u32) -> u32 {
        if self.gain_smooth_time_in_frames > 0 {
            self.gain_smooth_time_in_frames
        } else if self.gain_smooth_time_in_milliseconds > 0 {
            crate::clock::ms_to_frames(self.gain_smooth_time_in_milliseconds as u64, sample_rate)
                as u32
        } else {
            // Roughly 8 ms at 48 kHz.
            360
        }
    }
}

/// Where a sound's frames come from.
pub enum SoundSource {
    /// Resolved through the engine's resource manager.
    Identity(String),
    /// Played directly; never shared.
    DataSource(Box<dyn DataSource>),
}

/// Configuration for [`Sound::init_ex`](crate::Sound::init_ex).
#[derive(Default)]
pub struct SoundConfig {
    pub source: Option<SoundSource>,
    pub flags: SoundFlags,
    /// Node to attach to. `None` attaches to the endpoint unless
    /// [`SoundFlags::NO_DEFAULT_ATTACHMENT`] is set.
    pub initial_attachment: Option<NodeId>,
    /// Output channels. 0 means the engine's channel count.
    pub channels_out: usize,
    pub looping: bool,
    /// Completed once an asynchronous load has finished.
    pub done_fence: Option<Arc<Fence>>,
}

impl SoundConfig {
    pub fn from_identity(identity: impl Into<String>) -> Self {
        Self {
            source: Some(SoundSource::Identity(identity.into())),
            ..Self::default()
        }
    }

    pub fn from_data_source(source: impl DataSource + 'static) -> Self {
        Self {
            source: Some(SoundSource::DataSource(Box::new(source))),
            ..Self::default()
        }
    }

    pub fn with_flags(mut self, flags: SoundFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_attachment(mut self, parent: NodeId) -> Self {
        self.initial_attachment = Some(parent);
        self
    }

    pub fn with_channels_out(mut self, channels: usize) -> Self {
        self.channels_out = channels;
        self
    }

    pub fn with_looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn with_fence(mut self, fence: Arc<Fence>) -> Self {
        self.done_fence = Some(fence);
        self
    }
}

/// Configuration for [`SoundGroup::init_ex`](crate::SoundGroup::init_ex).
#[derive(Clone, Debug, Default)]
pub struct SoundGroupConfig {
    pub flags: SoundFlags,
    /// Parent node. `None` attaches to the endpoint unless
    /// [`SoundFlags::NO_DEFAULT_ATTACHMENT`] is set.
    pub parent: Option<NodeId>,
    /// Channels in and out. 0 means the engine's channel count.
    pub channels: usize,
}
