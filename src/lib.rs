//! # raumklang
//!
//! A real-time spatial audio engine built on a `dasp_graph` node graph.
//!
//! Sounds (leaf nodes playing a data source) and sound groups (mixing buses)
//! attach into a tree that ends at the engine's endpoint. A backend pulls
//! 64-frame blocks from the endpoint at the device cadence; every sound on
//! the way is resampled, spatialized against the nearest or pinned listener,
//! faded and panned without allocating or blocking on the render thread.
//!
//! ## Quick start
//!
//! ```
//! use raumklang::{Engine, EngineConfig, Sound, SoundFlags, Waveform};
//!
//! // No device: audio is pulled with `read_pcm_frames`.
//! let engine = Engine::new(EngineConfig::offline(2, 48_000)).unwrap();
//!
//! let tone = Waveform::sine(440.0, 48_000).with_amplitude(0.25);
//! let sound = Sound::init_from_data_source(&engine, tone, SoundFlags::NONE, None).unwrap();
//! sound.start().unwrap();
//!
//! let mut out = vec![0.0f32; 2 * 480];
//! engine.read_pcm_frames(&mut out).unwrap();
//! ```
//!
//! ## Threads
//!
//! - **Control threads** create sounds, change parameters and attach nodes.
//!   Parameters are published as whole snapshots; structural changes are
//!   queued and applied at the next render boundary.
//! - **The render thread** (the backend) only ever `try_lock`s the renderer
//!   and writes silence on contention.
//! - **Worker threads** owned by the [`ResourceManager`] decode and stream
//!   data sources.
//!
//! End-of-playback is reported by the render thread as an [`EngineEvent`]
//! and delivered on a control thread by [`Engine::dispatch_events`].

pub mod backend;
mod clock;
mod config;
mod engine;
mod error;
mod fader;
mod graph;
mod listener;
mod math;
mod node;
mod nodes;
mod resource;
mod sound;
mod source;
mod spatializer;

pub use backend::{Backend, NullBackend, RenderSlot};
#[cfg(feature = "cpal_sink")]
pub use backend::CpalBackend;
pub use clock::{frames_to_ms, frames_to_seconds, ms_to_frames, seconds_to_frames, Clock};
pub use config::{
    EngineConfig, ResourceManagerConfig, SoundConfig, SoundGroupConfig, SoundSource,
    DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE,
};
pub use engine::{Engine, EngineEvent};
pub use error::{result_code, Error, Result, SUCCESS};
pub use fader::Fader;
pub use graph::{NodeGraph, NodeKind};
pub use listener::{Listener, ListenerSet, MAX_LISTENERS};
pub use math::{Cone, Vec3};
pub use node::{NodeId, PlayState, BLOCK_FRAMES};
pub use resource::{EntryKind, Fence, LoadStatus, ResourceEntry, ResourceManager, StreamReader};
pub use sound::{NodeCore, Sound, SoundFlags, SoundGroup};
pub use source::{
    DataFormat, DataSource, MemoryLoader, MemorySource, PcmBuffer, SampleFormat, SourceLoader,
    Waveform, WaveformKind, MAX_CHANNELS,
};
pub use spatializer::{
    attenuation_gain, doppler_pitch, AttenuationModel, Emitter, PanLaw, PanMode, Positioning,
    SPEED_OF_SOUND,
};
