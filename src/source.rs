//! Data sources: where sound nodes get their frames from.
//!
//! Decoding containers is outside this crate. A [`DataSource`] hands out
//! interleaved `f32` frames and a [`SourceLoader`] maps a source identity to
//! one.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Most channels a source or bus may carry.
pub const MAX_CHANNELS: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    U8,
    S16,
    S24,
    S32,
    #[default]
    F32,
}

/// Shape of the frames a source produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DataFormat {
    pub format: SampleFormat,
    pub channels: usize,
    pub sample_rate: u32,
}

impl DataFormat {
    pub fn f32(channels: usize, sample_rate: u32) -> Self {
        Self {
            format: SampleFormat::F32,
            channels,
            sample_rate,
        }
    }

    /// `InvalidArgs` unless the format has 1..=[`MAX_CHANNELS`] channels and
    /// a non-zero sample rate.
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.channels > MAX_CHANNELS || self.sample_rate == 0 {
            return Err(Error::InvalidArgs);
        }
        Ok(())
    }
}

/// A seekable producer of interleaved `f32` frames.
///
/// `read_frames` fills up to `frames` frames of `out` and returns how many it
/// wrote. A short count is allowed; `Err(Error::AtEnd)` means the source is
/// exhausted and any other error means no data is ready yet.
pub trait DataSource: Send {
    fn format(&self) -> DataFormat;

    fn read_frames(&mut self, out: &mut [f32], frames: usize) -> Result<usize>;

    fn seek_to_frame(&mut self, frame: u64) -> Result<()>;

    /// Index of the next frame `read_frames` will produce.
    fn cursor(&self) -> u64;

    /// Total length in frames, if known.
    fn length(&self) -> Option<u64>;
}

impl<S: DataSource + ?Sized> DataSource for Box<S> {
    fn format(&self) -> DataFormat {
        (**self).format()
    }

    fn read_frames(&mut self, out: &mut [f32], frames: usize) -> Result<usize> {
        (**self).read_frames(out, frames)
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<()> {
        (**self).seek_to_frame(frame)
    }

    fn cursor(&self) -> u64 {
        (**self).cursor()
    }

    fn length(&self) -> Option<u64> {
        (**self).length()
    }
}

/// Fully decoded interleaved PCM.
#[derive(Clone, Debug, PartialEq)]
pub struct PcmBuffer {
    format: DataFormat,
    samples: Vec<f32>,
}

impl PcmBuffer {
    /// `samples` is interleaved; a trailing partial frame is dropped.
    pub fn new(channels: usize, sample_rate: u32, mut samples: Vec<f32>) -> Result<Self> {
        let format = DataFormat::f32(channels, sample_rate);
        format.validate()?;
        samples.truncate(samples.len() - samples.len() % channels);
        Ok(Self { format, samples })
    }

    /// Read `source` from its current cursor to the end.
    pub fn decode(source: &mut dyn DataSource) -> Result<Self> {
        let format = source.format();
        if format.channels == 0 || format.channels > MAX_CHANNELS {
            return Err(Error::InvalidData);
        }
        const CHUNK: usize = 4096;
        let mut samples = Vec::with_capacity(
            source.length().map_or(0, |l| l as usize * format.channels),
        );
        let mut chunk = vec![0.0; CHUNK * format.channels];
        loop {
            match source.read_frames(&mut chunk, CHUNK) {
                Ok(0) | Err(Error::AtEnd) => break,
                Ok(n) => samples.extend_from_slice(&chunk[..n * format.channels]),
                Err(e) => return Err(e),
            }
        }
        Self::new(format.channels, format.sample_rate, samples)
    }

    #[inline]
    pub fn format(&self) -> DataFormat {
        self.format
    }

    #[inline]
    pub fn frames(&self) -> u64 {
        (self.samples.len() / self.format.channels) as u64
    }

    #[inline]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }
}

/// A cursor over a shared [`PcmBuffer`].
#[derive(Clone, Debug)]
pub struct MemorySource {
    buffer: Arc<PcmBuffer>,
    cursor: u64,
}

impl MemorySource {
    pub fn new(buffer: Arc<PcmBuffer>) -> Self {
        Self { buffer, cursor: 0 }
    }

    /// Convenience for building a source from owned interleaved samples.
    pub fn from_samples(channels: usize, sample_rate: u32, samples: Vec<f32>) -> Result<Self> {
        Ok(Self::new(Arc::new(PcmBuffer::new(channels, sample_rate, samples)?)))
    }

    pub fn buffer(&self) -> &Arc<PcmBuffer> {
        &self.buffer
    }
}

impl DataSource for MemorySource {
    fn format(&self) -> DataFormat {
        self.buffer.format()
    }

    fn read_frames(&mut self, out: &mut [f32], frames: usize) -> Result<usize> {
        let channels = self.buffer.format.channels;
        let remaining = self.buffer.frames().saturating_sub(self.cursor) as usize;
        if remaining == 0 {
            return Err(Error::AtEnd);
        }
        let n = frames.min(remaining).min(out.len() / channels);
        let start = self.cursor as usize * channels;
        out[..n * channels].copy_from_slice(&self.buffer.samples[start..start + n * channels]);
        self.cursor += n as u64;
        Ok(n)
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<()> {
        if frame > self.buffer.frames() {
            return Err(Error::BadSeek);
        }
        self.cursor = frame;
        Ok(())
    }

    fn cursor(&self) -> u64 {
        self.cursor
    }

    fn length(&self) -> Option<u64> {
        Some(self.buffer.frames())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum WaveformKind {
    #[default]
    Sine,
    Square,
    Triangle,
    Sawtooth,
}

/// An endless test tone.
#[derive(Clone, Debug)]
pub struct Waveform {
    kind: WaveformKind,
    frequency: f32,
    amplitude: f32,
    format: DataFormat,
    cursor: u64,
}

impl Waveform {
    pub fn new(kind: WaveformKind, frequency: f32, channels: usize, sample_rate: u32) -> Self {
        Self {
            kind,
            frequency: frequency.max(0.0),
            amplitude: 0.25,
            format: DataFormat::f32(channels.clamp(1, MAX_CHANNELS), sample_rate.max(1)),
            cursor: 0,
        }
    }

    pub fn sine(frequency: f32, sample_rate: u32) -> Self {
        Self::new(WaveformKind::Sine, frequency, 1, sample_rate)
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude.clamp(0.0, 1.0);
        self
    }

    #[inline]
    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    #[inline]
    pub fn amplitude(&self) -> f32 {
        self.amplitude
    }

    fn sample_at(&self, frame: u64) -> f32 {
        let period = self.format.sample_rate as f64 / self.frequency as f64;
        if !period.is_finite() || period <= 0.0 {
            return 0.0;
        }
        let phase = ((frame as f64 / period).fract()) as f32;
        let v = match self.kind {
            WaveformKind::Sine => (phase * core::f32::consts::TAU).sin(),
            WaveformKind::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            WaveformKind::Triangle => 1.0 - 4.0 * (phase - 0.5).abs(),
            WaveformKind::Sawtooth => 2.0 * phase - 1.0,
        };
        v * self.amplitude
    }
}

impl DataSource for Waveform {
    fn format(&self) -> DataFormat {
        self.format
    }

    fn read_frames(&mut self, out: &mut [f32], frames: usize) -> Result<usize> {
        let channels = self.format.channels;
        let n = frames.min(out.len() / channels);
        for frame in out.chunks_exact_mut(channels).take(n) {
            let s = self.sample_at(self.cursor);
            frame.iter_mut().for_each(|o| *o = s);
            self.cursor += 1;
        }
        Ok(n)
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<()> {
        self.cursor = frame;
        Ok(())
    }

    fn cursor(&self) -> u64 {
        self.cursor
    }

    fn length(&self) -> Option<u64> {
        None
    }
}

/// Resolves a source identity to a data source.
pub trait SourceLoader: Send + Sync {
    fn open(&self, identity: &str) -> Result<Box<dyn DataSource>>;
}

/// A loader serving clips registered in memory.
#[derive(Default)]
pub struct MemoryLoader {
    clips: RwLock<HashMap<String, Arc<PcmBuffer>>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `buffer` under `identity`, replacing any previous clip.
    pub fn insert(&self, identity: impl Into<String>, buffer: PcmBuffer) {
        self.clips.write().insert(identity.into(), Arc::new(buffer));
    }

    pub fn remove(&self, identity: &str) -> bool {
        self.clips.write().remove(identity).is_some()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.clips.read().contains_key(identity)
    }
}

impl SourceLoader for MemoryLoader {
    fn open(&self, identity: &str) -> Result<Box<dyn DataSource>> {
        let buffer = self
            .clips
            .read()
            .get(identity)
            .cloned()
            .ok_or(Error::DoesNotExist)?;
        Ok(Box::new(MemorySource::new(buffer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_reads_then_ends() {
        let mut src = MemorySource::from_samples(2, 48_000, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0])
            .unwrap();
        assert_eq!(src.length(), Some(3));
        let mut out = [0.0; 4];
        assert_eq!(src.read_frames(&mut out, 2).unwrap(), 2);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(src.read_frames(&mut out, 2).unwrap(), 1);
        assert_eq!(src.read_frames(&mut out, 2), Err(Error::AtEnd));
        src.seek_to_frame(1).unwrap();
        assert_eq!(src.cursor(), 1);
        assert_eq!(src.seek_to_frame(4), Err(Error::BadSeek));
    }

    #[test]
    fn decode_collects_everything() {
        let mut wave = Waveform::sine(440.0, 48_000);
        let mut limited = MemorySource::from_samples(1, 48_000, vec![0.5; 10_000]).unwrap();
        let pcm = PcmBuffer::decode(&mut limited).unwrap();
        assert_eq!(pcm.frames(), 10_000);
        let mut out = [0.0; 8];
        assert_eq!(wave.read_frames(&mut out, 8).unwrap(), 8);
        assert_eq!(out[0], 0.0);
        assert!(out[1] > 0.0);
    }

    #[test]
    fn loader_resolves_registered_clips() {
        let loader = MemoryLoader::new();
        loader.insert("click", PcmBuffer::new(1, 48_000, vec![1.0; 4]).unwrap());
        assert!(loader.open("click").is_ok());
        assert_eq!(loader.open("missing").err(), Some(Error::DoesNotExist));
    }

    #[test]
    fn rejects_bad_shapes() {
        assert_eq!(PcmBuffer::new(0, 48_000, vec![]), Err(Error::InvalidArgs));
        assert_eq!(PcmBuffer::new(9, 48_000, vec![]), Err(Error::InvalidArgs));
    }
}
