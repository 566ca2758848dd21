//! Streaming: a pump thread reads ahead from data sources into per-sound
//! chunk rings that the render thread drains.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, error, trace};

use crate::error::{Error, Result};
use crate::node::NO_TIME;
use crate::source::{DataFormat, DataSource};

/// Samples per chunk, shared by all channels of a frame.
pub(crate) const CHUNK_SAMPLES: usize = 2048;

/// How long the pump sleeps when no ring has room.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

pub(crate) struct StreamChunk {
    generation: u64,
    /// Source frame index of the first frame.
    start: u64,
    frames: usize,
    end: bool,
    data: [f32; CHUNK_SAMPLES],
}

#[derive(Debug)]
pub(crate) struct StreamShared {
    generation: AtomicU64,
    seek_target: AtomicU64,
    looping: AtomicBool,
    format: OnceLock<DataFormat>,
    length: AtomicU64,
    error: OnceLock<Error>,
}

impl StreamShared {
    fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            seek_target: AtomicU64::new(0),
            looping: AtomicBool::new(false),
            format: OnceLock::new(),
            length: AtomicU64::new(NO_TIME),
            error: OnceLock::new(),
        }
    }

    pub(crate) fn format(&self) -> Option<DataFormat> {
        self.format.get().copied()
    }

    pub(crate) fn length(&self) -> Option<u64> {
        match self.length.load(Ordering::Acquire) {
            NO_TIME => None,
            l => Some(l),
        }
    }

    pub(crate) fn fail(&self, error: Error) {
        let _ = self.error.set(error);
    }
}

/// Render-side end of a stream.
pub struct StreamReader {
    shared: Arc<StreamShared>,
    chunks: Consumer<StreamChunk>,
    offset: usize,
    cursor: u64,
    reached_end: bool,
}

/// Pump-side end of a stream, before a source is bound to it.
pub(crate) struct StreamFeed {
    shared: Arc<StreamShared>,
    chunks: Producer<StreamChunk>,
}

impl StreamFeed {
    pub(crate) fn fail(&self, error: Error) {
        self.shared.fail(error);
    }
}

/// A connected reader and feed with room for `capacity` chunks.
pub(crate) fn channel(capacity: usize) -> (StreamReader, StreamFeed) {
    let shared = Arc::new(StreamShared::new());
    let (producer, consumer) = RingBuffer::new(capacity.max(2));
    (
        StreamReader {
            shared: shared.clone(),
            chunks: consumer,
            offset: 0,
            cursor: 0,
            reached_end: false,
        },
        StreamFeed {
            shared,
            chunks: producer,
        },
    )
}

impl StreamReader {
    pub(crate) fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    /// Let the pump read on from frame 0 after the source ends, so a loop
    /// point is already buffered when playback reaches it.
    pub(crate) fn set_looping(&self, looping: bool) {
        self.shared.looping.store(looping, Ordering::Release);
    }
}

impl DataSource for StreamReader {
    fn format(&self) -> DataFormat {
        self.shared
            .format()
            .unwrap_or_else(|| DataFormat::f32(1, 48_000))
    }

    fn read_frames(&mut self, out: &mut [f32], frames: usize) -> Result<usize> {
        if let Some(e) = self.shared.error.get() {
            return Err(*e);
        }
        let Some(format) = self.shared.format() else {
            return Err(Error::NoDataAvailable);
        };
        let channels = format.channels;
        let generation = self.shared.generation.load(Ordering::Acquire);
        let frames = frames.min(out.len() / channels);

        let mut written = 0;
        while written < frames && !self.reached_end {
            let Ok(chunk) = self.chunks.peek() else {
                break;
            };
            if chunk.generation != generation {
                let _ = self.chunks.pop();
                self.offset = 0;
                continue;
            }

            let n = (chunk.frames - self.offset).min(frames - written);
            let src = &chunk.data[self.offset * channels..(self.offset + n) * channels];
            out[written * channels..(written + n) * channels].copy_from_slice(src);
            written += n;
            self.offset += n;
            self.cursor += n as u64;

            if self.offset == chunk.frames {
                self.reached_end = chunk.end;
                let _ = self.chunks.pop();
                self.offset = 0;
            }
        }

        if written > 0 {
            Ok(written)
        } else if self.reached_end {
            Err(Error::AtEnd)
        } else {
            Err(Error::NoDataAvailable)
        }
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<()> {
        if let Some(length) = self.shared.length() {
            if frame > length {
                return Err(Error::BadSeek);
            }
        }
        // A looping pump has usually queued the rewind already.
        let generation = self.shared.generation.load(Ordering::Acquire);
        let buffered = self.offset == 0
            && self
                .chunks
                .peek()
                .is_ok_and(|c| c.generation == generation && c.start == frame);
        if buffered {
            self.cursor = frame;
            self.reached_end = false;
            return Ok(());
        }

        self.shared.seek_target.store(frame, Ordering::Release);
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        self.offset = 0;
        self.cursor = frame;
        self.reached_end = false;
        Ok(())
    }

    fn cursor(&self) -> u64 {
        self.cursor
    }

    fn length(&self) -> Option<u64> {
        self.shared.length()
    }
}

struct StreamJob {
    source: Box<dyn DataSource>,
    feed: StreamFeed,
    generation: u64,
    chunk_frames: usize,
    /// Source frame the next chunk starts at.
    position: u64,
    at_end: bool,
    finished: bool,
}

impl StreamJob {
    /// Top up the ring. Returns false once the reader is gone.
    fn service(&mut self) -> bool {
        if self.feed.chunks.is_abandoned() {
            return false;
        }

        let generation = self.feed.shared.generation.load(Ordering::Acquire);
        if generation != self.generation {
            self.generation = generation;
            let target = self.feed.shared.seek_target.load(Ordering::Acquire);
            if let Err(e) = self.source.seek_to_frame(target) {
                debug!(target, ?e, "stream seek failed");
            }
            self.position = target;
            self.at_end = false;
            self.finished = false;
        }
        if self.finished || (self.at_end && !self.rewind()) {
            return true;
        }

        while self.feed.chunks.slots() > 0 {
            let mut chunk = StreamChunk {
                generation,
                start: self.position,
                frames: 0,
                end: false,
                data: [0.0; CHUNK_SAMPLES],
            };
            match self.source.read_frames(&mut chunk.data, self.chunk_frames) {
                Ok(0) | Err(Error::AtEnd) => chunk.end = true,
                Ok(n) => chunk.frames = n,
                Err(Error::NoDataAvailable) | Err(Error::Busy) => break,
                Err(e) => {
                    error!(?e, "stream source failed");
                    self.feed.fail(e);
                    self.finished = true;
                    break;
                }
            }
            let (end, frames) = (chunk.end, chunk.frames);
            if self.feed.chunks.push(chunk).is_err() {
                break;
            }
            self.position += frames as u64;
            if end {
                self.at_end = true;
                if !self.rewind() {
                    break;
                }
            }
        }
        true
    }

    /// Start another pass from frame 0 if the reader loops.
    ///
    /// The end-of-source chunk is already queued, so the reader still sees
    /// the loop point; the frames after it are the head of the source.
    fn rewind(&mut self) -> bool {
        // A source that ended without producing anything would spin.
        if !self.feed.shared.looping.load(Ordering::Acquire) || self.position == 0 {
            return false;
        }
        match self.source.seek_to_frame(0) {
            Ok(()) => {
                trace!("stream wrapped");
                self.position = 0;
                self.at_end = false;
                true
            }
            Err(e) => {
                debug!(?e, "stream rewind failed");
                self.finished = true;
                false
            }
        }
    }
}

enum PumpMsg {
    Add(StreamJob),
    Shutdown,
}

/// Owner of the pump thread.
pub(crate) struct StreamPump {
    tx: Option<Sender<PumpMsg>>,
    handle: Option<JoinHandle<()>>,
    chunk_frames: usize,
}

impl StreamPump {
    pub(crate) fn spawn(chunk_frames: usize) -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let handle = thread::Builder::new()
            .name("raumklang-stream".into())
            .spawn(move || pump_thread(rx))
            .map_err(|e| {
                error!(%e, "failed to spawn stream pump");
                Error::Generic
            })?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            chunk_frames: chunk_frames.max(1),
        })
    }

    /// A handle worker threads use to bind opened sources.
    pub(crate) fn binder(&self) -> StreamBinder {
        StreamBinder {
            tx: self.tx.clone(),
            chunk_frames: self.chunk_frames,
        }
    }

    pub(crate) fn shutdown(&mut self) {
        // Binders keep their own senders alive, so ask the thread to exit.
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(PumpMsg::Shutdown);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            debug!("stream pump stopped");
        }
    }
}

impl Drop for StreamPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Clone)]
pub(crate) struct StreamBinder {
    tx: Option<Sender<PumpMsg>>,
    chunk_frames: usize,
}

impl StreamBinder {
    /// Start pumping `source` into `feed`.
    pub(crate) fn bind(&self, feed: StreamFeed, source: Box<dyn DataSource>) -> Result<()> {
        let format = source.format();
        if let Err(e) = format.validate() {
            feed.fail(e);
            return Err(e);
        }
        let _ = feed.shared.format.set(format);
        if let Some(length) = source.length() {
            feed.shared.length.store(length, Ordering::Release);
        }
        let job = StreamJob {
            generation: feed.shared.generation.load(Ordering::Acquire),
            chunk_frames: self.chunk_frames.min(CHUNK_SAMPLES / format.channels),
            position: source.cursor(),
            source,
            feed,
            at_end: false,
            finished: false,
        };
        let tx = self.tx.as_ref().ok_or(Error::Unavailable)?;
        tx.send(PumpMsg::Add(job)).map_err(|_| Error::Unavailable)
    }
}

fn pump_thread(rx: Receiver<PumpMsg>) {
    debug!("stream pump started");
    let mut jobs: Vec<StreamJob> = Vec::new();
    loop {
        let msg = if jobs.is_empty() {
            match rx.recv() {
                Ok(msg) => Some(msg),
                Err(_) => break,
            }
        } else {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(msg) => Some(msg),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        };
        let mut pending = msg.into_iter().chain(core::iter::from_fn(|| rx.try_recv().ok()));
        if pending.any(|msg| match msg {
            PumpMsg::Add(job) => {
                jobs.push(job);
                trace!(streams = jobs.len(), "stream added");
                false
            }
            PumpMsg::Shutdown => true,
        }) {
            break;
        }
        jobs.retain_mut(StreamJob::service);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use std::time::Instant;

    fn read_all(reader: &mut StreamReader, frames: usize) -> Vec<f32> {
        let mut out = Vec::new();
        let mut buf = [0.0f32; 256];
        let deadline = Instant::now() + Duration::from_secs(5);
        while out.len() < frames && Instant::now() < deadline {
            match reader.read_frames(&mut buf, 256) {
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(Error::AtEnd) => break,
                Err(_) => thread::sleep(Duration::from_millis(1)),
            }
        }
        out
    }

    #[test]
    fn streams_whole_source_then_ends() {
        let mut pump = StreamPump::spawn(100).unwrap();
        let samples: Vec<f32> = (0..1_000).map(|i| i as f32).collect();
        let source = MemorySource::from_samples(1, 48_000, samples.clone()).unwrap();
        let (mut reader, feed) = channel(4);
        pump.binder().bind(feed, Box::new(source)).unwrap();

        let got = read_all(&mut reader, 1_000);
        assert_eq!(got, samples);

        let mut buf = [0.0f32; 16];
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match reader.read_frames(&mut buf, 16) {
                Err(Error::AtEnd) => break,
                _ if Instant::now() > deadline => panic!("stream never ended"),
                _ => thread::sleep(Duration::from_millis(1)),
            }
        }
        pump.shutdown();
    }

    #[test]
    fn looping_stream_is_buffered_across_the_loop_point() {
        let pump = StreamPump::spawn(64).unwrap();
        let samples: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let source = MemorySource::from_samples(1, 48_000, samples).unwrap();
        let (mut reader, feed) = channel(8);
        reader.set_looping(true);
        pump.binder().bind(feed, Box::new(source)).unwrap();

        let expected: Vec<f32> = (0..100).map(|i| i as f32).collect();
        for _ in 0..3 {
            // Reads stop at the loop point until the reader rewinds.
            assert_eq!(read_all(&mut reader, usize::MAX), expected);

            let deadline = Instant::now() + Duration::from_secs(5);
            while reader.chunks.is_empty() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            let generation = reader.shared.generation.load(Ordering::Acquire);
            reader.seek_to_frame(0).unwrap();
            assert_eq!(reader.shared.generation.load(Ordering::Acquire), generation);
            assert_eq!(reader.cursor(), 0);
        }
    }

    #[test]
    fn unplayable_formats_are_refused() {
        struct Silent(DataFormat);
        impl DataSource for Silent {
            fn format(&self) -> DataFormat {
                self.0
            }
            fn read_frames(&mut self, _: &mut [f32], _: usize) -> Result<usize> {
                Err(Error::AtEnd)
            }
            fn seek_to_frame(&mut self, _: u64) -> Result<()> {
                Ok(())
            }
            fn cursor(&self) -> u64 {
                0
            }
            fn length(&self) -> Option<u64> {
                None
            }
        }

        let pump = StreamPump::spawn(64).unwrap();
        for format in [DataFormat::f32(16, 48_000), DataFormat::f32(2, 0)] {
            let (reader, feed) = channel(2);
            let bound = pump.binder().bind(feed, Box::new(Silent(format)));
            assert_eq!(bound, Err(Error::InvalidArgs));
            assert!(reader.shared.error.get().is_some());
        }
    }

    #[test]
    fn seek_discards_stale_chunks() {
        let pump = StreamPump::spawn(64).unwrap();
        let samples: Vec<f32> = (0..4_096).map(|i| i as f32).collect();
        let source = MemorySource::from_samples(1, 48_000, samples).unwrap();
        let (mut reader, feed) = channel(8);
        pump.binder().bind(feed, Box::new(source)).unwrap();

        let first = read_all(&mut reader, 10);
        assert_eq!(first[0], 0.0);
        reader.seek_to_frame(3_000).unwrap();
        assert_eq!(reader.cursor(), 3_000);
        let after = read_all(&mut reader, 4);
        assert_eq!(&after[..4], &[3_000.0, 3_001.0, 3_002.0, 3_003.0]);
        assert_eq!(reader.seek_to_frame(5_000), Err(Error::BadSeek));
    }
}
