//! Resource manager: loads, streams and shares data sources off the render
//! thread.
//!
//! Decoded clips are shared by identity. The registry only keeps weak
//! references, so an entry lives exactly as long as some sound (or caller)
//! holds it.

mod fence;
pub(crate) mod stream;

pub use fence::Fence;
pub use stream::StreamReader;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ResourceManagerConfig;
use crate::error::{Error, Result};
use crate::sound::SoundFlags;
use crate::source::{DataFormat, PcmBuffer, SourceLoader};

use self::stream::{StreamBinder, StreamPump, StreamShared};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadStatus {
    Pending,
    Ready,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Fully decoded into memory and shareable.
    Decoded,
    /// Read ahead on demand; owned by a single sound.
    Stream,
}

/// A loaded (or loading) data source.
#[derive(Debug)]
pub struct ResourceEntry {
    identity: String,
    kind: EntryKind,
    status: AtomicU8,
    error: OnceLock<Error>,
    buffer: OnceLock<Arc<PcmBuffer>>,
    done: Fence,
    waiters: Mutex<Vec<Arc<Fence>>>,
    stream: Mutex<Option<StreamReader>>,
    stream_shared: Option<Arc<StreamShared>>,
}

impl core::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamReader")
            .field("cursor", &crate::source::DataSource::cursor(self))
            .finish_non_exhaustive()
    }
}

impl ResourceEntry {
    fn pending(identity: &str, kind: EntryKind) -> Self {
        Self {
            identity: identity.to_owned(),
            kind,
            status: AtomicU8::new(LoadStatus::Pending as u8),
            error: OnceLock::new(),
            buffer: OnceLock::new(),
            done: Fence::new(),
            waiters: Mutex::new(Vec::new()),
            stream: Mutex::new(None),
            stream_shared: None,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn status(&self) -> LoadStatus {
        match self.status.load(Ordering::Acquire) {
            1 => LoadStatus::Ready,
            2 => LoadStatus::Failed,
            _ => LoadStatus::Pending,
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.status() == LoadStatus::Ready
    }

    /// `Ok` once ready, the stored failure if the load failed, `Busy` while pending.
    pub fn result(&self) -> Result<()> {
        match self.status() {
            LoadStatus::Ready => Ok(()),
            LoadStatus::Failed => Err(self.error.get().copied().unwrap_or(Error::Generic)),
            LoadStatus::Pending => Err(Error::Busy),
        }
    }

    /// Block until the load finishes. Not for the render thread.
    pub fn wait(&self) -> Result<()> {
        self.done.wait(1);
        self.result()
    }

    pub fn format(&self) -> Option<DataFormat> {
        match self.kind {
            EntryKind::Decoded => self.buffer.get().map(|b| b.format()),
            EntryKind::Stream => self.stream_shared.as_ref().and_then(|s| s.format()),
        }
    }

    pub fn length(&self) -> Option<u64> {
        match self.kind {
            EntryKind::Decoded => self.buffer.get().map(|b| b.frames()),
            EntryKind::Stream => self.stream_shared.as_ref().and_then(|s| s.length()),
        }
    }

    pub(crate) fn buffer(&self) -> Option<&Arc<PcmBuffer>> {
        self.buffer.get()
    }

    /// Take the stream reader. Only the first sound bound to a stream gets it.
    pub(crate) fn take_stream(&self) -> Option<StreamReader> {
        self.stream.lock().take()
    }

    fn add_waiter(&self, fence: &Arc<Fence>) {
        let mut waiters = self.waiters.lock();
        if self.status() == LoadStatus::Pending {
            waiters.push(fence.clone());
        } else {
            fence.complete();
        }
    }

    fn finish(&self, result: Result<Option<Arc<PcmBuffer>>>) {
        let status = match result {
            Ok(buffer) => {
                if let Some(buffer) = buffer {
                    let _ = self.buffer.set(buffer);
                }
                debug!(identity = %self.identity, "resource ready");
                LoadStatus::Ready
            }
            Err(e) => {
                let _ = self.error.set(e);
                warn!(identity = %self.identity, ?e, "resource load failed");
                LoadStatus::Failed
            }
        };
        self.status.store(status as u8, Ordering::Release);
        for fence in self.waiters.lock().drain(..) {
            fence.complete();
        }
        self.done.complete();
    }
}

struct Inner {
    loader: Option<Arc<dyn SourceLoader>>,
    stream_buffer_chunks: usize,
    registry: Mutex<HashMap<String, Weak<ResourceEntry>>>,
    jobs: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pump: Mutex<StreamPump>,
    binder: StreamBinder,
}

impl Inner {
    fn shutdown(&self) {
        if self.jobs.lock().take().is_none() {
            return;
        }
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
        self.pump.lock().shutdown();
        debug!("resource manager shut down");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Loads and shares data sources for sounds.
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

impl ResourceManager {
    pub fn new(config: ResourceManagerConfig) -> Result<Self> {
        let pump = StreamPump::spawn(config.stream_chunk_frames)?;
        let binder = pump.binder();
        let (tx, rx) = channel::unbounded::<Job>();

        let thread_count = config.job_thread_count.max(1);
        let mut workers = Vec::with_capacity(thread_count);
        for i in 0..thread_count {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("raumklang-job-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .map_err(|e| {
                    error!(%e, "failed to spawn resource worker");
                    Error::Generic
                })?;
            workers.push(handle);
        }
        info!(threads = thread_count, "resource manager started");

        Ok(Self {
            inner: Arc::new(Inner {
                loader: config.loader,
                stream_buffer_chunks: config.stream_buffer_chunks.max(2),
                registry: Mutex::new(HashMap::new()),
                jobs: Mutex::new(Some(tx)),
                workers: Mutex::new(workers),
                pump: Mutex::new(pump),
                binder,
            }),
        })
    }

    pub fn loader(&self) -> Option<&Arc<dyn SourceLoader>> {
        self.inner.loader.as_ref()
    }

    /// Load `identity`.
    ///
    /// With [`SoundFlags::STREAM`] a fresh stream entry is opened, otherwise
    /// the clip is decoded into memory and shared with every other load of
    /// the same identity. With [`SoundFlags::ASYNC`] the work happens on a
    /// worker thread and this returns a pending entry. `fence`, if given, is
    /// completed once the entry is ready or has failed.
    pub fn load(
        &self,
        identity: &str,
        flags: SoundFlags,
        fence: Option<&Arc<Fence>>,
    ) -> Result<Arc<ResourceEntry>> {
        if flags.contains(SoundFlags::STREAM) {
            return self.open_stream(identity, flags, fence);
        }

        let mut registry = self.inner.registry.lock();
        // A failed entry stays with its holders but is never handed out
        // again; the fresh entry below replaces it and retries the load.
        let shared = registry
            .get(identity)
            .and_then(Weak::upgrade)
            .filter(|entry| entry.status() != LoadStatus::Failed);
        if let Some(entry) = shared {
            drop(registry);
            if let Some(fence) = fence {
                entry.add_waiter(fence);
            }
            if !flags.contains(SoundFlags::ASYNC) {
                entry.wait()?;
            }
            debug!(identity, "resource shared");
            return Ok(entry);
        }

        let entry = Arc::new(ResourceEntry::pending(identity, EntryKind::Decoded));
        if let Some(fence) = fence {
            entry.add_waiter(fence);
        }
        registry.retain(|_, weak| weak.strong_count() > 0);
        registry.insert(identity.to_owned(), Arc::downgrade(&entry));
        drop(registry);

        let loader = self.inner.loader.clone();
        if flags.contains(SoundFlags::ASYNC) {
            let job_entry = entry.clone();
            self.submit(Box::new(move || {
                let result = decode(loader.as_deref(), &job_entry.identity);
                job_entry.finish(result.map(Some));
            }))
            .inspect_err(|&e| entry.finish(Err(e)))?;
        } else {
            let result = decode(loader.as_deref(), identity);
            entry.finish(result.map(Some));
            entry.result()?;
        }
        Ok(entry)
    }

    fn open_stream(
        &self,
        identity: &str,
        flags: SoundFlags,
        fence: Option<&Arc<Fence>>,
    ) -> Result<Arc<ResourceEntry>> {
        let (reader, feed) = stream::channel(self.inner.stream_buffer_chunks);
        let mut entry = ResourceEntry::pending(identity, EntryKind::Stream);
        entry.stream_shared = Some(reader.shared().clone());
        *entry.stream.get_mut() = Some(reader);
        let entry = Arc::new(entry);
        if let Some(fence) = fence {
            entry.add_waiter(fence);
        }

        let loader = self.inner.loader.clone();
        let binder = self.inner.binder.clone();
        let open = {
            let entry = entry.clone();
            move || {
                let result = loader
                    .as_deref()
                    .ok_or(Error::DoesNotExist)
                    .and_then(|l| l.open(&entry.identity))
                    .and_then(|source| binder.bind(feed, source));
                if let Err(e) = result {
                    if let Some(shared) = &entry.stream_shared {
                        shared.fail(e);
                    }
                }
                entry.finish(result.map(|_| None));
            }
        };

        if flags.contains(SoundFlags::ASYNC) {
            self.submit(Box::new(open))
                .inspect_err(|&e| entry.finish(Err(e)))?;
        } else {
            open();
            entry.result()?;
        }
        debug!(identity, "stream opened");
        Ok(entry)
    }

    /// Drop a reference to `entry`. Its storage is freed once no sound holds it.
    pub fn release(&self, entry: Arc<ResourceEntry>) {
        let identity = entry.identity.clone();
        drop(entry);
        let mut registry = self.inner.registry.lock();
        if registry
            .get(&identity)
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            registry.remove(&identity);
            debug!(identity, "resource released");
        }
    }

    /// Number of decoded entries still alive.
    pub fn entry_count(&self) -> usize {
        self.inner
            .registry
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// The live shared entry for `identity`, if any.
    pub fn get(&self, identity: &str) -> Option<Arc<ResourceEntry>> {
        self.inner.registry.lock().get(identity).and_then(Weak::upgrade)
    }

    fn submit(&self, job: Job) -> Result<()> {
        let jobs = self.inner.jobs.lock();
        let tx = jobs.as_ref().ok_or(Error::Unavailable)?;
        tx.send(job).map_err(|_| Error::Unavailable)
    }

    /// Stop the worker and stream threads. Pending jobs finish first.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

fn decode(loader: Option<&dyn SourceLoader>, identity: &str) -> Result<Arc<PcmBuffer>> {
    let mut source = loader.ok_or(Error::DoesNotExist)?.open(identity)?;
    PcmBuffer::decode(&mut *source).map(Arc::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryLoader;
    use std::time::Duration;

    fn manager() -> (ResourceManager, Arc<MemoryLoader>) {
        let loader = Arc::new(MemoryLoader::new());
        loader.insert("tone", PcmBuffer::new(1, 48_000, vec![0.5; 480]).unwrap());
        let config = ResourceManagerConfig {
            loader: Some(loader.clone()),
            ..ResourceManagerConfig::default()
        };
        (ResourceManager::new(config).unwrap(), loader)
    }

    #[test]
    fn decoded_entries_are_shared_and_released() {
        let (rm, _) = manager();
        let a = rm.load("tone", SoundFlags::DECODE, None).unwrap();
        let b = rm.load("tone", SoundFlags::DECODE, None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.length(), Some(480));
        assert_eq!(rm.entry_count(), 1);
        rm.release(a);
        assert_eq!(rm.entry_count(), 1);
        rm.release(b);
        assert_eq!(rm.entry_count(), 0);
    }

    #[test]
    fn sync_failure_is_returned() {
        let (rm, _) = manager();
        assert_eq!(
            rm.load("nope", SoundFlags::DECODE, None).err(),
            Some(Error::DoesNotExist)
        );
        assert_eq!(rm.entry_count(), 0);
    }

    #[test]
    fn async_load_completes_fence_on_success_and_failure() {
        let (rm, _) = manager();
        let fence = Arc::new(Fence::new());
        let ok = rm
            .load("tone", SoundFlags::DECODE | SoundFlags::ASYNC, Some(&fence))
            .unwrap();
        let bad = rm
            .load("nope", SoundFlags::DECODE | SoundFlags::ASYNC, Some(&fence))
            .unwrap();
        assert!(fence.wait_timeout(2, Duration::from_secs(5)));
        assert_eq!(ok.result(), Ok(()));
        assert_eq!(bad.result(), Err(Error::DoesNotExist));
        assert_eq!(bad.status(), LoadStatus::Failed);
    }

    #[test]
    fn failed_entries_are_retried() {
        let (rm, loader) = manager();
        let fence = Arc::new(Fence::new());
        let failed = rm
            .load("late", SoundFlags::DECODE | SoundFlags::ASYNC, Some(&fence))
            .unwrap();
        assert!(fence.wait_timeout(1, Duration::from_secs(5)));
        assert_eq!(failed.status(), LoadStatus::Failed);

        loader.insert("late", PcmBuffer::new(2, 48_000, vec![0.1; 64]).unwrap());
        let retried = rm.load("late", SoundFlags::DECODE, None).unwrap();
        assert!(!Arc::ptr_eq(&failed, &retried));
        assert_eq!(retried.status(), LoadStatus::Ready);
        assert_eq!(retried.length(), Some(32));
        assert!(Arc::ptr_eq(&rm.get("late").unwrap(), &retried));

        // Letting go of the stale failure leaves the live entry registered.
        rm.release(failed);
        assert_eq!(rm.entry_count(), 1);
    }

    #[test]
    fn streams_are_not_shared() {
        let (rm, _) = manager();
        let a = rm.load("tone", SoundFlags::STREAM, None).unwrap();
        let b = rm.load("tone", SoundFlags::STREAM, None).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.kind(), EntryKind::Stream);
        assert_eq!(a.format().map(|f| f.channels), Some(1));
        assert!(a.take_stream().is_some());
        assert!(a.take_stream().is_none());
        assert_eq!(rm.entry_count(), 0);
        rm.shutdown();
    }
}
