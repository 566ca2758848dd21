//! A device-less backend that renders at real-time pace and discards the
//! output.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use super::{Backend, RenderSlot};
use crate::error::{Error, Result};

pub struct NullBackend {
    channels: usize,
    sample_rate: u32,
    period_frames: u32,
    running: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl NullBackend {
    pub fn new(channels: usize, sample_rate: u32, period_frames: u32) -> Self {
        Self {
            channels: channels.max(1),
            sample_rate: sample_rate.max(1),
            period_frames: period_frames.max(1),
            running: Arc::new(AtomicBool::new(false)),
            frames: Arc::new(AtomicU64::new(0)),
            thread: None,
        }
    }

    /// Frames rendered since creation.
    pub fn frames_rendered(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// Shared counter of rendered frames, readable after the backend has
    /// moved into an engine.
    pub fn frame_counter(&self) -> Arc<AtomicU64> {
        self.frames.clone()
    }
}

impl Backend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn start(&mut self, slot: RenderSlot) -> Result<()> {
        if self.thread.is_some() {
            return Err(Error::DeviceNotStopped);
        }
        self.running.store(true, Ordering::Release);

        let running = self.running.clone();
        let frames = self.frames.clone();
        let period = self.period_frames as usize;
        let period_time = Duration::from_secs_f64(period as f64 / self.sample_rate as f64);
        let mut buffer = vec![0.0f32; period * slot.channels()];

        let handle = thread::Builder::new()
            .name("raumklang-null".into())
            .spawn(move || {
                let mut deadline = Instant::now();
                while running.load(Ordering::Acquire) {
                    slot.render(&mut buffer);
                    frames.fetch_add(period as u64, Ordering::AcqRel);

                    deadline += period_time;
                    let now = Instant::now();
                    if deadline > now {
                        thread::sleep(deadline - now);
                    } else {
                        deadline = now;
                    }
                }
            })
            .map_err(|e| {
                error!(%e, "failed to spawn null backend thread");
                self.running.store(false, Ordering::Release);
                Error::FailedToStartBackendDevice
            })?;

        self.thread = Some(handle);
        debug!(period, sample_rate = self.sample_rate, "null backend started");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            handle.join().map_err(|_| Error::FailedToStopBackendDevice)?;
            debug!("null backend stopped");
        }
        Ok(())
    }
}

impl Drop for NullBackend {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
