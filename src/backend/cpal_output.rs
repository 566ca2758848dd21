//! Output through a CPAL device.
//!
//! The device callback calls the render slot directly; there is no ring
//! buffer between the graph and the device.

use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SupportedStreamConfig};
use crossbeam::channel::{self, Sender};
use tracing::{debug, error, info};

use super::{Backend, RenderSlot};
use crate::error::{Error, Result};

/// A CPAL output device.
pub struct CpalBackend {
    device: cpal::Device,
    config: SupportedStreamConfig,
    name: String,
    running: Option<Running>,
}

struct Running {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

impl CpalBackend {
    /// The host's default output device.
    pub fn default_output() -> Result<Self> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(Error::NoDevice)?;
        Self::from_device(device)
    }

    /// Every output device that reports a default configuration.
    pub fn list_outputs() -> Vec<Self> {
        let host = cpal::default_host();
        host.output_devices()
            .map(|devices| devices.filter_map(|d| Self::from_device(d).ok()).collect())
            .unwrap_or_default()
    }

    fn from_device(device: cpal::Device) -> Result<Self> {
        let config = device
            .default_output_config()
            .map_err(|_| Error::FailedToOpenBackendDevice)?;
        let name = device.name().unwrap_or_else(|_| "Unknown".into());
        Ok(Self {
            device,
            config,
            name,
            running: None,
        })
    }
}

impl Backend for CpalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate().0
    }

    fn channels(&self) -> usize {
        self.config.channels() as usize
    }

    fn start(&mut self, slot: RenderSlot) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::DeviceNotStopped);
        }

        // cpal streams are not Send, so the stream lives on its own thread.
        let device = self.device.clone();
        let config = self.config.clone();
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let (ready_tx, ready_rx) = channel::bounded::<Result<()>>(1);

        let thread = thread::Builder::new()
            .name("raumklang-cpal".into())
            .spawn(move || {
                let stream = match build_stream(&device, &config, slot) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    error!(%e, "failed to start output stream");
                    let _ = ready_tx.send(Err(Error::FailedToStartBackendDevice));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|_| Error::FailedToStartBackendDevice)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(Error::FailedToStartBackendDevice);
            }
        }

        info!(device = %self.name, sample_rate = self.sample_rate(), "cpal backend started");
        self.running = Some(Running {
            stop: stop_tx,
            thread,
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        let _ = running.stop.send(());
        running
            .thread
            .join()
            .map_err(|_| Error::FailedToStopBackendDevice)?;
        debug!(device = %self.name, "cpal backend stopped");
        Ok(())
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &SupportedStreamConfig,
    slot: RenderSlot,
) -> Result<cpal::Stream> {
    let stream_config = config.config();
    let on_error = |err: cpal::StreamError| error!(%err, "cpal stream error");
    // Integer formats render into this first. Sized for a generous period so
    // the callback does not allocate in practice.
    let mut scratch = vec![0.0f32; 8192 * stream_config.channels as usize];

    let stream = match config.sample_format() {
        SampleFormat::F32 => device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _| slot.render(data),
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            &stream_config,
            move |data: &mut [i16], _| {
                render_scratch(&slot, &mut scratch, data.len());
                for (out, s) in data.iter_mut().zip(scratch.iter()) {
                    *out = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                }
            },
            on_error,
            None,
        ),
        SampleFormat::U16 => device.build_output_stream(
            &stream_config,
            move |data: &mut [u16], _| {
                render_scratch(&slot, &mut scratch, data.len());
                for (out, s) in data.iter_mut().zip(scratch.iter()) {
                    *out = ((s.clamp(-1.0, 1.0) + 1.0) * 0.5 * u16::MAX as f32) as u16;
                }
            },
            on_error,
            None,
        ),
        other => {
            error!(?other, "unsupported sample format");
            return Err(Error::FormatNotSupported);
        }
    };

    stream.map_err(|e| {
        error!(%e, "failed to build output stream");
        Error::FailedToOpenBackendDevice
    })
}

fn render_scratch(slot: &RenderSlot, scratch: &mut Vec<f32>, len: usize) {
    if scratch.len() < len {
        scratch.resize(len, 0.0);
    }
    slot.render(&mut scratch[..len]);
}
