//! Backends: whatever invokes the render slot at the device cadence.
//!
//! A backend owns a thread (or a device callback) that repeatedly calls
//! [`RenderSlot::render`]. The engine starts and stops it; it never renders
//! through a backend that is stopped.

mod null;
#[cfg(feature = "cpal_sink")]
mod cpal_output;

pub use null::NullBackend;
#[cfg(feature = "cpal_sink")]
pub use cpal_output::CpalBackend;

pub use crate::graph::RenderSlot;

use crate::error::Result;

pub trait Backend: Send {
    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Native sample rate of the device.
    fn sample_rate(&self) -> u32;

    /// Native channel count of the device.
    fn channels(&self) -> usize;

    /// Begin calling `slot` at the device cadence.
    fn start(&mut self, slot: RenderSlot) -> Result<()>;

    /// Stop calling the slot. Once this returns no render is in flight.
    fn stop(&mut self) -> Result<()>;
}
