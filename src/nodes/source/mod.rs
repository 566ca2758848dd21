mod resampler;
mod sound;

pub(crate) use sound::{SoundNode, SourceSlot};
