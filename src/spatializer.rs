//! Distance attenuation, cones, doppler and panning.
//!
//! Everything in here is plain math over `Copy` inputs so the render thread
//! can evaluate it once per block without touching shared state.

use core::f32::consts::FRAC_PI_2;

use crate::listener::ListenerSet;
use crate::math::{Cone, Vec3, DEFAULT_DIRECTION};

/// Speed of sound in world units per second, used for doppler.
pub const SPEED_OF_SOUND: f32 = 343.3;

/// Doppler never shifts pitch beyond this factor in either direction.
const MAX_DOPPLER_PITCH: f32 = 16.0;

/// Function mapping source-to-listener distance to a gain multiplier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AttenuationModel {
    None,
    #[default]
    Inverse,
    Linear,
    Exponential,
}

/// Whether a source's spatial attributes are in world space or already
/// relative to the listener.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Positioning {
    #[default]
    Absolute,
    Relative,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PanMode {
    /// Attenuate the opposite channel; never bleeds one channel into the other.
    #[default]
    Balance,
    /// Move signal from one channel into the other.
    Pan,
}

/// Curve used by [`PanMode::Pan`]. Fixed per engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PanLaw {
    #[default]
    Linear,
    ConstantPower,
}

/// The spatial attributes of a sound or group.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Emitter {
    pub position: Vec3,
    pub direction: Vec3,
    pub velocity: Vec3,
    pub positioning: Positioning,
    pub attenuation_model: AttenuationModel,
    pub rolloff: f32,
    pub min_gain: f32,
    pub max_gain: f32,
    pub min_distance: f32,
    pub max_distance: f32,
    pub cone: Cone,
    pub doppler_factor: f32,
    pub directional_attenuation_factor: f32,
}

impl Default for Emitter {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            direction: DEFAULT_DIRECTION,
            velocity: Vec3::ZERO,
            positioning: Positioning::Absolute,
            attenuation_model: AttenuationModel::Inverse,
            rolloff: 1.0,
            min_gain: 0.0,
            max_gain: 1.0,
            min_distance: 1.0,
            max_distance: f32::MAX,
            cone: Cone::default(),
            doppler_factor: 1.0,
            directional_attenuation_factor: 1.0,
        }
    }
}

impl Emitter {
    /// Gain from the attenuation model at `distance`.
    pub fn distance_gain(&self, distance: f32) -> f32 {
        attenuation_gain(
            self.attenuation_model,
            distance,
            self.min_distance,
            self.max_distance,
            self.rolloff,
            self.min_gain,
            self.max_gain,
        )
    }
}

/// Gain for `distance` under `model`.
///
/// The distance is clamped to `[min_distance, max_distance]` first and the
/// result is clamped to `[min_gain, max_gain]`, except for
/// [`AttenuationModel::None`] which is always 1.
pub fn attenuation_gain(
    model: AttenuationModel,
    distance: f32,
    min_distance: f32,
    max_distance: f32,
    rolloff: f32,
    min_gain: f32,
    max_gain: f32,
) -> f32 {
    let max_distance = max_distance.max(min_distance);
    let d = distance.clamp(min_distance, max_distance);

    let gain = match model {
        AttenuationModel::None => return 1.0,
        AttenuationModel::Inverse => {
            let denom = min_distance + rolloff * (d - min_distance);
            if denom > 0.0 {
                min_distance / denom
            } else {
                1.0
            }
        }
        AttenuationModel::Linear => {
            let range = max_distance - min_distance;
            if range > 0.0 {
                1.0 - rolloff * (d - min_distance) / range
            } else {
                1.0
            }
        }
        AttenuationModel::Exponential => {
            if min_distance > 0.0 {
                (d / min_distance).powf(-rolloff)
            } else {
                1.0
            }
        }
    };

    gain.clamp(min_gain, max_gain.max(min_gain))
}

/// Pitch multiplier from relative radial velocity.
///
/// `towards_listener` points from the source to the listener. A factor of 0
/// disables the effect.
pub fn doppler_pitch(
    factor: f32,
    towards_listener: Vec3,
    source_velocity: Vec3,
    listener_velocity: Vec3,
) -> f32 {
    if factor <= 0.0 {
        return 1.0;
    }
    let Some(axis) = towards_listener.try_normalize() else {
        return 1.0;
    };

    let limit = SPEED_OF_SOUND / factor;
    let vls = listener_velocity.dot(axis).min(limit);
    let vss = source_velocity.dot(axis).min(limit);

    let numer = (SPEED_OF_SOUND - factor * vls).max(0.0);
    let denom = (SPEED_OF_SOUND - factor * vss).max(SPEED_OF_SOUND / MAX_DOPPLER_PITCH);
    (numer / denom).clamp(1.0 / MAX_DOPPLER_PITCH, MAX_DOPPLER_PITCH)
}

/// Result of spatializing one emitter for one block.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Spatialization {
    /// Listener the emitter was evaluated against.
    pub listener_index: usize,
    /// Combined distance and directional gain.
    pub gain: f32,
    /// Stereo position in `[-1, 1]`, applied with the balance law.
    pub pan: f32,
    /// Doppler pitch multiplier.
    pub pitch: f32,
    /// Unit vector from the emitter to the listener, or zero.
    pub direction_to_listener: Vec3,
}

impl Spatialization {
    /// Pass-through result for non-spatialized nodes.
    pub const IDENTITY: Spatialization = Spatialization {
        listener_index: 0,
        gain: 1.0,
        pan: 0.0,
        pitch: 1.0,
        direction_to_listener: Vec3::ZERO,
    };
}

/// Evaluate `emitter` against the pinned listener, or the nearest enabled one.
///
/// A disabled listener silences the emitter.
pub fn spatialize(emitter: &Emitter, listeners: &ListenerSet, pinned: Option<usize>) -> Spatialization {
    let listener_index = listeners.resolve(pinned, emitter.position);
    let Some(listener) = listeners.get(listener_index) else {
        return Spatialization::IDENTITY;
    };

    // Work in a frame where `local` is the emitter seen from the listener.
    let (local, towards_listener, listener_axis, listener_to_source, listener_velocity) =
        match emitter.positioning {
            Positioning::Absolute => {
                let offset = emitter.position - listener.position;
                (
                    listener.to_local(offset),
                    -offset,
                    listener.direction,
                    offset,
                    listener.velocity,
                )
            }
            Positioning::Relative => (
                emitter.position,
                -emitter.position,
                DEFAULT_DIRECTION,
                emitter.position,
                Vec3::ZERO,
            ),
        };

    let distance = local.length();
    let mut gain = emitter.distance_gain(distance);

    let cone = emitter.cone.gain(emitter.direction, towards_listener)
        * listener.cone.gain(listener_axis, listener_to_source);
    gain *= 1.0 + (cone - 1.0) * emitter.directional_attenuation_factor;

    if !listener.enabled {
        gain = 0.0;
    }

    let pan = if distance > f32::EPSILON {
        (local.x / distance).clamp(-1.0, 1.0)
    } else {
        0.0
    };

    Spatialization {
        listener_index,
        gain: gain.max(0.0),
        pan,
        pitch: doppler_pitch(
            emitter.doppler_factor,
            towards_listener,
            emitter.velocity,
            listener_velocity,
        ),
        direction_to_listener: towards_listener.normalize_or_zero(),
    }
}

/// Apply `pan` to a stereo pair.
pub fn apply_pan(left: &mut [f32], right: &mut [f32], pan: f32, mode: PanMode, law: PanLaw) {
    let pan = pan.clamp(-1.0, 1.0);
    if pan == 0.0 {
        return;
    }

    match mode {
        PanMode::Balance => {
            if pan > 0.0 {
                left.iter_mut().for_each(|s| *s *= 1.0 - pan);
            } else {
                right.iter_mut().for_each(|s| *s *= 1.0 + pan);
            }
        }
        PanMode::Pan => {
            let amount = pan.abs();
            let (keep, moved) = match law {
                PanLaw::Linear => (1.0 - amount, amount),
                PanLaw::ConstantPower => {
                    ((amount * FRAC_PI_2).cos(), (amount * FRAC_PI_2).sin())
                }
            };
            let (from, to) = if pan > 0.0 {
                (left, right)
            } else {
                (right, left)
            };
            for (f, t) in from.iter_mut().zip(to.iter_mut()) {
                *t += *f * moved;
                *f *= keep;
            }
        }
    }
}

/// One-pole smoothing of a gain target, per sample.
#[derive(Clone, Copy, Debug)]
pub struct GainSmoother {
    current: f32,
    coeff: f32,
}

impl GainSmoother {
    /// `smooth_frames` is the time constant in frames; 0 disables smoothing.
    pub fn new(initial: f32, smooth_frames: u32) -> Self {
        let coeff = if smooth_frames == 0 {
            0.0
        } else {
            (-1.0 / smooth_frames as f32).exp()
        };
        Self {
            current: initial,
            coeff,
        }
    }

    /// Jump straight to `value`.
    pub fn reset(&mut self, value: f32) {
        self.current = value;
    }

    /// Advance one sample toward `target`.
    #[inline]
    pub fn next(&mut self, target: f32) -> f32 {
        self.current = target + self.coeff * (self.current - target);
        self.current
    }
}
