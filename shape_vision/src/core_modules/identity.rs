// THEORY:
// The `identity` module answers one question: "which object is this?" It turns a
// single-frame `Detection` into an `ObjectKey` that stays the same for the same
// physical object across frames.
//
// Key architectural principles:
// 1.  **Deterministic Keys**: the default strategy packs the sampled color into
//     24 bits (`r << 16 | g << 8 | b`). The packing is lossless, so a key can
//     always be turned back into the color used to draw its trajectory.
// 2.  **Pluggable Strategy**: the `IdentityStrategy` trait is the seam where a
//     stronger tracker (position matching, motion models) can replace the color
//     heuristic without touching detection or rendering.
// 3.  **Known Limitation**: two different objects with the same (quantized) color
//     collapse into one key. This is accepted, not detected. The assigner only
//     counts same-frame collisions so they show up in logs.

use crate::core_modules::detection::{Color, Detection};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exclusive upper bound of the key space: keys are 24-bit.
pub const KEY_SPACE: u32 = 1 << 24;

/// A persistent object identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(u32);

impl ObjectKey {
    /// Packs a color as `r << 16 | g << 8 | b`.
    pub fn from_color(color: Color) -> Self {
        Self(((color.r as u32) << 16) | ((color.g as u32) << 8) | color.b as u32)
    }

    /// Returns `None` outside `[0, 2^24)`.
    pub fn from_value(value: u32) -> Option<Self> {
        (value < KEY_SPACE).then_some(Self(value))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// The inverse of [`ObjectKey::from_color`].
    pub fn color(self) -> Color {
        Color::new(
            ((self.0 >> 16) & 0xFF) as u8,
            ((self.0 >> 8) & 0xFF) as u8,
            (self.0 & 0xFF) as u8,
        )
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derives the identity of a detection.
pub trait IdentityStrategy: Send + Sync {
    fn derive_key(&self, detection: &Detection) -> ObjectKey;
}

/// Color-as-identity. With fewer than 8 bits per channel, each channel is
/// snapped to the middle of its bucket, so small sampling noise maps to the
/// same key and the key still unpacks to a representative color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorKey {
    pub bits_per_channel: u8,
}

impl Default for ColorKey {
    fn default() -> Self {
        Self { bits_per_channel: 8 }
    }
}

impl ColorKey {
    pub fn exact() -> Self {
        Self::default()
    }

    pub fn quantized(bits_per_channel: u8) -> Self {
        Self { bits_per_channel }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(1..=8).contains(&self.bits_per_channel) {
            return Err(format!(
                "bits_per_channel must be within 1..=8, got {}",
                self.bits_per_channel
            ));
        }
        Ok(())
    }

    fn quantize(&self, channel: u8) -> u8 {
        if self.bits_per_channel >= 8 {
            return channel;
        }
        let shift = 8 - self.bits_per_channel.max(1) as u32;
        let bucket = (channel as u32) >> shift;
        ((bucket << shift) | (1 << (shift - 1))) as u8
    }
}

impl IdentityStrategy for ColorKey {
    fn derive_key(&self, detection: &Detection) -> ObjectKey {
        let c = detection.color;
        ObjectKey::from_color(Color::new(self.quantize(c.r), self.quantize(c.g), self.quantize(c.b)))
    }
}
