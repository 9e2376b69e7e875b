//! Element types a memory block can hold.
//!
//! Buffers are stored as raw bytes on every replica; the element type decides
//! how many bytes one logical element occupies and how typed views are cast.
//! The set is closed: every kernel and every node agrees on these four.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Runtime tag for the element type of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    /// 32-bit float, the default for activations and weights.
    F32,
    /// 64-bit float.
    F64,
    /// 32-bit signed integer (indices, labels).
    I32,
    /// 32-bit unsigned integer (bit masks, counters).
    U32,
}

impl ElementType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            ElementType::F32 | ElementType::I32 | ElementType::U32 => 4,
            ElementType::F64 => 8,
        }
    }

    /// Short lowercase name, as used in kernel signatures.
    pub const fn name(self) -> &'static str {
        match self {
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
            ElementType::I32 => "i32",
            ElementType::U32 => "u32",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A plain-old-data element type that can live in a memory block.
pub trait Element:
    bytemuck::Pod + Default + PartialEq + fmt::Debug + Send + Sync + 'static
{
    /// The runtime tag matching this type.
    const TYPE: ElementType;

    /// Widen to `f64` for inspection and observers.
    fn to_f64(self) -> f64;

    /// Narrow from `f64`, saturating for integer types.
    fn from_f64(value: f64) -> Self;
}

impl Element for f32 {
    const TYPE: ElementType = ElementType::F32;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl Element for f64 {
    const TYPE: ElementType = ElementType::F64;

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Self {
        value
    }
}

impl Element for i32 {
    const TYPE: ElementType = ElementType::I32;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as i32
    }
}

impl Element for u32 {
    const TYPE: ElementType = ElementType::U32;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as u32
    }
}

/// Decode one element of `element_type` from little-endian bytes and widen it.
///
/// Returns `None` when `bytes` is shorter than one element.
pub fn decode_f64(element_type: ElementType, bytes: &[u8]) -> Option<f64> {
    let raw = bytes.get(..element_type.size())?;
    let value = match element_type {
        ElementType::F32 => f32::from_le_bytes(raw.try_into().ok()?) as f64,
        ElementType::F64 => f64::from_le_bytes(raw.try_into().ok()?),
        ElementType::I32 => i32::from_le_bytes(raw.try_into().ok()?) as f64,
        ElementType::U32 => u32::from_le_bytes(raw.try_into().ok()?) as f64,
    };
    Some(value)
}
