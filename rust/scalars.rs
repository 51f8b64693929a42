//! Element representations carried by memory descriptors.
//!
//! This module provides:
//!
//! - [`NumericKind`]: the bit-width/representation of a tensor element
//! - element loads into the wide `f64` accumulator
//! - element stores with round-to-nearest-even for narrowing floats and
//!   saturation for integer kinds
//!
//! All multi-byte kinds are stored little-endian. Half-precision kinds keep
//! their raw IEEE 754 binary16 / bfloat16 bit patterns, converted with the
//! `half` crate.

use core::fmt;
use core::str::FromStr;

use half::{bf16, f16};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;
use crate::numerics::round_saturate;

// region: NumericKind

/// Numeric representation of a tensor element.
///
/// # Examples
///
/// ```
/// use memlayout::NumericKind;
///
/// assert_eq!(NumericKind::BF16.size(), 2);
/// assert!(NumericKind::S8.is_integer());
/// assert_eq!("u8".parse::<NumericKind>().unwrap(), NumericKind::U8);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum NumericKind {
    /// Unset. Never realizable.
    #[default]
    Undefined,
    F16,
    BF16,
    F32,
    S32,
    S8,
    U8,
}

impl NumericKind {
    /// Every realizable kind, in catalog order.
    pub const ALL: [NumericKind; 6] = [
        NumericKind::F16,
        NumericKind::BF16,
        NumericKind::F32,
        NumericKind::S32,
        NumericKind::S8,
        NumericKind::U8,
    ];

    /// Size of one element in bytes. Zero for [`NumericKind::Undefined`].
    pub const fn size(self) -> usize {
        match self {
            NumericKind::Undefined => 0,
            NumericKind::F16 | NumericKind::BF16 => 2,
            NumericKind::F32 | NumericKind::S32 => 4,
            NumericKind::S8 | NumericKind::U8 => 1,
        }
    }

    pub const fn is_defined(self) -> bool {
        !matches!(self, NumericKind::Undefined)
    }

    pub const fn is_integer(self) -> bool {
        matches!(self, NumericKind::S32 | NumericKind::S8 | NumericKind::U8)
    }

    /// Half-width floating kinds that need hardware support to execute.
    pub const fn is_narrow_float(self) -> bool {
        matches!(self, NumericKind::F16 | NumericKind::BF16)
    }

    /// Closed value range of an integer kind.
    pub fn bounds(self) -> Option<(f64, f64)> {
        match self {
            NumericKind::S32 => Some((i32::MIN as f64, i32::MAX as f64)),
            NumericKind::S8 => Some((i8::MIN as f64, i8::MAX as f64)),
            NumericKind::U8 => Some((u8::MIN as f64, u8::MAX as f64)),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            NumericKind::Undefined => "undef",
            NumericKind::F16 => "f16",
            NumericKind::BF16 => "bf16",
            NumericKind::F32 => "f32",
            NumericKind::S32 => "s32",
            NumericKind::S8 => "s8",
            NumericKind::U8 => "u8",
        }
    }

    /// Reads one element from the front of `bytes` into the accumulator type.
    ///
    /// `bytes` must hold at least [`NumericKind::size`] bytes.
    #[inline]
    pub fn load(self, bytes: &[u8]) -> f64 {
        match self {
            NumericKind::Undefined => 0.0,
            NumericKind::F16 => {
                f16::from_bits(u16::from_le_bytes([bytes[0], bytes[1]])).to_f64()
            }
            NumericKind::BF16 => {
                bf16::from_bits(u16::from_le_bytes([bytes[0], bytes[1]])).to_f64()
            }
            NumericKind::F32 => {
                f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
            }
            NumericKind::S32 => {
                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
            }
            NumericKind::S8 => bytes[0] as i8 as f64,
            NumericKind::U8 => bytes[0] as f64,
        }
    }

    /// Writes `value` to the front of `bytes`, converting it to this kind.
    ///
    /// Floating kinds round to nearest-even. Integer kinds saturate to their
    /// range, round to nearest-even and map NaN to zero.
    #[inline]
    pub fn store(self, bytes: &mut [u8], value: f64) {
        match self {
            NumericKind::Undefined => {}
            NumericKind::F16 => {
                bytes[..2].copy_from_slice(&f16::from_f64(value).to_bits().to_le_bytes())
            }
            NumericKind::BF16 => {
                bytes[..2].copy_from_slice(&bf16::from_f64(value).to_bits().to_le_bytes())
            }
            NumericKind::F32 => bytes[..4].copy_from_slice(&(value as f32).to_le_bytes()),
            NumericKind::S32 => {
                let v = round_saturate(value, i32::MIN as f64, i32::MAX as f64) as i32;
                bytes[..4].copy_from_slice(&v.to_le_bytes());
            }
            NumericKind::S8 => {
                bytes[0] = (round_saturate(value, i8::MIN as f64, i8::MAX as f64) as i8) as u8;
            }
            NumericKind::U8 => {
                bytes[0] = round_saturate(value, u8::MIN as f64, u8::MAX as f64) as u8;
            }
        }
    }
}

impl fmt::Display for NumericKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NumericKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "undef" => Ok(NumericKind::Undefined),
            "f16" => Ok(NumericKind::F16),
            "bf16" => Ok(NumericKind::BF16),
            "f32" => Ok(NumericKind::F32),
            "s32" => Ok(NumericKind::S32),
            "s8" => Ok(NumericKind::S8),
            "u8" => Ok(NumericKind::U8),
            other => Err(Error::Config(format!("unknown numeric kind `{other}`"))),
        }
    }
}

impl Serialize for NumericKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for NumericKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// endregion: NumericKind
