//! Value conversion rules and hardware capability detection.
//!
//! This module provides:
//!
//! - [`round_saturate`]: clamp-then-round used by every integer store
//! - [`convert`]: the value a number becomes after a store in a given kind
//! - [`capabilities`]: runtime detection of narrow-float support
//! - [`cap`]: capability bit masks

use crate::scalars::NumericKind;

// region: Conversion

/// Clamps `value` to `[lo, hi]` and rounds to nearest, ties to even.
///
/// NaN maps to zero. `lo` and `hi` must be integral.
#[inline(always)]
pub fn round_saturate(value: f64, lo: f64, hi: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(lo, hi).round_ties_even()
}

/// Returns `value` as it reads back after being stored as `kind`.
///
/// This is the scalar reference every reorder and sum output is defined by.
///
/// # Example
/// ```
/// use memlayout::{convert, NumericKind};
///
/// assert_eq!(convert(200.7, NumericKind::S8), 127.0);
/// assert_eq!(convert(-0.6, NumericKind::U8), 0.0);
/// assert_eq!(convert(1.5, NumericKind::F32), 1.5);
/// ```
#[inline]
pub fn convert(value: f64, kind: NumericKind) -> f64 {
    let mut scratch = [0u8; 4];
    kind.store(&mut scratch, value);
    kind.load(&scratch)
}

// endregion: Conversion

// region: Capabilities

/// Hardware capability detection functions.
pub mod capabilities {
    use super::cap;
    use crate::scalars::NumericKind;

    /// Returns the bitmask of capabilities available on this machine.
    /// Use with `cap::*` constants to check for specific features.
    ///
    /// # Example
    /// ```
    /// use memlayout::{cap, capabilities};
    ///
    /// let caps = capabilities::available();
    /// assert!(caps & cap::SERIAL != 0);
    /// if caps & cap::BF16 != 0 {
    ///     println!("bf16 kernels are available");
    /// }
    /// ```
    pub fn available() -> u64 {
        let mut caps = cap::SERIAL;

        #[cfg(target_arch = "x86_64")]
        {
            if std::arch::is_x86_feature_detected!("avx512f") {
                caps |= cap::BF16;
            }
        }

        #[cfg(target_arch = "aarch64")]
        {
            if std::arch::is_aarch64_feature_detected!("fp16") {
                caps |= cap::F16;
            }
            if std::arch::is_aarch64_feature_detected!("bf16") {
                caps |= cap::BF16;
            }
        }

        caps
    }

    /// Returns `true` if `caps` allows executing kernels on `kind`.
    pub fn supports(caps: u64, kind: NumericKind) -> bool {
        match kind {
            NumericKind::Undefined => false,
            NumericKind::F16 => caps & cap::F16 != 0,
            NumericKind::BF16 => caps & cap::BF16 != 0,
            _ => true,
        }
    }
}

/// Capability bit masks.
pub mod cap {
    pub const SERIAL: u64 = 1 << 0; // Always: portable reference path
    pub const F16: u64 = 1 << 1; // binary16 arithmetic
    pub const BF16: u64 = 1 << 2; // bfloat16 arithmetic
    pub const ALL: u64 = SERIAL | F16 | BF16;
}

// endregion: Capabilities
