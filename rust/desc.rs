//! Tensor memory descriptors.
//!
//! This module provides:
//!
//! - [`MemoryDesc`]: dims, numeric kind, layout tag and the physical mapping
//!   derived from them
//! - [`BlockingDesc`]: outer strides plus inner blocks of a descriptor
//! - [`Compensation`]: which logical axes a stored compensation sum spans
//! - [`build`]: descriptor construction with recoverable or fatal failure
//!
//! # Example
//!
//! ```rust
//! use memlayout::{LayoutTag, MemoryDesc, NumericKind};
//!
//! let md = MemoryDesc::try_new(&[2, 3, 4, 4], NumericKind::F32, LayoutTag::aBcd8b).unwrap();
//! assert_eq!(md.padded_dims(), &[2, 8, 4, 4]);
//! assert_eq!(md.blocking().strides, vec![8 * 4 * 4, 128, 32, 8]);
//!
//! // A rank-4 tag never realizes at rank 3.
//! assert!(MemoryDesc::try_new(&[2, 3, 4], NumericKind::F32, LayoutTag::aBcd8b).is_err());
//! ```

use core::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result, ShapeDescriptor};
use crate::scalars::NumericKind;
use crate::tag::{LayoutTag, MAX_RANK};

// region: Compensation

/// Logical axes participating in a stored compensation sum.
///
/// Serialized as `{ "kind": "Channel", "channel_axis": 0 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Compensation {
    #[default]
    None,
    /// One sum per output channel.
    Channel { channel_axis: usize },
    /// One sum per (group, output channel) pair.
    ChannelAndGroup {
        group_axis: usize,
        channel_axis: usize,
    },
}

impl Compensation {
    /// The three configurations exercised by the compatibility sweep.
    pub const CONFIGURATIONS: [Compensation; 3] = [
        Compensation::None,
        Compensation::channel(),
        Compensation::channel_and_group(),
    ];

    /// Output channel on axis 0, as laid out by plain weights.
    pub const fn channel() -> Self {
        Compensation::Channel { channel_axis: 0 }
    }

    /// Group on axis 0 and output channel on axis 1, as laid out by grouped
    /// weights.
    pub const fn channel_and_group() -> Self {
        Compensation::ChannelAndGroup {
            group_axis: 0,
            channel_axis: 1,
        }
    }

    pub const fn is_none(&self) -> bool {
        matches!(self, Compensation::None)
    }

    /// Bit `i` is set when logical axis `i` selects a compensation slice.
    pub const fn mask(&self) -> u32 {
        match *self {
            Compensation::None => 0,
            Compensation::Channel { channel_axis } => 1 << channel_axis,
            Compensation::ChannelAndGroup {
                group_axis,
                channel_axis,
            } => (1 << group_axis) | (1 << channel_axis),
        }
    }

    /// Smallest rank that leaves at least one reduced axis.
    pub const fn min_rank(&self) -> usize {
        match self {
            Compensation::None => 1,
            Compensation::Channel { .. } => 2,
            Compensation::ChannelAndGroup { .. } => 3,
        }
    }

    /// Returns `true` if the axes exist and are distinct at `rank`.
    pub fn is_valid_for(&self, rank: usize) -> bool {
        if rank < self.min_rank() {
            return false;
        }
        match *self {
            Compensation::None => true,
            Compensation::Channel { channel_axis } => channel_axis < rank,
            Compensation::ChannelAndGroup {
                group_axis,
                channel_axis,
            } => group_axis < rank && channel_axis < rank && group_axis != channel_axis,
        }
    }

    /// Number of stored sums for a tensor with logical `dims`.
    pub fn group_count(&self, dims: &[usize]) -> usize {
        match *self {
            Compensation::None => 0,
            Compensation::Channel { channel_axis } => dims[channel_axis],
            Compensation::ChannelAndGroup {
                group_axis,
                channel_axis,
            } => dims[group_axis] * dims[channel_axis],
        }
    }

    /// Slot of the sum that logical index `idx` contributes to.
    #[inline]
    pub fn group_index(&self, dims: &[usize], idx: &[usize]) -> usize {
        match *self {
            Compensation::None => 0,
            Compensation::Channel { channel_axis } => idx[channel_axis],
            Compensation::ChannelAndGroup {
                group_axis,
                channel_axis,
            } => idx[group_axis] * dims[channel_axis] + idx[channel_axis],
        }
    }
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compensation::None => write!(f, "none"),
            Compensation::Channel { .. } => write!(f, "channel(mask={})", self.mask()),
            Compensation::ChannelAndGroup { .. } => {
                write!(f, "channel+group(mask={})", self.mask())
            }
        }
    }
}

// endregion: Compensation

// region: MemoryDesc

/// Physical arrangement of a descriptor, in elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockingDesc {
    /// Stride of one outer step along each logical axis.
    pub strides: Vec<usize>,
    /// `(axis, size)` inner blocks, outermost first. Empty for plain layouts.
    pub inner_blocks: Vec<(usize, usize)>,
    /// Stride of each inner block, parallel to `inner_blocks`.
    pub inner_strides: Vec<usize>,
}

/// A tensor memory descriptor: logical shape, element kind and the
/// deterministic physical mapping selected by a [`LayoutTag`].
///
/// Descriptors are immutable once built, except that a [`Compensation`] may
/// be attached with [`MemoryDesc::with_compensation`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryDesc {
    dims: Vec<usize>,
    padded_dims: Vec<usize>,
    /// Product of inner block sizes per axis.
    block_extents: Vec<usize>,
    kind: NumericKind,
    tag: LayoutTag,
    blocking: BlockingDesc,
    compensation: Compensation,
}

impl MemoryDesc {
    /// Builds a descriptor, reporting unrealizable combinations as
    /// [`Error::UnrealizableLayout`].
    pub fn try_new(dims: &[usize], kind: NumericKind, tag: LayoutTag) -> Result<Self> {
        let reject = |reason: &'static str| {
            debug!(dims = ?dims, %kind, %tag, reason, "descriptor rejected");
            Error::UnrealizableLayout {
                dims: ShapeDescriptor::new(dims),
                kind,
                tag,
                reason,
            }
        };

        if dims.is_empty() || dims.len() > MAX_RANK {
            return Err(reject("rank must be between 1 and 6"));
        }
        if dims.iter().any(|&d| d == 0) {
            return Err(reject("zero-sized dimension"));
        }
        if !kind.is_defined() {
            return Err(reject("numeric kind is undefined"));
        }
        if tag.is_selector() {
            return Err(reject("selector tags have no physical layout"));
        }
        let layout = tag
            .layout(dims.len())
            .ok_or_else(|| reject("tag does not realize at this rank"))?;

        let rank = dims.len();
        let mut block_extents = vec![1usize; rank];
        for &(axis, size) in &layout.blocks {
            block_extents[axis] *= size;
        }
        let padded_dims = dims
            .iter()
            .zip(&block_extents)
            .map(|(&d, &b)| d.checked_next_multiple_of(b))
            .collect::<Option<Vec<usize>>>()
            .ok_or_else(|| reject("layout size overflows"))?;

        let mut inner_strides = vec![0usize; layout.blocks.len()];
        let mut inner_size = 1usize;
        for (k, &(_, size)) in layout.blocks.iter().enumerate().rev() {
            inner_strides[k] = inner_size;
            inner_size *= size;
        }

        let mut strides = vec![0usize; rank];
        let mut stride = inner_size;
        for &axis in layout.order.iter().rev() {
            strides[axis] = stride;
            stride = stride
                .checked_mul(padded_dims[axis] / block_extents[axis])
                .ok_or_else(|| reject("layout size overflows"))?;
        }
        // `stride` now spans the whole padded buffer.
        if stride.checked_mul(kind.size()).is_none() {
            return Err(reject("layout size overflows"));
        }

        Ok(Self {
            dims: dims.to_vec(),
            padded_dims,
            block_extents,
            kind,
            tag,
            blocking: BlockingDesc {
                strides,
                inner_blocks: layout.blocks,
                inner_strides,
            },
            compensation: Compensation::None,
        })
    }

    /// Convenience constructor that panics when the layout is unrealizable.
    pub fn new(dims: &[usize], kind: NumericKind, tag: LayoutTag) -> Self {
        match Self::try_new(dims, kind, tag) {
            Ok(md) => md,
            Err(err) => panic!("MemoryDesc::new failed: {err}"),
        }
    }

    /// Returns the descriptor with `compensation` attached.
    pub fn with_compensation(mut self, compensation: Compensation) -> Self {
        self.compensation = compensation;
        self
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    /// Logical dims rounded up to whole blocks.
    pub fn padded_dims(&self) -> &[usize] {
        &self.padded_dims
    }

    pub fn kind(&self) -> NumericKind {
        self.kind
    }

    pub fn tag(&self) -> LayoutTag {
        self.tag
    }

    pub fn blocking(&self) -> &BlockingDesc {
        &self.blocking
    }

    pub fn compensation(&self) -> Compensation {
        self.compensation
    }

    /// Returns `true` if the layout has no inner blocks.
    pub fn is_plain(&self) -> bool {
        self.blocking.inner_blocks.is_empty()
    }

    /// Number of logical elements.
    pub fn nelems(&self) -> usize {
        self.dims.iter().product()
    }

    /// Number of physical elements, padding included.
    pub fn padded_nelems(&self) -> usize {
        self.padded_dims.iter().product()
    }

    /// Size of the data buffer in bytes.
    pub fn size_bytes(&self) -> usize {
        self.padded_nelems() * self.kind.size()
    }

    /// Physical element offset of the logical index `idx`.
    #[inline]
    pub fn offset(&self, idx: &[usize]) -> usize {
        debug_assert_eq!(idx.len(), self.dims.len());
        let mut offset = 0usize;
        let mut within = [0usize; MAX_RANK];
        for (axis, &i) in idx.iter().enumerate() {
            let extent = self.block_extents[axis];
            offset += (i / extent) * self.blocking.strides[axis];
            within[axis] = i % extent;
        }
        let blocks = &self.blocking.inner_blocks;
        for k in (0..blocks.len()).rev() {
            let (axis, size) = blocks[k];
            offset += (within[axis] % size) * self.blocking.inner_strides[k];
            within[axis] /= size;
        }
        offset
    }

    /// Physical byte offset of the logical index `idx`.
    #[inline]
    pub fn byte_offset(&self, idx: &[usize]) -> usize {
        self.offset(idx) * self.kind.size()
    }
}

impl fmt::Display for MemoryDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.kind,
            self.tag,
            ShapeDescriptor::new(&self.dims)
        )?;
        if !self.compensation.is_none() {
            write!(f, ":{}", self.compensation)?;
        }
        Ok(())
    }
}

/// Builds a descriptor for `(dims, kind, tag)`.
///
/// With `allow_failure` an unrealizable combination is returned as
/// [`Error::UnrealizableLayout`] for the caller to inspect. Without it the
/// failure is fatal and this function panics.
pub fn build(
    dims: &[usize],
    kind: NumericKind,
    tag: LayoutTag,
    allow_failure: bool,
) -> Result<MemoryDesc> {
    if allow_failure {
        MemoryDesc::try_new(dims, kind, tag)
    } else {
        Ok(MemoryDesc::new(dims, kind, tag))
    }
}

// endregion: MemoryDesc

// region: Logical Indices

/// Calls `f` for every logical index of `dims` in row-major order.
///
/// The visiting order is fixed, which keeps every reduction built on top of
/// it reproducible.
pub fn for_each_index(dims: &[usize], mut f: impl FnMut(&[usize])) {
    if dims.is_empty() || dims.iter().any(|&d| d == 0) {
        return;
    }
    let mut idx = vec![0usize; dims.len()];
    loop {
        f(&idx);
        let mut axis = dims.len();
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            idx[axis] += 1;
            if idx[axis] < dims[axis] {
                break;
            }
            idx[axis] = 0;
        }
    }
}

// endregion: Logical Indices

#[cfg(test)]
mod tests {
    use super::*;

    fn offsets(md: &MemoryDesc) -> Vec<usize> {
        let mut out = Vec::new();
        for_each_index(md.dims(), |idx| out.push(md.offset(idx)));
        out
    }

    #[test]
    fn plain_row_major_offsets() {
        let md = MemoryDesc::new(&[2, 3, 4], NumericKind::F32, LayoutTag::abc);
        assert!(md.is_plain());
        assert_eq!(md.blocking().strides, vec![12, 4, 1]);
        assert_eq!(offsets(&md), (0..24).collect::<Vec<_>>());
    }

    #[test]
    fn abx_matches_fixed_plain_tag() {
        let generic = MemoryDesc::new(&[2, 3, 4, 5], NumericKind::S8, LayoutTag::abx);
        let fixed = MemoryDesc::new(&[2, 3, 4, 5], NumericKind::S8, LayoutTag::abcd);
        assert_eq!(generic.blocking(), fixed.blocking());
    }

    #[test]
    fn channels_last_offsets() {
        let md = MemoryDesc::new(&[1, 3, 2, 2], NumericKind::F32, LayoutTag::acdb);
        assert_eq!(md.blocking().strides, vec![12, 1, 6, 3]);
        assert_eq!(md.offset(&[0, 2, 1, 1]), 2 + 6 + 3);
    }

    #[test]
    fn blocked_channel_padding() {
        let md = MemoryDesc::new(&[2, 3, 2, 2], NumericKind::F32, LayoutTag::aBcd8b);
        assert_eq!(md.padded_dims(), &[2, 8, 2, 2]);
        assert_eq!(md.padded_nelems(), 64);
        assert_eq!(md.size_bytes(), 256);
        // (n, c, h, w) -> n*32 + (c/8)*32 + h*16 + w*8 + c%8
        assert_eq!(md.offset(&[1, 2, 1, 0]), 32 + 16 + 2);
    }

    #[test]
    fn double_blocked_axis_offsets() {
        let md = MemoryDesc::new(&[16, 16, 1, 1], NumericKind::S8, LayoutTag::ABcd4b16a4b);
        assert_eq!(md.blocking().inner_strides, vec![64, 4, 1]);
        // b = 6 splits into outer 1 (stride 64) and inner 2 (stride 1).
        assert_eq!(md.offset(&[3, 6, 0, 0]), 64 + 3 * 4 + 2);
        let mut seen = offsets(&md);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 256);
    }

    #[test]
    fn offsets_are_injective_for_every_catalog_entry() {
        for &tag in LayoutTag::CATALOG {
            for rank in 1..=MAX_RANK {
                let dims = vec![3usize; rank];
                if let Ok(md) = MemoryDesc::try_new(&dims, NumericKind::U8, tag) {
                    let mut seen = offsets(&md);
                    assert!(seen.iter().all(|&o| o < md.padded_nelems()), "{md}");
                    seen.sort_unstable();
                    seen.dedup();
                    assert_eq!(seen.len(), md.nelems(), "{md}");
                }
            }
        }
    }

    #[test]
    fn construction_is_deterministic() {
        let a = MemoryDesc::new(&[2, 2, 2, 2, 2], NumericKind::BF16, LayoutTag::aBCde4c16b4c);
        let b = MemoryDesc::new(&[2, 2, 2, 2, 2], NumericKind::BF16, LayoutTag::aBCde4c16b4c);
        assert_eq!(a, b);
    }

    #[test]
    fn rejections() {
        let cases: [(&[usize], NumericKind, LayoutTag); 6] = [
            (&[], NumericKind::F32, LayoutTag::abx),
            (&[1, 1, 1, 1, 1, 1, 1], NumericKind::F32, LayoutTag::abx),
            (&[2, 0], NumericKind::F32, LayoutTag::ab),
            (&[2, 2], NumericKind::Undefined, LayoutTag::ab),
            (&[2, 2], NumericKind::F32, LayoutTag::any),
            (&[2, 2], NumericKind::F32, LayoutTag::abc),
        ];
        for (dims, kind, tag) in cases {
            let err = MemoryDesc::try_new(dims, kind, tag).unwrap_err();
            assert!(matches!(err, Error::UnrealizableLayout { .. }), "{err}");
        }

        // Element count, padding, then byte size overflow in turn.
        let half = usize::BITS / 2;
        let oversized: [(&[usize], LayoutTag); 3] = [
            (&[1 << (half + 8), 1 << (half + 8)], LayoutTag::ab),
            (&[usize::MAX - 3, 2], LayoutTag::AB16b16a),
            (&[1 << (half - 1), 1 << (half - 1)], LayoutTag::ba),
        ];
        for (dims, tag) in oversized {
            match build(dims, NumericKind::F32, tag, true) {
                Err(Error::UnrealizableLayout { reason, .. }) => {
                    assert_eq!(reason, "layout size overflows")
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn build_with_allowed_failure_returns_error() {
        let result = build(&[2, 2], NumericKind::F32, LayoutTag::aBcd16b, true);
        assert!(result.is_err());
        let md = build(&[2, 2], NumericKind::F32, LayoutTag::ba, false).unwrap();
        assert_eq!(md.blocking().strides, vec![1, 2]);
    }

    #[test]
    #[should_panic(expected = "MemoryDesc::new failed")]
    fn build_without_allowed_failure_panics() {
        let _ = build(&[2, 2], NumericKind::F32, LayoutTag::aBcd16b, false);
    }

    #[test]
    fn compensation_geometry() {
        let dims = [3, 4, 2];
        let comp = Compensation::channel_and_group();
        assert_eq!(comp.mask(), 0b11);
        assert_eq!(comp.group_count(&dims), 12);
        assert_eq!(comp.group_index(&dims, &[2, 1, 0]), 9);
        assert!(comp.is_valid_for(3));
        assert!(!comp.is_valid_for(2));
        assert!(!Compensation::channel().is_valid_for(1));
        assert!(!Compensation::ChannelAndGroup {
            group_axis: 1,
            channel_axis: 1
        }
        .is_valid_for(4));
    }

    #[test]
    fn compensation_serde_shape() {
        let json = serde_json::to_string(&Compensation::channel()).unwrap();
        assert_eq!(json, r#"{"kind":"Channel","channel_axis":0}"#);
        let none: Compensation = serde_json::from_str(r#"{"kind":"None"}"#).unwrap();
        assert_eq!(none, Compensation::None);
    }

    #[test]
    fn display_includes_compensation() {
        let md = MemoryDesc::new(&[2, 2], NumericKind::S8, LayoutTag::ab)
            .with_compensation(Compensation::channel());
        assert_eq!(md.to_string(), "s8:ab:2x2:channel(mask=1)");
    }

    #[test]
    fn index_order_is_row_major() {
        let mut seen = Vec::new();
        for_each_index(&[2, 2], |idx| seen.push(idx.to_vec()));
        assert_eq!(seen, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);
    }
}
