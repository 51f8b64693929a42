//! Layout- and kind-converting copy between two descriptors.
//!
//! The flow mirrors every primitive in the crate: check the rank, ask
//! whether a kernel exists, build the primitive, submit it to a
//! [`Context`], then `wait` on the returned [`Handle`].
//!
//! # Example
//!
//! ```rust
//! use memlayout::{
//!     query_reorder_support, Compensation, Context, LayoutTag, Memory, MemoryDesc,
//!     NumericKind, ReorderPrimitive,
//! };
//!
//! let ctx = Context::sequential();
//! let src_md = MemoryDesc::new(&[2, 2, 2, 2], NumericKind::F32, LayoutTag::abcd);
//! let dst_md = MemoryDesc::new(&[2, 2, 2, 2], NumericKind::S8, LayoutTag::abcd)
//!     .with_compensation(Compensation::channel());
//! assert!(query_reorder_support(&ctx, &src_md, &dst_md));
//!
//! let values: Vec<f32> = (0..16).map(|i| i as f32 * 20.0 - 150.0).collect();
//! let src = Memory::try_from_values(src_md.clone(), &values).unwrap();
//! let dst = Memory::try_new(dst_md.clone()).unwrap();
//! let reorder = ReorderPrimitive::new(&ctx, &src_md, &dst_md).unwrap();
//! let dst = reorder.execute(&ctx, src, dst).wait().unwrap();
//! assert_eq!(dst.get(&[0, 0, 0, 0]), -128.0);
//! assert_eq!(dst.compensation().unwrap(), &[-640.0, 640.0]);
//! ```

use core::fmt;

use tracing::debug;

use crate::context::{Context, Handle};
use crate::desc::{for_each_index, MemoryDesc};
use crate::error::{Error, Result};
use crate::memory::Memory;
use crate::scalars::NumericKind;

/// A (source, destination) descriptor pair of equal rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorderProblem {
    src: MemoryDesc,
    dst: MemoryDesc,
}

impl ReorderProblem {
    /// Pairs two descriptors, rejecting a rank mismatch up front.
    pub fn new(src: MemoryDesc, dst: MemoryDesc) -> Result<Self> {
        if src.ndims() != dst.ndims() {
            return Err(Error::RankMismatch {
                src: src.ndims(),
                dst: dst.ndims(),
            });
        }
        Ok(Self { src, dst })
    }

    pub fn src(&self) -> &MemoryDesc {
        &self.src
    }

    pub fn dst(&self) -> &MemoryDesc {
        &self.dst
    }

    /// Returns `true` if a kernel exists for this pair in `ctx`.
    pub fn is_supported(&self, ctx: &Context) -> bool {
        match unsupported_reason(ctx, &self.src, &self.dst) {
            None => true,
            Some(reason) => {
                debug!(problem = %self, reason, "reorder unsupported");
                false
            }
        }
    }
}

impl fmt::Display for ReorderProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// Why no kernel exists for `src -> dst`, or `None` if one does.
fn unsupported_reason(ctx: &Context, src: &MemoryDesc, dst: &MemoryDesc) -> Option<&'static str> {
    if src.ndims() != dst.ndims() {
        return Some("rank mismatch");
    }
    if src.dims() != dst.dims() {
        return Some("logical dims differ");
    }
    if !ctx.supports(src.kind()) || !ctx.supports(dst.kind()) {
        return Some("numeric kind not available in this context");
    }
    if !src.compensation().is_none() {
        return Some("source descriptors cannot carry compensation");
    }
    let compensation = dst.compensation();
    if !compensation.is_none() {
        if dst.kind() != NumericKind::S8 {
            return Some("compensation requires an s8 destination");
        }
        if !compensation.is_valid_for(dst.ndims()) {
            return Some("compensation axes do not fit the destination rank");
        }
    }
    None
}

/// Pure existence query: is there a kernel converting `src` into `dst`?
///
/// Never fails; `false` is an ordinary answer the caller branches on.
pub fn query_reorder_support(ctx: &Context, src: &MemoryDesc, dst: &MemoryDesc) -> bool {
    unsupported_reason(ctx, src, dst).is_none()
}

/// A reorder whose support has been established.
#[derive(Debug, Clone)]
pub struct ReorderPrimitive {
    problem: ReorderProblem,
}

impl ReorderPrimitive {
    /// Creates the primitive, or [`Error::UnsupportedConversion`] when no
    /// kernel exists.
    pub fn new(ctx: &Context, src: &MemoryDesc, dst: &MemoryDesc) -> Result<Self> {
        let problem = ReorderProblem::new(src.clone(), dst.clone())?;
        if !problem.is_supported(ctx) {
            return Err(Error::UnsupportedConversion {
                src: src.to_string(),
                dst: dst.to_string(),
            });
        }
        Ok(Self { problem })
    }

    pub fn problem(&self) -> &ReorderProblem {
        &self.problem
    }

    /// Submits the reorder. The filled destination comes back from `wait`.
    pub fn execute(&self, ctx: &Context, src: Memory, mut dst: Memory) -> Handle<Memory> {
        let problem = self.problem.clone();
        ctx.submit(self.problem.to_string(), move || {
            src.expect_desc(problem.src()).map_err(|err| fault(&problem, err))?;
            dst.expect_desc(problem.dst()).map_err(|err| fault(&problem, err))?;
            reorder_ref(&src, &mut dst)?;
            Ok(dst)
        })
    }
}

fn fault(problem: &ReorderProblem, err: Error) -> Error {
    Error::ExecutionFault {
        problem: problem.to_string(),
        reason: err.to_string(),
    }
}

/// Builds the primitive for the buffers' descriptors and submits it.
pub fn execute_reorder(ctx: &Context, src: Memory, dst: Memory) -> Result<Handle<Memory>> {
    let primitive = ReorderPrimitive::new(ctx, src.desc(), dst.desc())?;
    Ok(primitive.execute(ctx, src, dst))
}

/// Reference reorder: load, convert, store for every logical index, then
/// write the compensation sums requested by the destination.
///
/// Compensation sums are accumulated in `f64` in row-major index order.
pub fn reorder_ref(src: &Memory, dst: &mut Memory) -> Result<()> {
    if src.desc().ndims() != dst.desc().ndims() {
        return Err(Error::RankMismatch {
            src: src.desc().ndims(),
            dst: dst.desc().ndims(),
        });
    }
    if src.desc().dims() != dst.desc().dims() {
        return Err(Error::BufferMismatch {
            expected: src.desc().to_string(),
            got: dst.desc().to_string(),
        });
    }

    let dims = dst.desc().dims().to_vec();
    let compensation = dst.desc().compensation();
    let mut sums = vec![0f64; compensation.group_count(&dims)];

    for_each_index(&dims, |idx| {
        let value = src.get(idx);
        dst.set(idx, value);
        if !compensation.is_none() {
            sums[compensation.group_index(&dims, idx)] += value;
        }
    });

    if let Some(slots) = dst.compensation_mut() {
        for (slot, sum) in slots.iter_mut().zip(&sums) {
            *slot = *sum as f32;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::Compensation;
    use crate::numerics::{cap, convert};
    use crate::tag::LayoutTag;

    fn md(dims: &[usize], kind: NumericKind, tag: LayoutTag) -> MemoryDesc {
        MemoryDesc::new(dims, kind, tag)
    }

    #[test]
    fn rank_mismatch_is_rejected_before_query() {
        let err = ReorderProblem::new(
            md(&[2, 2], NumericKind::F32, LayoutTag::ab),
            md(&[2, 2, 2], NumericKind::F32, LayoutTag::abc),
        )
        .unwrap_err();
        assert_eq!(err, Error::RankMismatch { src: 2, dst: 3 });
    }

    #[test]
    fn support_rules() {
        let ctx = Context::sequential().with_capabilities(cap::SERIAL);
        let f32_plain = md(&[2, 2, 2], NumericKind::F32, LayoutTag::abc);
        let s8_blocked = md(&[2, 2, 2], NumericKind::S8, LayoutTag::aBc16b);

        assert!(query_reorder_support(&ctx, &f32_plain, &s8_blocked));
        assert!(query_reorder_support(
            &ctx,
            &f32_plain,
            &s8_blocked.clone().with_compensation(Compensation::channel_and_group())
        ));

        let f32_with_comp = f32_plain.clone().with_compensation(Compensation::channel());
        assert!(!query_reorder_support(&ctx, &s8_blocked, &f32_with_comp));

        let bf16 = md(&[2, 2, 2], NumericKind::BF16, LayoutTag::abc);
        assert!(!query_reorder_support(&ctx, &f32_plain, &bf16));
        let bf16_ctx = ctx.with_capabilities(cap::BF16);
        assert!(query_reorder_support(&bf16_ctx, &f32_plain, &bf16));

        let other_dims = md(&[2, 3, 2], NumericKind::F32, LayoutTag::abc);
        assert!(!query_reorder_support(&ctx, &f32_plain, &other_dims));
        let other_rank = md(&[2, 2], NumericKind::F32, LayoutTag::ab);
        assert!(!query_reorder_support(&ctx, &f32_plain, &other_rank));
    }

    #[test]
    fn unsupported_primitive_is_a_typed_error() {
        let ctx = Context::sequential();
        let src = md(&[2, 2], NumericKind::F32, LayoutTag::ab);
        let dst = md(&[2, 2], NumericKind::U8, LayoutTag::ba)
            .with_compensation(Compensation::channel());
        let err = ReorderPrimitive::new(&ctx, &src, &dst).unwrap_err();
        assert!(matches!(err, Error::UnsupportedConversion { .. }));
    }

    #[test]
    fn transposing_reorder() {
        let ctx = Context::sequential();
        let src_md = md(&[2, 3], NumericKind::F32, LayoutTag::ab);
        let dst_md = md(&[2, 3], NumericKind::F32, LayoutTag::ba);
        let src = Memory::try_from_values(src_md, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        let dst = Memory::try_new(dst_md).unwrap();
        let dst = execute_reorder(&ctx, src, dst).unwrap().wait().unwrap();

        let physical: Vec<f32> = dst
            .as_bytes()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(physical, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn blocked_destination_keeps_padding_zero() {
        let ctx = Context::sequential();
        let src_md = md(&[1, 3, 1, 1], NumericKind::F32, LayoutTag::abcd);
        let dst_md = md(&[1, 3, 1, 1], NumericKind::F32, LayoutTag::aBcd8b);
        let src = Memory::try_from_values(src_md, &[1.0, 2.0, 3.0]).unwrap();
        let dst = execute_reorder(&ctx, src, Memory::try_new(dst_md).unwrap())
            .unwrap()
            .wait()
            .unwrap();
        let physical: Vec<f32> = dst
            .as_bytes()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(physical, vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn narrowing_conversion_matches_scalar_reference() {
        let ctx = Context::sequential().with_capabilities(cap::ALL);
        let values: Vec<f32> = (0..24).map(|i| (i as f32 - 11.5) * 13.3).collect();
        for kind in NumericKind::ALL {
            let src_md = md(&[2, 3, 4], NumericKind::F32, LayoutTag::abc);
            let dst_md = md(&[2, 3, 4], kind, LayoutTag::acb);
            let src = Memory::try_from_values(src_md, &values).unwrap();
            let dst = execute_reorder(&ctx, src, Memory::try_new(dst_md).unwrap())
                .unwrap()
                .wait()
                .unwrap();
            let expected: Vec<f64> = values.iter().map(|&v| convert(v as f64, kind)).collect();
            assert_eq!(dst.to_vec(), expected, "{kind}");
        }
    }

    #[test]
    fn group_compensation_partitions_by_group() {
        let ctx = Context::sequential();
        let dims = [2, 2, 3];
        let values: Vec<f32> = (0..12).map(|i| i as f32 - 4.0).collect();
        let src = Memory::try_from_values(md(&dims, NumericKind::F32, LayoutTag::abc), &values)
            .unwrap();
        let dst_md = md(&dims, NumericKind::S8, LayoutTag::acb)
            .with_compensation(Compensation::channel_and_group());
        let dst = execute_reorder(&ctx, src, Memory::try_new(dst_md).unwrap())
            .unwrap()
            .wait()
            .unwrap();
        // (group, channel) slices hold three consecutive values starting at -4, -1, 2, 5
        assert_eq!(dst.compensation().unwrap(), &[-9.0, 0.0, 9.0, 18.0]);
    }

    #[test]
    fn mismatched_buffer_faults_at_wait() {
        let ctx = Context::sequential();
        let src_md = md(&[2, 2], NumericKind::F32, LayoutTag::ab);
        let dst_md = md(&[2, 2], NumericKind::F32, LayoutTag::ba);
        let primitive = ReorderPrimitive::new(&ctx, &src_md, &dst_md).unwrap();
        let wrong_dst = Memory::try_new(md(&[2, 2], NumericKind::S8, LayoutTag::ba)).unwrap();
        let src = Memory::try_new(src_md).unwrap();
        let err = primitive.execute(&ctx, src, wrong_dst).wait().unwrap_err();
        assert!(matches!(err, Error::ExecutionFault { .. }));
    }
}
