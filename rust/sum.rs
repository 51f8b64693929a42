//! Scaled multi-input accumulation.
//!
//! `dst[idx] = convert(Σ scale[i] · src_i[idx], dst_kind)` for every logical
//! index, accumulated in `f64` whatever the source and destination kinds.
//!
//! # Example
//!
//! ```rust
//! use memlayout::{compute_ref, LayoutTag, Memory, NumericKind, SumProblem};
//!
//! let prb = SumProblem::new(
//!     &[4],
//!     &[NumericKind::F32, NumericKind::F32],
//!     NumericKind::F32,
//!     &[LayoutTag::abx],
//!     LayoutTag::undef,
//!     &[0.25],
//! )
//! .unwrap();
//! let a = Memory::try_from_values(prb.src_desc(0).unwrap(), &[4.0, 8.0, 12.0, 16.0]).unwrap();
//! let b = Memory::try_from_values(prb.src_desc(1).unwrap(), &[4.0, 4.0, 4.0, 4.0]).unwrap();
//! let mut dst = Memory::try_new(prb.dst_desc().unwrap()).unwrap();
//! compute_ref(&prb, &[a, b], &mut dst).unwrap();
//! assert_eq!(dst.to_vec(), vec![2.0, 3.0, 4.0, 5.0]);
//! ```

use core::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::{Context, Handle};
use crate::desc::{for_each_index, MemoryDesc};
use crate::error::{Error, Result, ShapeDescriptor};
use crate::memory::Memory;
use crate::scalars::NumericKind;
use crate::tag::{LayoutTag, MAX_RANK};

// region: SumProblem

/// One fully resolved sum configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SumProblem {
    dims: Vec<usize>,
    src_kinds: Vec<NumericKind>,
    dst_kind: NumericKind,
    src_tags: Vec<LayoutTag>,
    dst_tag: LayoutTag,
    scales: Vec<f32>,
}

impl SumProblem {
    /// Resolves a sum configuration.
    ///
    /// A single scale or a single source tag is broadcast to every input;
    /// otherwise their counts must equal the number of inputs. A `dst_tag`
    /// of `undef` or `any` takes the layout of the first input.
    pub fn new(
        dims: &[usize],
        src_kinds: &[NumericKind],
        dst_kind: NumericKind,
        src_tags: &[LayoutTag],
        dst_tag: LayoutTag,
        scales: &[f32],
    ) -> Result<Self> {
        let n_inputs = src_kinds.len();
        if n_inputs == 0 {
            return Err(Error::InvalidProblem("sum needs at least one input".to_string()));
        }
        if dims.is_empty() || dims.len() > MAX_RANK {
            return Err(Error::InvalidProblem(format!(
                "sum dims {} must have rank 1..={MAX_RANK}",
                ShapeDescriptor::new(dims)
            )));
        }
        if scales.len() != 1 && scales.len() != n_inputs {
            return Err(Error::ScaleCountMismatch {
                n_inputs,
                scales: scales.len(),
            });
        }
        if src_tags.len() != 1 && src_tags.len() != n_inputs {
            return Err(Error::InvalidProblem(format!(
                "{} source tags for {n_inputs} inputs",
                src_tags.len()
            )));
        }

        let broadcast = |i: usize| if scales.len() == 1 { scales[0] } else { scales[i] };
        let tag_of = |i: usize| if src_tags.len() == 1 { src_tags[0] } else { src_tags[i] };

        Ok(Self {
            dims: dims.to_vec(),
            src_kinds: src_kinds.to_vec(),
            dst_kind,
            src_tags: (0..n_inputs).map(tag_of).collect(),
            dst_tag,
            scales: (0..n_inputs).map(broadcast).collect(),
        })
    }

    pub fn n_inputs(&self) -> usize {
        self.src_kinds.len()
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn src_kinds(&self) -> &[NumericKind] {
        &self.src_kinds
    }

    pub fn dst_kind(&self) -> NumericKind {
        self.dst_kind
    }

    /// One tag per input, after broadcast.
    pub fn src_tags(&self) -> &[LayoutTag] {
        &self.src_tags
    }

    /// The destination tag as configured, possibly a selector.
    pub fn dst_tag(&self) -> LayoutTag {
        self.dst_tag
    }

    /// The destination tag with selectors resolved to the first input's tag.
    pub fn resolved_dst_tag(&self) -> LayoutTag {
        if self.dst_tag.is_selector() {
            self.src_tags[0]
        } else {
            self.dst_tag
        }
    }

    /// One scale per input, after broadcast.
    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    /// Descriptor of input `i`.
    pub fn src_desc(&self, i: usize) -> Result<MemoryDesc> {
        let kind = *self.src_kinds.get(i).ok_or_else(|| {
            Error::InvalidProblem(format!("input {i} out of {}", self.n_inputs()))
        })?;
        MemoryDesc::try_new(&self.dims, kind, self.src_tags[i])
    }

    pub fn dst_desc(&self) -> Result<MemoryDesc> {
        MemoryDesc::try_new(&self.dims, self.dst_kind, self.resolved_dst_tag())
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(":")
}

impl fmt::Display for SumProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "--sdt={} --ddt={} --stag={} --dtag={} --scales={} {}",
            join(&self.src_kinds),
            self.dst_kind,
            join(&self.src_tags),
            self.dst_tag,
            join(&self.scales),
            ShapeDescriptor::new(&self.dims)
        )
    }
}

// endregion: SumProblem

// region: Reference

/// Reference sum over bound buffers.
pub fn compute_ref(prb: &SumProblem, srcs: &[Memory], dst: &mut Memory) -> Result<()> {
    if srcs.len() != prb.n_inputs() {
        return Err(Error::InvalidProblem(format!(
            "{} source buffers for {} inputs",
            srcs.len(),
            prb.n_inputs()
        )));
    }
    for memory in srcs.iter().chain(core::iter::once(&*dst)) {
        if memory.desc().dims() != prb.dims() {
            return Err(Error::BufferMismatch {
                expected: ShapeDescriptor::new(prb.dims()).to_string(),
                got: memory.desc().to_string(),
            });
        }
    }

    let scales: Vec<f64> = prb.scales().iter().map(|&s| s as f64).collect();
    for_each_index(prb.dims(), |idx| {
        let acc = srcs
            .iter()
            .zip(&scales)
            .fold(0f64, |acc, (src, &scale)| acc + scale * src.get(idx));
        dst.set(idx, acc);
    });
    Ok(())
}

// endregion: Reference

// region: SumPrimitive

fn unsupported_kind(ctx: &Context, prb: &SumProblem) -> Option<NumericKind> {
    prb.src_kinds()
        .iter()
        .copied()
        .chain(core::iter::once(prb.dst_kind()))
        .find(|&kind| !ctx.supports(kind))
}

/// Pure existence query for a sum kernel.
pub fn query_sum_support(ctx: &Context, prb: &SumProblem) -> bool {
    unsupported_kind(ctx, prb).is_none()
        && (0..prb.n_inputs()).all(|i| prb.src_desc(i).is_ok())
        && prb.dst_desc().is_ok()
}

/// A sum whose descriptors are realized and whose kinds are supported.
#[derive(Debug, Clone)]
pub struct SumPrimitive {
    problem: SumProblem,
    src_descs: Vec<MemoryDesc>,
    dst_desc: MemoryDesc,
}

impl SumPrimitive {
    pub fn new(ctx: &Context, prb: &SumProblem) -> Result<Self> {
        let src_descs = (0..prb.n_inputs())
            .map(|i| prb.src_desc(i))
            .collect::<Result<Vec<_>>>()?;
        let dst_desc = prb.dst_desc()?;
        if let Some(kind) = unsupported_kind(ctx, prb) {
            debug!(problem = %prb, %kind, "sum unsupported");
            return Err(Error::UnsupportedConversion {
                src: join(&src_descs),
                dst: dst_desc.to_string(),
            });
        }
        Ok(Self {
            problem: prb.clone(),
            src_descs,
            dst_desc,
        })
    }

    pub fn problem(&self) -> &SumProblem {
        &self.problem
    }

    pub fn src_descs(&self) -> &[MemoryDesc] {
        &self.src_descs
    }

    pub fn dst_desc(&self) -> &MemoryDesc {
        &self.dst_desc
    }

    /// Submits the sum. The filled destination comes back from `wait`.
    pub fn execute(&self, ctx: &Context, srcs: Vec<Memory>, mut dst: Memory) -> Handle<Memory> {
        let primitive = self.clone();
        ctx.submit(self.problem.to_string(), move || {
            let fault = |err: Error| Error::ExecutionFault {
                problem: primitive.problem.to_string(),
                reason: err.to_string(),
            };
            if srcs.len() != primitive.src_descs.len() {
                return Err(fault(Error::InvalidProblem(format!(
                    "{} source buffers for {} inputs",
                    srcs.len(),
                    primitive.src_descs.len()
                ))));
            }
            for (memory, desc) in srcs.iter().zip(&primitive.src_descs) {
                memory.expect_desc(desc).map_err(fault)?;
            }
            dst.expect_desc(&primitive.dst_desc).map_err(fault)?;
            compute_ref(&primitive.problem, &srcs, &mut dst)?;
            Ok(dst)
        })
    }
}

// endregion: SumPrimitive

// region: Settings

/// Cross product of sum configurations.
///
/// Every combination of `sdt × ddt × stag × dtag × scales` over `dims`
/// yields one [`SumProblem`]. Loaded from JSON with missing fields taking
/// the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SumSettings {
    /// Problem shape. Has no default; an empty shape is an invalid problem.
    pub dims: Vec<usize>,
    /// Source kind lists, one kind per input (default `[[f32, f32]]`).
    pub sdt: Vec<Vec<NumericKind>>,
    /// Destination kinds (default `[f32]`).
    pub ddt: Vec<NumericKind>,
    /// Source tag lists (default `[[abx]]`, broadcast to every input).
    pub stag: Vec<Vec<LayoutTag>>,
    /// Destination tags (default `[undef]`, the first input's layout).
    pub dtag: Vec<LayoutTag>,
    /// Scale lists (default `[[0.25], [1], [4]]`).
    pub scales: Vec<Vec<f32>>,
    /// Count unsupported problems as skipped instead of failing.
    pub allow_unimpl: bool,
}

impl Default for SumSettings {
    fn default() -> Self {
        Self {
            dims: Vec::new(),
            sdt: vec![vec![NumericKind::F32, NumericKind::F32]],
            ddt: vec![NumericKind::F32],
            stag: vec![vec![LayoutTag::abx]],
            dtag: vec![LayoutTag::undef],
            scales: vec![vec![0.25], vec![1.0], vec![4.0]],
            allow_unimpl: false,
        }
    }
}

/// Outcome counts of [`run_sum_settings`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SumReport {
    pub executed: usize,
    pub skipped: usize,
}

impl SumSettings {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Lazily resolves every combination, in nesting order
    /// `sdt → ddt → stag → dtag → scales`.
    pub fn problems(&self) -> impl Iterator<Item = Result<SumProblem>> + '_ {
        self.sdt.iter().flat_map(move |sdt| {
            self.ddt.iter().flat_map(move |&ddt| {
                self.stag.iter().flat_map(move |stag| {
                    self.dtag.iter().flat_map(move |&dtag| {
                        self.scales.iter().map(move |scales| {
                            SumProblem::new(&self.dims, sdt, ddt, stag, dtag, scales)
                        })
                    })
                })
            })
        })
    }
}

/// Builds and executes every problem of `settings`.
///
/// Inputs are filled with a deterministic pattern. Unsupported problems are
/// skipped when `allow_unimpl` is set and fail the run otherwise.
pub fn run_sum_settings(ctx: &Context, settings: &SumSettings) -> Result<SumReport> {
    let mut report = SumReport::default();
    for prb in settings.problems() {
        let prb = prb?;
        let primitive = match SumPrimitive::new(ctx, &prb) {
            Ok(primitive) => primitive,
            Err(err @ Error::UnsupportedConversion { .. }) if settings.allow_unimpl => {
                warn!(problem = %prb, %err, "skipping unimplemented sum");
                report.skipped += 1;
                continue;
            }
            Err(err) => return Err(err),
        };

        let mut srcs = Vec::with_capacity(prb.n_inputs());
        for (input, desc) in primitive.src_descs().iter().enumerate() {
            let mut memory = Memory::try_new(desc.clone())?;
            let mut position = 0usize;
            memory.fill_with(|_| {
                position += 1;
                ((position * 7 + input * 3) % 17) as f64 - 8.0
            });
            srcs.push(memory);
        }
        let dst = Memory::try_new(primitive.dst_desc().clone())?;
        primitive.execute(ctx, srcs, dst).wait()?;
        report.executed += 1;
    }
    info!(
        executed = report.executed,
        skipped = report.skipped,
        "sum settings finished"
    );
    Ok(report)
}

// endregion: Settings

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerics::cap;

    fn f32_problem(scales: &[f32]) -> Result<SumProblem> {
        SumProblem::new(
            &[4],
            &[NumericKind::F32, NumericKind::F32],
            NumericKind::F32,
            &[LayoutTag::abx],
            LayoutTag::undef,
            scales,
        )
    }

    #[test]
    fn scale_count_mismatch() {
        let err = f32_problem(&[1.0, 2.0, 3.0]).unwrap_err();
        assert_eq!(err, Error::ScaleCountMismatch { n_inputs: 2, scales: 3 });
        assert!(matches!(
            f32_problem(&[]).unwrap_err(),
            Error::ScaleCountMismatch { n_inputs: 2, scales: 0 }
        ));
    }

    #[test]
    fn scales_and_tags_broadcast() {
        let prb = f32_problem(&[0.25]).unwrap();
        assert_eq!(prb.scales(), &[0.25, 0.25]);
        assert_eq!(prb.src_tags(), &[LayoutTag::abx, LayoutTag::abx]);
        assert_eq!(prb.resolved_dst_tag(), LayoutTag::abx);
        assert_eq!(prb.n_inputs(), 2);
    }

    #[test]
    fn invalid_inputs() {
        assert!(matches!(
            SumProblem::new(&[4], &[], NumericKind::F32, &[LayoutTag::abx], LayoutTag::undef, &[1.0]),
            Err(Error::InvalidProblem(_))
        ));
        assert!(matches!(
            SumProblem::new(
                &[4],
                &[NumericKind::F32; 3],
                NumericKind::F32,
                &[LayoutTag::a, LayoutTag::a],
                LayoutTag::undef,
                &[1.0]
            ),
            Err(Error::InvalidProblem(_))
        ));
    }

    #[test]
    fn display_reproduces_configuration() {
        let prb = SumProblem::new(
            &[2, 3],
            &[NumericKind::S8, NumericKind::U8],
            NumericKind::F32,
            &[LayoutTag::ab, LayoutTag::ba],
            LayoutTag::any,
            &[0.5, 2.0],
        )
        .unwrap();
        assert_eq!(
            prb.to_string(),
            "--sdt=s8:u8 --ddt=f32 --stag=ab:ba --dtag=any --scales=0.5:2 2x3"
        );
    }

    #[test]
    fn integer_destination_saturates() {
        let prb = SumProblem::new(
            &[3],
            &[NumericKind::S8, NumericKind::S8],
            NumericKind::S8,
            &[LayoutTag::a],
            LayoutTag::a,
            &[4.0],
        )
        .unwrap();
        let a = Memory::try_from_values(prb.src_desc(0).unwrap(), &[100.0, -100.0, 1.0]).unwrap();
        let b = Memory::try_from_values(prb.src_desc(1).unwrap(), &[100.0, -100.0, 0.125]).unwrap();
        let mut dst = Memory::try_new(prb.dst_desc().unwrap()).unwrap();
        compute_ref(&prb, &[a, b], &mut dst).unwrap();
        // 0.125 stores as 0 in s8, so the last sum is 4 * 1 + 4 * 0.
        assert_eq!(dst.to_vec(), vec![127.0, -128.0, 4.0]);
    }

    #[test]
    fn mixed_layouts_accumulate_logically() {
        let prb = SumProblem::new(
            &[2, 3],
            &[NumericKind::F32, NumericKind::F32],
            NumericKind::F32,
            &[LayoutTag::ab, LayoutTag::ba],
            LayoutTag::ba,
            &[1.0, -1.0],
        )
        .unwrap();
        let values: Vec<f32> = (0..6).map(|i| i as f32).collect();
        let a = Memory::try_from_values(prb.src_desc(0).unwrap(), &values).unwrap();
        let b = Memory::try_from_values(prb.src_desc(1).unwrap(), &values).unwrap();
        let mut dst = Memory::try_new(prb.dst_desc().unwrap()).unwrap();
        compute_ref(&prb, &[a, b], &mut dst).unwrap();
        assert_eq!(dst.to_vec(), vec![0.0; 6]);
    }

    #[test]
    fn primitive_rejects_narrow_floats_without_capability() {
        let prb = SumProblem::new(
            &[4],
            &[NumericKind::BF16],
            NumericKind::F32,
            &[LayoutTag::a],
            LayoutTag::undef,
            &[1.0],
        )
        .unwrap();
        let serial = Context::sequential().with_capabilities(cap::SERIAL);
        assert!(!query_sum_support(&serial, &prb));
        assert!(matches!(
            SumPrimitive::new(&serial, &prb),
            Err(Error::UnsupportedConversion { .. })
        ));
        let full = Context::sequential().with_capabilities(cap::ALL);
        assert!(query_sum_support(&full, &prb));
    }

    #[test]
    fn primitive_reports_unrealizable_layouts() {
        let prb = SumProblem::new(
            &[4],
            &[NumericKind::F32],
            NumericKind::F32,
            &[LayoutTag::abcd],
            LayoutTag::undef,
            &[1.0],
        )
        .unwrap();
        let ctx = Context::sequential();
        assert!(!query_sum_support(&ctx, &prb));
        assert!(matches!(
            SumPrimitive::new(&ctx, &prb),
            Err(Error::UnrealizableLayout { .. })
        ));
    }

    #[test]
    fn default_settings_cross_product() {
        let settings = SumSettings {
            dims: vec![4, 4],
            ..SumSettings::default()
        };
        let problems: Vec<_> = settings.problems().collect::<Result<_>>().unwrap();
        assert_eq!(problems.len(), 3);
        assert_eq!(problems[0].scales(), &[0.25, 0.25]);
        assert_eq!(problems[2].scales(), &[4.0, 4.0]);
    }

    #[test]
    fn settings_from_json() {
        let settings = SumSettings::from_json(
            r#"{ "dims": [2, 8], "sdt": [["s8", "u8"]], "ddt": ["s8", "bf16"], "scales": [[1.0, 0.5]] }"#,
        )
        .unwrap();
        assert_eq!(settings.stag, vec![vec![LayoutTag::abx]]);
        assert_eq!(settings.problems().count(), 2);
        assert!(matches!(
            SumSettings::from_json(r#"{ "ddt": ["f64"] }"#),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn run_settings_honours_allow_unimpl() {
        let mut settings = SumSettings {
            dims: vec![3, 5],
            ddt: vec![NumericKind::F32, NumericKind::F16],
            ..SumSettings::default()
        };
        let serial = Context::parallel().with_capabilities(cap::SERIAL);

        assert!(matches!(
            run_sum_settings(&serial, &settings),
            Err(Error::UnsupportedConversion { .. })
        ));

        settings.allow_unimpl = true;
        let report = run_sum_settings(&serial, &settings).unwrap();
        assert_eq!(report, SumReport { executed: 3, skipped: 3 });
    }
}
