//! # memlayout - Tensor Memory Layouts, Reorders and Sums
//!
//! * Symbolic layout tags in the conventional letter notation: `abcd`, `acdb`, `aBcd16b`, `ABcd4b16a4b`.
//! * Descriptors for N-dimensional tensors of rank 1 to 6, plain or blocked, with padding.
//! * Handles f32, f16, bf16, s32, s8 and u8 elements with saturating, round-to-nearest-even stores.
//! * Quantization compensation sums for s8 weights, per channel or per (group, channel).
//! * Synchronous or rayon-backed execution, observed only through completion handles.
//!
//! ## Implemented primitives include:
//!
//! * Reorder: layout- and kind-converting copy between two descriptors of equal rank.
//! * Sum: scaled accumulation of N inputs into one destination.
//! * Coverage sweep: every catalog entry realized and driven through reorder end-to-end.
//!
//! Support is queried before a primitive is built. An unsupported combination
//! is an ordinary `false`, never an error, and callers are expected to skip it.
//!
//! # Example
//!
//! ```rust
//! use memlayout::{execute_reorder, Context, LayoutTag, Memory, MemoryDesc, NumericKind};
//!
//! let ctx = Context::sequential();
//! let src = MemoryDesc::new(&[2, 3], NumericKind::F32, LayoutTag::ab);
//! let dst = MemoryDesc::new(&[2, 3], NumericKind::F32, LayoutTag::ba);
//!
//! let src = Memory::try_from_values(src, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
//! let dst = Memory::try_new(dst).unwrap();
//! let dst = execute_reorder(&ctx, src, dst).unwrap().wait().unwrap();
//!
//! // Same logical values, column-major bytes.
//! assert_eq!(dst.to_vec(), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
//! ```
//!
//! # Capabilities
//!
//! Narrow floating-point kinds are only executed where the context reports
//! the matching [`cap`] bit. Contexts detect it at runtime; tests may force a
//! mask with [`Context::with_capabilities`].
#![allow(non_camel_case_types)]

mod context;
mod desc;
mod error;
mod memory;
mod numerics;
mod reorder;
mod scalars;
mod sum;
mod sweep;
mod tag;

pub use context::{Context, ContextKind, Handle};
pub use desc::{build, for_each_index, BlockingDesc, Compensation, MemoryDesc};
pub use error::{Error, Result, ShapeDescriptor};
pub use memory::Memory;
pub use numerics::{cap, capabilities, convert, round_saturate};
pub use reorder::{
    execute_reorder, query_reorder_support, reorder_ref, ReorderPrimitive, ReorderProblem,
};
pub use scalars::NumericKind;
pub use sum::{
    compute_ref, query_sum_support, run_sum_settings, SumPrimitive, SumProblem, SumReport,
    SumSettings,
};
pub use sweep::{
    candidate_dims, candidate_dims_sequence, probe, realizations, run_sweep, run_trial,
    SweepConfig, SweepPlan, SweepReport, Trial, TrialOutcome, Trials,
};
pub use tag::{LayoutTag, TagLayout, MAX_RANK};
