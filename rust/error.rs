//! Error type shared by every module of the crate.

use core::fmt;

use thiserror::Error;

use crate::scalars::NumericKind;
use crate::tag::{LayoutTag, MAX_RANK};

/// Logical shape carried by error payloads.
///
/// Holds up to [`MAX_RANK`] extents inline and always remembers the full
/// rank, so a rejected over-rank shape still reports how many axes it had.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeDescriptor {
    extents: [usize; MAX_RANK],
    rank: usize,
}

impl ShapeDescriptor {
    pub fn new(dims: &[usize]) -> Self {
        let mut extents = [0usize; MAX_RANK];
        for (slot, &d) in extents.iter_mut().zip(dims) {
            *slot = d;
        }
        Self {
            extents,
            rank: dims.len(),
        }
    }

    /// Number of axes of the described shape.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The stored extents, at most [`MAX_RANK`] of them.
    pub fn extents(&self) -> &[usize] {
        &self.extents[..self.rank.min(MAX_RANK)]
    }
}

impl From<&[usize]> for ShapeDescriptor {
    fn from(dims: &[usize]) -> Self {
        Self::new(dims)
    }
}

impl fmt::Display for ShapeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some((first, rest)) = self.extents().split_first() else {
            return f.write_str("<empty>");
        };
        write!(f, "{first}")?;
        rest.iter().try_for_each(|d| write!(f, "x{d}"))?;
        if self.rank > MAX_RANK {
            write!(f, "x... (rank {})", self.rank)?;
        }
        Ok(())
    }
}

/// Errors produced by descriptor construction and the reorder/sum primitives.
///
/// `UnrealizableLayout`, `RankMismatch` and `UnsupportedConversion` are
/// expected outcomes that callers branch on. `ExecutionFault` and
/// `ScaleCountMismatch` abort the run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The (dims, kind, tag) triple has no physical layout at this rank.
    #[error("unrealizable layout {kind}:{tag} for dims {dims}: {reason}")]
    UnrealizableLayout {
        dims: ShapeDescriptor,
        kind: NumericKind,
        tag: LayoutTag,
        reason: &'static str,
    },

    /// Reorder endpoints differ in rank.
    #[error("rank mismatch: source has {src} dimensions, destination has {dst}")]
    RankMismatch { src: usize, dst: usize },

    /// No kernel exists for the requested conversion.
    #[error("unsupported conversion: {src} -> {dst}")]
    UnsupportedConversion { src: String, dst: String },

    /// A supported combination failed while executing.
    #[error("execution fault in `{problem}`: {reason}")]
    ExecutionFault { problem: String, reason: String },

    /// Sum scale list is neither one value nor one per input.
    #[error("scale count mismatch: {scales} scales for {n_inputs} inputs")]
    ScaleCountMismatch { n_inputs: usize, scales: usize },

    /// Problem definition is inconsistent in some other way.
    #[error("invalid problem: {0}")]
    InvalidProblem(String),

    /// A buffer does not match the descriptor it is used with.
    #[error("buffer mismatch: expected {expected}, got {got}")]
    BufferMismatch { expected: String, got: String },

    /// A catalog entry does not realize at any tested rank.
    #[error("coverage gap: {kind}:{tag} is not realizable at ranks 1..={max_rank}")]
    CoverageGap {
        kind: NumericKind,
        tag: LayoutTag,
        max_rank: usize,
    },

    /// Configuration could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}
