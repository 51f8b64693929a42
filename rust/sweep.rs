//! Layout coverage sweep.
//!
//! Every (kind, tag) pair of the catalog is realized at the ranks it
//! supports, then reorders are driven end-to-end between every admissible
//! source and destination under each compensation configuration. A
//! supported combination must execute without fault.
//!
//! Planning and execution are separate: [`SweepPlan::trials`] is a lazy,
//! restartable sequence of [`Trial`]s, and [`run_trial`] executes one of
//! them independently of the others.
//!
//! # Example
//!
//! ```rust
//! use memlayout::{run_sweep, Context, NumericKind, SweepConfig};
//!
//! let cfg = SweepConfig {
//!     max_rank: 2,
//!     kinds: vec![NumericKind::F32, NumericKind::S8],
//!     ..SweepConfig::default()
//! };
//! let err = run_sweep(&Context::sequential(), &cfg).unwrap_err();
//! assert!(err.to_string().starts_with("coverage gap"));
//! ```

use core::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, trace, warn};

use crate::context::Context;
use crate::desc::{for_each_index, Compensation, MemoryDesc};
use crate::error::{Error, Result};
use crate::memory::Memory;
use crate::numerics::convert;
use crate::reorder::{ReorderPrimitive, ReorderProblem};
use crate::scalars::NumericKind;
use crate::tag::{LayoutTag, MAX_RANK};

// region: Probing

/// Candidate logical dims for `rank`: two elements along every axis.
pub fn candidate_dims(rank: usize) -> Vec<usize> {
    vec![2; rank]
}

/// Candidate dims for ranks `1..=max_rank`, lowest rank first.
pub fn candidate_dims_sequence(max_rank: usize) -> impl Iterator<Item = Vec<usize>> {
    (1..=max_rank.min(MAX_RANK)).map(candidate_dims)
}

/// Every descriptor realizing `(kind, tag)` over the candidate dims.
pub fn realizations(
    kind: NumericKind,
    tag: LayoutTag,
    max_rank: usize,
) -> impl Iterator<Item = MemoryDesc> {
    candidate_dims_sequence(max_rank)
        .filter_map(move |dims| MemoryDesc::try_new(&dims, kind, tag).ok())
}

/// The first candidate descriptor that realizes `(kind, tag)`.
pub fn probe(kind: NumericKind, tag: LayoutTag, max_rank: usize) -> Option<MemoryDesc> {
    realizations(kind, tag, max_rank).next()
}

// endregion: Probing

// region: Configuration

/// Knobs of a coverage sweep, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Highest rank probed, at most [`MAX_RANK`].
    pub max_rank: usize,
    /// Kinds crossed with the catalog. Narrow floats the context cannot
    /// run are skipped.
    pub kinds: Vec<NumericKind>,
    /// Exercise plain source descriptors only.
    pub plain_sources_only: bool,
    /// Compensations requested on each destination.
    pub compensations: Vec<Compensation>,
    /// Compare every executed trial against the scalar conversion.
    pub verify: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            max_rank: MAX_RANK,
            kinds: NumericKind::ALL.to_vec(),
            plain_sources_only: true,
            compensations: Compensation::CONFIGURATIONS.to_vec(),
            verify: true,
        }
    }
}

impl SweepConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// endregion: Configuration

// region: SweepPlan

/// One (source, destination, compensation) combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trial {
    pub src: MemoryDesc,
    pub dst: MemoryDesc,
    pub compensation: Compensation,
}

impl fmt::Display for Trial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} [{}]", self.src, self.dst, self.compensation)
    }
}

/// The realized descriptors of a sweep and the order trials are visited in.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    sources: Vec<MemoryDesc>,
    destinations: Vec<MemoryDesc>,
    compensations: Vec<Compensation>,
    skipped_kinds: Vec<NumericKind>,
}

impl SweepPlan {
    /// Realizes every (kind, tag) pair the context can run.
    ///
    /// Fails with [`Error::CoverageGap`] for the first catalog entry that
    /// realizes at none of the ranks `1..=max_rank`.
    pub fn new(ctx: &Context, cfg: &SweepConfig) -> Result<Self> {
        if cfg.max_rank == 0 || cfg.max_rank > MAX_RANK {
            return Err(Error::Config(format!(
                "max_rank {} outside 1..={MAX_RANK}",
                cfg.max_rank
            )));
        }

        let mut skipped_kinds = Vec::new();
        let mut destinations = Vec::new();
        for &kind in &cfg.kinds {
            if !kind.is_defined() {
                return Err(Error::Config(format!(
                    "sweep kind `{kind}` is not a numeric kind"
                )));
            }
            if !ctx.supports(kind) {
                warn!(%kind, "skipping kind without hardware support");
                skipped_kinds.push(kind);
                continue;
            }
            for &tag in LayoutTag::CATALOG {
                let before = destinations.len();
                destinations.extend(realizations(kind, tag, cfg.max_rank));
                if destinations.len() == before {
                    return Err(Error::CoverageGap {
                        kind,
                        tag,
                        max_rank: cfg.max_rank,
                    });
                }
            }
        }

        let sources = destinations
            .iter()
            .filter(|md| !cfg.plain_sources_only || md.is_plain())
            .cloned()
            .collect();

        Ok(Self {
            sources,
            destinations,
            compensations: cfg.compensations.clone(),
            skipped_kinds,
        })
    }

    pub fn sources(&self) -> &[MemoryDesc] {
        &self.sources
    }

    pub fn destinations(&self) -> &[MemoryDesc] {
        &self.destinations
    }

    pub fn skipped_kinds(&self) -> &[NumericKind] {
        &self.skipped_kinds
    }

    /// Total number of trials.
    pub fn len(&self) -> usize {
        self.sources.len() * self.destinations.len() * self.compensations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `index`-th trial in sweep order: sources outermost, then
    /// destinations, then compensations.
    pub fn trial(&self, index: usize) -> Option<Trial> {
        if index >= self.len() {
            return None;
        }
        let n_comp = self.compensations.len();
        let n_dst = self.destinations.len();
        let compensation = self.compensations[index % n_comp];
        let dst = &self.destinations[(index / n_comp) % n_dst];
        let src = &self.sources[index / (n_comp * n_dst)];
        Some(Trial {
            src: src.clone(),
            dst: dst.clone(),
            compensation,
        })
    }

    /// Lazily walks every trial. Each call starts over from the first one.
    pub fn trials(&self) -> Trials<'_> {
        Trials {
            plan: self,
            front: 0,
            back: self.len(),
        }
    }
}

/// Iterator over the trials of a [`SweepPlan`].
#[derive(Debug, Clone)]
pub struct Trials<'a> {
    plan: &'a SweepPlan,
    front: usize,
    back: usize,
}

impl Iterator for Trials<'_> {
    type Item = Trial;

    fn next(&mut self) -> Option<Trial> {
        if self.front >= self.back {
            return None;
        }
        let trial = self.plan.trial(self.front);
        self.front += 1;
        trial
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }
}

impl DoubleEndedIterator for Trials<'_> {
    fn next_back(&mut self) -> Option<Trial> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        self.plan.trial(self.back)
    }
}

impl ExactSizeIterator for Trials<'_> {}

// endregion: SweepPlan

// region: Execution

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrialOutcome {
    /// Source and destination realize at different ranks.
    RankMismatch,
    /// No kernel exists; an ordinary, skipped outcome.
    Unsupported,
    /// The reorder ran to completion.
    Executed,
}

fn source_value(position: usize) -> f64 {
    ((position % 13) as f64 - 6.0) * 0.5
}

/// Runs one trial end-to-end.
///
/// A supported trial that fails to execute, or whose result disagrees with
/// the scalar conversion when `verify` is set, is an
/// [`Error::ExecutionFault`] naming the trial.
pub fn run_trial(ctx: &Context, trial: &Trial, verify: bool) -> Result<TrialOutcome> {
    let dst_md = trial.dst.clone().with_compensation(trial.compensation);
    let problem = match ReorderProblem::new(trial.src.clone(), dst_md) {
        Ok(problem) => problem,
        Err(Error::RankMismatch { .. }) => return Ok(TrialOutcome::RankMismatch),
        Err(err) => return Err(err),
    };
    if !problem.is_supported(ctx) {
        trace!(%trial, "unsupported");
        return Ok(TrialOutcome::Unsupported);
    }

    let fault = |reason: String| Error::ExecutionFault {
        problem: trial.to_string(),
        reason,
    };
    let result = (|| {
        let primitive = ReorderPrimitive::new(ctx, problem.src(), problem.dst())?;
        let mut src = Memory::try_new(problem.src().clone())?;
        let mut position = 0usize;
        src.fill_with(|_| {
            let value = source_value(position);
            position += 1;
            value
        });
        let dst = Memory::try_new(problem.dst().clone())?;
        let dst = primitive.execute(ctx, src.clone(), dst).wait()?;
        Ok::<_, Error>((src, dst))
    })();
    let (src, dst) = result.map_err(|err| match err {
        err @ Error::ExecutionFault { .. } => err,
        other => fault(other.to_string()),
    })?;

    if verify {
        verify_reorder(&src, &dst).map_err(fault)?;
    }
    trace!(%trial, "executed");
    Ok(TrialOutcome::Executed)
}

/// Checks values, padding and compensation of a finished reorder.
fn verify_reorder(src: &Memory, dst: &Memory) -> core::result::Result<(), String> {
    let desc = dst.desc();
    let dims = desc.dims();
    let kind = desc.kind();
    let compensation = desc.compensation();
    let mut sums = vec![0f64; compensation.group_count(dims)];
    let mut logical = vec![false; desc.padded_nelems()];
    let mut mismatch = None;

    for_each_index(dims, |idx| {
        let value = src.get(idx);
        let expected = convert(value, kind);
        let got = dst.get(idx);
        if mismatch.is_none() && got != expected {
            mismatch = Some(format!("at {idx:?}: expected {expected}, got {got}"));
        }
        logical[desc.offset(idx)] = true;
        if !compensation.is_none() {
            sums[compensation.group_index(dims, idx)] += value;
        }
    });
    if let Some(mismatch) = mismatch {
        return Err(mismatch);
    }

    let size = kind.size();
    let bytes = dst.as_bytes();
    let dirty = (0..logical.len()).find(|&offset| {
        !logical[offset] && bytes[offset * size..(offset + 1) * size].iter().any(|&b| b != 0)
    });
    if let Some(offset) = dirty {
        return Err(format!("padding element {offset} is not zero"));
    }

    let expected: Vec<f32> = sums.iter().map(|&sum| sum as f32).collect();
    match dst.compensation() {
        None if expected.is_empty() => Ok(()),
        Some(stored) if stored == expected.as_slice() => Ok(()),
        stored => Err(format!("compensation: expected {expected:?}, got {stored:?}")),
    }
}

/// Aggregated outcome counts of [`run_sweep`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub trials: usize,
    pub executed: usize,
    pub unsupported: usize,
    pub rank_mismatch: usize,
    pub skipped_kinds: Vec<NumericKind>,
}

impl SweepReport {
    fn record(mut self, outcome: TrialOutcome) -> Self {
        self.trials += 1;
        match outcome {
            TrialOutcome::RankMismatch => self.rank_mismatch += 1,
            TrialOutcome::Unsupported => self.unsupported += 1,
            TrialOutcome::Executed => self.executed += 1,
        }
        self
    }

    fn merge(mut self, other: Self) -> Self {
        self.trials += other.trials;
        self.executed += other.executed;
        self.unsupported += other.unsupported;
        self.rank_mismatch += other.rank_mismatch;
        self
    }
}

/// Plans and runs a full sweep.
///
/// Trials run in parallel on the rayon pool. Each one executes
/// synchronously on its worker with the capabilities of `ctx`. The first
/// failing trial aborts the sweep.
pub fn run_sweep(ctx: &Context, cfg: &SweepConfig) -> Result<SweepReport> {
    let plan = SweepPlan::new(ctx, cfg)?;
    info!(
        sources = plan.sources().len(),
        destinations = plan.destinations().len(),
        trials = plan.len(),
        "sweep planned"
    );

    let worker = Context::sequential().with_capabilities(ctx.capabilities());
    let mut report = (0..plan.len())
        .into_par_iter()
        .filter_map(|index| plan.trial(index))
        .map(|trial| run_trial(&worker, &trial, cfg.verify))
        .try_fold(SweepReport::default, |report, outcome| {
            Ok::<_, Error>(report.record(outcome?))
        })
        .try_reduce(SweepReport::default, |a, b| Ok(a.merge(b)))?;
    report.skipped_kinds = plan.skipped_kinds().to_vec();

    info!(
        executed = report.executed,
        unsupported = report.unsupported,
        rank_mismatch = report.rank_mismatch,
        skipped = ?report.skipped_kinds,
        "sweep finished"
    );
    Ok(report)
}

// endregion: Execution
