//! Compute contexts and completion handles.
//!
//! Work is submitted to a [`Context`] and observed only through the
//! [`Handle`] it returns. A sequential context runs the job before
//! `submit` returns; a parallel context hands it to the rayon pool, or runs
//! it in place when submitted from a rayon worker. In both
//! cases a panic inside the job is reported as [`Error::ExecutionFault`]
//! when the handle is waited on.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::numerics::{cap, capabilities};
use crate::scalars::NumericKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    /// Runs every job on the submitting thread.
    Sequential,
    /// Runs jobs on the global rayon pool.
    Parallel,
}

/// An execution context: where jobs run and which numeric kinds it can
/// execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    kind: ContextKind,
    capabilities: u64,
}

impl Context {
    /// Synchronous context with detected capabilities.
    pub fn sequential() -> Self {
        Self {
            kind: ContextKind::Sequential,
            capabilities: capabilities::available(),
        }
    }

    /// Asynchronous context with detected capabilities.
    pub fn parallel() -> Self {
        Self {
            kind: ContextKind::Parallel,
            capabilities: capabilities::available(),
        }
    }

    /// Overrides the capability mask, e.g. with [`cap::ALL`] to emulate a
    /// machine that runs every kind.
    pub fn with_capabilities(mut self, capabilities: u64) -> Self {
        self.capabilities = capabilities | cap::SERIAL;
        self
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn capabilities(&self) -> u64 {
        self.capabilities
    }

    /// Returns `true` if kernels on `kind` can run in this context.
    pub fn supports(&self, kind: NumericKind) -> bool {
        capabilities::supports(self.capabilities, kind)
    }

    /// Submits `job`. `label` names the work in faults and logs.
    pub fn submit<T, F>(&self, label: String, job: F) -> Handle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        trace!(context = ?self.kind, %label, "submit");
        match self.kind {
            ContextKind::Sequential => Handle {
                state: State::Ready(run_guarded(&label, job)),
                label,
            },
            // A worker blocking on its own pool would starve the job.
            ContextKind::Parallel if rayon::current_thread_index().is_some() => Handle {
                state: State::Ready(run_guarded(&label, job)),
                label,
            },
            ContextKind::Parallel => {
                let (sender, receiver) = mpsc::channel();
                let job_label = label.clone();
                rayon::spawn(move || {
                    // The receiver may already be gone if the handle was dropped.
                    let _ = sender.send(run_guarded(&job_label, job));
                });
                Handle {
                    state: State::Pending(receiver),
                    label,
                }
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::sequential()
    }
}

fn run_guarded<T>(label: &str, job: impl FnOnce() -> Result<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(result) => result,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "job panicked".to_string());
            debug!(%label, %reason, "job panicked");
            Err(Error::ExecutionFault {
                problem: label.to_string(),
                reason,
            })
        }
    }
}

enum State<T> {
    Ready(Result<T>),
    Pending(mpsc::Receiver<Result<T>>),
}

/// Completion handle of a submitted job.
#[must_use = "a submitted job is only observed through `wait`"]
pub struct Handle<T> {
    label: String,
    state: State<T>,
}

impl<T> Handle<T> {
    /// Blocks until the job finishes and returns its output.
    pub fn wait(self) -> Result<T> {
        match self.state {
            State::Ready(result) => result,
            State::Pending(receiver) => receiver.recv().map_err(|_| Error::ExecutionFault {
                problem: self.label,
                reason: "job was dropped before completing".to_string(),
            })?,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<T> core::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = match self.state {
            State::Ready(_) => "ready",
            State::Pending(_) => "pending",
        };
        f.debug_struct("Handle")
            .field("label", &self.label)
            .field("state", &state)
            .finish()
    }
}
