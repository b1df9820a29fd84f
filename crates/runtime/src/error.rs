//! Error enum for the persistent update engine, collection operations, and
//! thread pool.
//!
//! This deliberately does not reuse the thread-local FFI error-channel
//! style the teacher workspace used elsewhere (`extern "C"` boundaries
//! that can't propagate a `Result`): this crate is a plain Rust library,
//! so its fallible entry points return ordinary `Result`s (SPEC_FULL.md
//! §10.1). Allocator-level failures surface wrapped rather than
//! duplicated, since every fallible call here bottoms out in a
//! [`fy_value_core::Builder`] call.

use thiserror::Error;

use fy_value_core::CoreError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Propagated from the underlying allocator/builder.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A `path` argument to `update` did not resolve to a container at
    /// every intermediate step (e.g. indexing into a scalar).
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// At least one parallel work item reported an error; surfaced on the
    /// join call that submitted it (§4.7, §7 `worker-failure`).
    #[error("{failed} of {total} work items failed; first error: {first}")]
    WorkerFailure { failed: usize, total: usize, first: String },

    /// A thread pool was asked to start with zero threads (§6.3: "a pool
    /// of 0 threads is rejected").
    #[error("thread pool requires at least one thread")]
    ZeroThreads,

    /// `reserve`/`submit_work`/`wait_work`/`unreserve` called out of the
    /// reservation-mode protocol's order, or on a handle already retired.
    #[error("reservation protocol violation: {0}")]
    ReservationMisuse(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
