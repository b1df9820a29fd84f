//! Error enum for the value runtime's fallible entry points.
//!
//! Per the error handling design: `not-found` and `type-mismatch` are
//! deliberately **not** variants here. Both resolve to the caller-supplied
//! default and must never surface as an `Err` — see `Value`'s inspectors
//! and `get` in the update engine.

use thiserror::Error;

use crate::allocator::Tag;

/// Errors surfaced by allocator construction, tag management, configuration
/// parsing, and thread-pool construction/join.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The allocator could not satisfy a request (extent growth failed, or
    /// the underlying `malloc`/`mmap`/`mremap` call returned an error).
    #[error("out of memory: requested {requested} bytes (align {align})")]
    OutOfMemory { requested: usize, align: usize },

    /// A size, alignment, or index argument violated a precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The allocator has reached its configured tag count.
    #[error("tag exhausted: no more tags available (limit {limit})")]
    TagExhausted { limit: usize },

    /// The tag passed to an allocator operation does not belong to it.
    #[error("unknown tag {0}")]
    UnknownTag(Tag),

    /// At least one parallel work item reported an error; surfaced on join.
    #[error("worker failure: {0}")]
    WorkerFailure(String),

    /// The allocator configuration string did not match the grammar.
    #[error("config parse error: {0}")]
    ConfigParse(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
