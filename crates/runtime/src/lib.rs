//! Generic immutable value runtime: operations layer.
//!
//! Built on top of `fy-value-core`'s tagged value word, allocator, and
//! builder. This crate adds the three things that operate *on* already-built
//! values rather than constructing the representation itself:
//!
//! - `persistent`: the structural-sharing update engine (`assoc`/`dissoc`/
//!   `get`/`append`/`update`/`concat`).
//! - `collections`: `map`/`filter`/`reduce` and their parallel `pmap`/
//!   `pfilter` counterparts.
//! - `pool`: the thread pool backing the parallel collection operations,
//!   in both work-stealing and reservation modes.
//! - `error`: the `RuntimeError` enum shared by every fallible entry point
//!   in this crate.

pub mod collections;
pub mod error;
pub mod persistent;
pub mod pool;

pub use collections::{filter, map, pfilter, pmap, reduce};
pub use error::{RuntimeError, RuntimeResult};
pub use persistent::{append, assoc, concat, dissoc, get, update, PathStep};
pub use pool::{PoolConfig, ReservationPool, ReservedWorker, ThreadPool};
