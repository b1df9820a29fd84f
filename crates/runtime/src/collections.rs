//! Collection operations (§4.6): `map`/`filter`/`reduce` and their parallel
//! `pmap`/`pfilter` counterparts over the work-stealing thread pool.
//!
//! The sequential variants just walk the sequence with the caller's own
//! builder -- a builder is not thread-safe (§5), but nothing here crosses
//! a thread boundary, so there is nothing to isolate.
//!
//! The parallel variants follow the resolved open question in
//! SPEC_FULL.md §9: each work item that actually runs in the pool gets its
//! own builder over a freshly obtained tag on the *same* allocator, so
//! concurrent construction never shares a tag across threads. Once
//! `ThreadPool::join` returns (back on the calling thread), each worker's
//! result is explicitly re-stored (`Builder::adopt`) under the caller's
//! own tag -- per §3.4, "values never cross tag boundaries silently" --
//! and the worker's now-empty tag is released.

use std::sync::Arc;

use fy_value_core::{Builder, CapFlags, Kind, Value};

use crate::error::{RuntimeError, RuntimeResult};
use crate::pool::ThreadPool;

fn expect_sequence(seq: Value, op: &str) -> RuntimeResult<()> {
    if seq.kind() != Kind::Sequence {
        return Err(RuntimeError::InvalidPath(format!("{op} target is not a sequence")));
    }
    Ok(())
}

fn sequence_elems(seq: Value) -> Vec<Value> {
    (0..seq.len()).map(|i| seq.get_index(i, Value::INVALID)).collect()
}

/// `map(seq, fn)` -- new sequence of the same length with each element
/// transformed.
pub fn map<F>(builder: &Builder, seq: Value, f: F) -> RuntimeResult<Value>
where
    F: Fn(&Builder, Value) -> RuntimeResult<Value>,
{
    expect_sequence(seq, "map")?;
    let mapped: Vec<Value> =
        sequence_elems(seq).into_iter().map(|e| f(builder, e)).collect::<RuntimeResult<_>>()?;
    Ok(builder.sequence(&mapped))
}

/// `filter(seq, pred)` -- new sequence of elements where `pred` is truthy;
/// order preserved.
pub fn filter<P>(builder: &Builder, seq: Value, pred: P) -> RuntimeResult<Value>
where
    P: Fn(&Builder, Value) -> RuntimeResult<bool>,
{
    expect_sequence(seq, "filter")?;
    let mut kept = Vec::new();
    for e in sequence_elems(seq) {
        if pred(builder, e)? {
            kept.push(e);
        }
    }
    Ok(builder.sequence(&kept))
}

/// `reduce(seq, init, fn)` -- accumulated scalar (or any value `fn`
/// chooses to fold into, built against whatever builder the closure
/// captures).
pub fn reduce<F>(seq: Value, init: Value, f: F) -> RuntimeResult<Value>
where
    F: Fn(Value, Value) -> RuntimeResult<Value>,
{
    expect_sequence(seq, "reduce")?;
    let mut acc = init;
    for e in sequence_elems(seq) {
        acc = f(acc, e)?;
    }
    Ok(acc)
}

/// Partitions `elems` by the work-check predicate (§4.6): elements the
/// predicate rejects run inline under `builder`, on the calling thread,
/// skipping pool dispatch entirely; the rest go to the pool. Returns a
/// per-index membership mask (cheap O(1) lookup per element) alongside the
/// indices selected for the pool, rather than a bare `Vec<usize>` callers
/// would otherwise have to linear-scan with `contains` per element.
fn partition_by_work_check(
    elems: &[Value],
    work_check: Option<&(dyn Fn(Value) -> bool + Sync)>,
) -> (Vec<bool>, Vec<usize>) {
    let mask: Vec<bool> = match work_check {
        None => vec![true; elems.len()],
        Some(check) => elems.iter().map(|&e| check(e)).collect(),
    };
    let indices: Vec<usize> = mask.iter().enumerate().filter(|(_, &p)| p).map(|(i, _)| i).collect();
    (mask, indices)
}

/// `pmap(seq, fn)` -- parallel variant of [`map`]. See the module doc for
/// how per-worker builders and tag adoption compose with the work-check
/// predicate.
pub fn pmap<F>(
    builder: &Builder,
    pool: &ThreadPool,
    seq: Value,
    work_check: Option<&(dyn Fn(Value) -> bool + Sync)>,
    f: F,
) -> RuntimeResult<Value>
where
    F: Fn(&Builder, Value) -> RuntimeResult<Value> + Sync,
{
    expect_sequence(seq, "pmap")?;
    let elems = sequence_elems(seq);
    let (is_parallel, parallel_indices) = partition_by_work_check(&elems, work_check);
    let mut results: Vec<Option<Value>> = vec![None; elems.len()];

    for i in 0..elems.len() {
        if !is_parallel[i] {
            results[i] = Some(f(builder, elems[i])?);
        }
    }

    if !parallel_indices.is_empty() {
        let allocator = builder.allocator();
        let policy = builder.policy();
        // A single-tag allocator (`BumpArena`, or a `DedupStore` wrapping
        // one) hands every worker the same tag as the caller's own
        // builder, so releasing it would reclaim the whole shared arena
        // instead of a worker-private region -- including the value just
        // adopted and any result still waiting to be. Only release when
        // the allocator actually advertises independent per-tag lifetime.
        let can_free_tag = allocator.capabilities().has(CapFlags::CAN_FREE_TAG);
        let computed = pool.join(parallel_indices.len(), |j| {
            let i = parallel_indices[j];
            let worker = Builder::new(Arc::clone(allocator), policy, false)?;
            let out = f(&worker, elems[i]);
            let tag = worker.tag();
            out.map(|v| (v, tag))
        })?;
        for (j, (value, tag)) in computed.into_iter().enumerate() {
            let i = parallel_indices[j];
            results[i] = Some(builder.adopt(value));
            if can_free_tag {
                allocator.release_tag(tag);
            }
        }
    }

    let mapped: Vec<Value> = results.into_iter().map(|r| r.expect("every index filled")).collect();
    Ok(builder.sequence(&mapped))
}

/// `pfilter(seq, pred)` -- parallel variant of [`filter`]. Predicate
/// results are plain booleans, so no tag-crossing adoption is needed for
/// them; the worker's tag is released once its verdict is collected.
pub fn pfilter<P>(
    builder: &Builder,
    pool: &ThreadPool,
    seq: Value,
    work_check: Option<&(dyn Fn(Value) -> bool + Sync)>,
    pred: P,
) -> RuntimeResult<Value>
where
    P: Fn(&Builder, Value) -> RuntimeResult<bool> + Sync,
{
    expect_sequence(seq, "pfilter")?;
    let elems = sequence_elems(seq);
    let (is_parallel, parallel_indices) = partition_by_work_check(&elems, work_check);
    let mut keep: Vec<Option<bool>> = vec![None; elems.len()];

    for i in 0..elems.len() {
        if !is_parallel[i] {
            keep[i] = Some(pred(builder, elems[i])?);
        }
    }

    if !parallel_indices.is_empty() {
        let allocator = builder.allocator();
        let policy = builder.policy();
        // See the matching comment in `pmap`: releasing a worker's tag is
        // only safe when the allocator can reclaim tags independently.
        let can_free_tag = allocator.capabilities().has(CapFlags::CAN_FREE_TAG);
        let computed = pool.join(parallel_indices.len(), |j| {
            let i = parallel_indices[j];
            let worker = Builder::new(Arc::clone(allocator), policy, false)?;
            let result = pred(&worker, elems[i]);
            if can_free_tag {
                allocator.release_tag(worker.tag());
            }
            result
        })?;
        for (j, flag) in computed.into_iter().enumerate() {
            keep[parallel_indices[j]] = Some(flag);
        }
    }

    let filtered: Vec<Value> = elems
        .into_iter()
        .zip(keep)
        .filter_map(|(e, k)| if k.expect("every index filled") { Some(e) } else { None })
        .collect();
    Ok(builder.sequence(&filtered))
}
