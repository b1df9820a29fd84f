//! Persistent update engine (§4.5): `assoc`/`dissoc`/`get`/`append`/`update`,
//! plus `concat` (listed alongside them in §6.1's external API).
//!
//! Every operation here produces a shallow copy of the one container it
//! touches and reuses every untouched child `Value` unchanged -- sharing
//! falls out of the flat (length + inline entries) representation the
//! builder already writes (`fy_value_core::builder`): rebuilding a mapping
//! or sequence just re-stages the same children plus the one that changed.
//! With dedup enabled an unchanged subtree collapses back to its original
//! pointer during intern, so `assoc`ing an unrelated key into a large map
//! is cheap in the allocator, not just in this module.

use fy_value_core::{structural_eq, Builder, Kind, Value};

use crate::error::{RuntimeError, RuntimeResult};

/// Byte-equal first (canonical under a deduplicating builder), falling
/// back to structural comparison for a plain builder where two
/// independently-built composites with identical content are not the same
/// pointer (§4.5: "For the rare non-dedup builder, the engine falls back
/// to structural comparison").
fn keys_equal(a: Value, b: Value) -> bool {
    a.to_bits() == b.to_bits() || structural_eq(a, b)
}

/// `assoc(map, key, value)` -- §4.5: replaces an existing key in place
/// (preserving its position) or appends a new key at the end.
pub fn assoc(builder: &Builder, map: Value, key: Value, value: Value) -> RuntimeResult<Value> {
    if map.kind() != Kind::Mapping {
        return Err(RuntimeError::InvalidPath("assoc target is not a mapping".into()));
    }
    let mut pairs = each_pair(map)?;
    match pairs.iter_mut().find(|(k, _)| keys_equal(*k, key)) {
        Some((_, v)) => *v = value,
        None => pairs.push((key, value)),
    }
    Ok(builder.mapping(&pairs))
}

/// `dissoc(map, key)` -- §4.5: drops `key`, preserving the order of every
/// surviving entry.
pub fn dissoc(builder: &Builder, map: Value, key: Value) -> RuntimeResult<Value> {
    if map.kind() != Kind::Mapping {
        return Err(RuntimeError::InvalidPath("dissoc target is not a mapping".into()));
    }
    let pairs: Vec<(Value, Value)> = each_pair(map)?.into_iter().filter(|(k, _)| !keys_equal(*k, key)).collect();
    Ok(builder.mapping(&pairs))
}

/// `get(map, key, default)` -- falls back to structural comparison the
/// same way `assoc`/`dissoc` do, so a non-dedup builder's mappings are
/// still queryable by value rather than by pointer identity.
pub fn get(map: Value, key: Value, default: Value) -> Value {
    let direct = map.get_key(key, Value::INVALID);
    if direct.is_valid() || map.kind() != Kind::Mapping {
        return if direct.is_valid() { direct } else { default };
    }
    each_pair(map)
        .unwrap_or_default()
        .into_iter()
        .find(|(k, _)| structural_eq(*k, key))
        .map(|(_, v)| v)
        .unwrap_or(default)
}

/// `append(seq, value)` -- §4.5: strictly tail-insertion.
pub fn append(builder: &Builder, seq: Value, value: Value) -> RuntimeResult<Value> {
    if seq.kind() != Kind::Sequence {
        return Err(RuntimeError::InvalidPath("append target is not a sequence".into()));
    }
    let mut elems: Vec<Value> = (0..seq.len()).map(|i| seq.get_index(i, Value::INVALID)).collect();
    elems.push(value);
    Ok(builder.sequence(&elems))
}

/// `concat(seq_a, seq_b)` -- new sequence of length `a.len() + b.len()`
/// (§4.6, listed alongside the persistent-engine ops in §6.1).
pub fn concat(builder: &Builder, seq_a: Value, seq_b: Value) -> RuntimeResult<Value> {
    if seq_a.kind() != Kind::Sequence || seq_b.kind() != Kind::Sequence {
        return Err(RuntimeError::InvalidPath("concat operands must both be sequences".into()));
    }
    let mut elems: Vec<Value> = (0..seq_a.len()).map(|i| seq_a.get_index(i, Value::INVALID)).collect();
    elems.extend((0..seq_b.len()).map(|i| seq_b.get_index(i, Value::INVALID)));
    Ok(builder.sequence(&elems))
}

/// A path component for `update`: index into a sequence or key into a
/// mapping. `update` walks down the path, rebuilding only the ancestor
/// containers on the spine it touched (§4.5).
#[derive(Debug, Clone, Copy)]
pub enum PathStep {
    Index(usize),
    Key(Value),
}

/// `update(coll, path, fn)` -- applies `fn` to the value reached by `path`
/// and rebuilds only the spine from the root down to that leaf; every
/// sibling container is shared, unrebuilt (§4.5).
pub fn update<F>(builder: &Builder, coll: Value, path: &[PathStep], f: F) -> RuntimeResult<Value>
where
    F: FnOnce(Value) -> Value,
{
    match path.split_first() {
        None => Ok(f(coll)),
        Some((PathStep::Index(i), rest)) => {
            if coll.kind() != Kind::Sequence {
                return Err(RuntimeError::InvalidPath(format!("update: expected sequence at index {i}")));
            }
            let child = coll.get_index(*i, Value::INVALID);
            if !child.is_valid() && *i >= coll.len() {
                return Err(RuntimeError::InvalidPath(format!("update: index {i} out of range")));
            }
            let new_child = update(builder, child, rest, f)?;
            let mut elems: Vec<Value> = (0..coll.len()).map(|j| coll.get_index(j, Value::INVALID)).collect();
            elems[*i] = new_child;
            Ok(builder.sequence(&elems))
        }
        Some((PathStep::Key(key), rest)) => {
            if coll.kind() != Kind::Mapping {
                return Err(RuntimeError::InvalidPath("update: expected mapping".into()));
            }
            let child = get(coll, *key, Value::INVALID);
            let new_child = update(builder, child, rest, f)?;
            assoc(builder, coll, *key, new_child)
        }
    }
}

/// Enumerate a mapping's (key, value) pairs in insertion order, via
/// `Value::mapping_pairs` (`fy-value-core`).
pub(crate) fn each_pair(map: Value) -> RuntimeResult<Vec<(Value, Value)>> {
    if map.kind() != Kind::Mapping {
        return Err(RuntimeError::InvalidPath("expected a mapping".into()));
    }
    Ok(map.mapping_pairs())
}
