//! The generic builder: the sole public factory for [`Value`]s.
//!
//! A builder couples a chosen allocator, a current tag, and a policy
//! bitset (§3.3). Every value constructor here validates its inputs,
//! writes the payload through the allocator (optionally interning it, if
//! the allocator advertises [`CapFlags::CAN_DEDUP`]), and returns the
//! tagged word. Composite constructors stage their content in a local
//! buffer first, matching the bottom-up fingerprinting in §4.4: children
//! are already-built `Value` words by the time a sequence/mapping
//! constructor runs, so the staged buffer *is* the content that gets
//! hashed and interned.

use std::cell::RefCell;
use std::sync::Arc;

use tracing::warn;

use crate::allocator::{Allocator, AutoAllocator, CapFlags, ScenarioType, Tag};
use crate::error::{CoreError, CoreResult};
use crate::records::{AliasRecord, MappingRecord, SequenceRecord, StringRecord};
use crate::value::{Kind, Value};

/// Opaque policy flags carried by a builder. `schema_auto` and
/// `scope_leader` are reported but never branched on by this crate (see
/// SPEC_FULL.md's resolved open question) — only an external YAML
/// integration interprets them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuilderPolicy {
    pub dedup_enabled: bool,
    pub schema_auto: bool,
    pub scope_leader: bool,
}

/// Configuration accepted by [`Builder::new`] / external factory helpers.
#[derive(Debug, Clone, Copy)]
pub struct BuilderConfig {
    pub dedup_enabled: bool,
    pub owns_allocator: bool,
    pub schema_auto: bool,
    pub scope_leader: bool,
    pub estimated_max_size: usize,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            dedup_enabled: false,
            owns_allocator: false,
            schema_auto: false,
            scope_leader: false,
            estimated_max_size: 0,
        }
    }
}

/// A document wrapper: a root value plus whatever stream-level metadata
/// the external producer wants to carry alongside it (§4.4). Not itself a
/// tagged [`Value`] — both fields are already-built values owned by the
/// same builder.
#[derive(Debug, Clone, Copy)]
pub struct Document {
    pub root: Value,
    pub metadata: Value,
}

/// The sole public factory for [`Value`]s.
///
/// Per §5: a builder is **not** thread-safe. It is `Send` (so ownership
/// can move to a worker thread, matching the resolved open question in
/// SPEC_FULL.md §9: each parallel worker gets its own builder) but not
/// `Sync` — `&Builder` cannot cross a thread boundary, only an owned one.
pub struct Builder {
    allocator: Arc<dyn Allocator>,
    tag: Tag,
    owns_allocator: bool,
    policy: BuilderPolicy,
    last_error: RefCell<Option<CoreError>>,
}

impl Builder {
    /// Create a builder over a fresh tag obtained from `allocator`.
    pub fn new(allocator: Arc<dyn Allocator>, policy: BuilderPolicy, owns_allocator: bool) -> CoreResult<Self> {
        if policy.dedup_enabled && !allocator.capabilities().has(CapFlags::CAN_DEDUP) {
            warn!(
                target: "fy_value_core::builder",
                "dedup_enabled requested but allocator does not advertise CAN_DEDUP; proceeding without interning"
            );
        }
        let tag = allocator.get_tag()?;
        Ok(Builder { allocator, tag, owns_allocator, policy, last_error: RefCell::new(None) })
    }

    /// Create a builder together with a fresh allocator sized from
    /// `config` (§6.1: "create/destroy builder with configuration"). This
    /// is the convenience path for a caller that has no existing
    /// allocator to share — the chosen scenario is a bump arena, deduping
    /// one when `dedup_enabled` is set, sized by `estimated_max_size`
    /// (`auto`'s `single_linear[_dedup]` scenario, §6.4). A caller that
    /// already owns an allocator (e.g. to share it across sibling
    /// builders) should call [`Builder::new`] directly instead.
    pub fn from_config(config: BuilderConfig) -> CoreResult<Self> {
        let scenario =
            if config.dedup_enabled { ScenarioType::SingleLinearDedup } else { ScenarioType::SingleLinear };
        let allocator: Arc<dyn Allocator> = Arc::new(AutoAllocator::new(scenario, config.estimated_max_size));
        let policy = BuilderPolicy {
            dedup_enabled: config.dedup_enabled,
            schema_auto: config.schema_auto,
            scope_leader: config.scope_leader,
        };
        Builder::new(allocator, policy, config.owns_allocator)
    }

    /// Create a builder over an already-obtained tag (e.g. a worker thread
    /// sharing the caller's allocator but given its own tag, or the same
    /// tag under the dedup store's existing per-tag lock).
    pub fn with_tag(allocator: Arc<dyn Allocator>, tag: Tag, policy: BuilderPolicy, owns_allocator: bool) -> Self {
        Builder { allocator, tag, owns_allocator, policy, last_error: RefCell::new(None) }
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn policy(&self) -> BuilderPolicy {
        self.policy
    }

    pub fn owns_allocator(&self) -> bool {
        self.owns_allocator
    }

    /// The last error recorded by a constructor that returned
    /// [`Value::INVALID`]. Constructors never panic or return `Result`
    /// (§7); this is the out-of-band channel callers may poll.
    pub fn last_error(&self) -> Option<CoreError> {
        self.last_error.borrow().clone()
    }

    /// Destroy the builder, releasing its tag (§3.4 step 5): every value
    /// previously obtained from it becomes invalid simultaneously. Not a
    /// `Drop` impl, deliberately: `with_tag` lets several builders share
    /// one tag (e.g. worker threads using the dedup store's existing
    /// per-tag lock), and an automatic release on every drop would free a
    /// tag still in use by a sibling builder. Callers that obtained their
    /// own tag via `new` should call this once they are done constructing.
    pub fn release(self) {
        self.allocator.release_tag(self.tag);
    }

    fn record_error(&self, err: CoreError) -> Value {
        *self.last_error.borrow_mut() = Some(err);
        Value::INVALID
    }

    // -- scalar constructors --

    pub fn null(&self) -> Value {
        Value::NULL
    }

    pub fn bool(&self, b: bool) -> Value {
        Value::bool(b)
    }

    /// Boxes `n` in the arena if it does not fit the 44-bit inline payload.
    pub fn int(&self, n: i64) -> Value {
        if let Some(v) = Value::int_inline(n) {
            return v;
        }
        let bytes = n.to_ne_bytes();
        match self.allocator.store(self.tag, &bytes, std::mem::align_of::<i64>()) {
            Some(ptr) => unsafe { Value::int_boxed(ptr.as_ptr().cast()) },
            None => self.record_error(CoreError::OutOfMemory { requested: bytes.len(), align: 8 }),
        }
    }

    /// Floats are always inline (NaN-boxed); never allocates.
    pub fn float(&self, f: f64) -> Value {
        Value::float(f)
    }

    // -- string constructor --

    pub fn string(&self, s: &str) -> Value {
        let bytes = s.as_bytes();
        let size = StringRecord::content_size(bytes.len());
        let mut buf = vec![0u8; size];
        // SAFETY: `buf` is exactly `content_size(bytes.len())` bytes,
        // 8-byte aligned (`Vec<u8>`'s allocation is at least that on every
        // target this crate supports for the lengths involved here).
        unsafe {
            StringRecord::write(buf.as_mut_ptr(), bytes);
        }
        match self.allocator.store(self.tag, &buf, StringRecord::ALIGN) {
            Some(ptr) => unsafe { Value::string(ptr.as_ptr().cast()) },
            None => self.record_error(CoreError::OutOfMemory { requested: size, align: StringRecord::ALIGN }),
        }
    }

    // -- sequence constructor --

    /// Builds a sequence from already-built child values. The empty
    /// sequence is the shared process-wide singleton (§4.1) and never
    /// touches the allocator.
    pub fn sequence(&self, elems: &[Value]) -> Value {
        if elems.is_empty() {
            return Value::empty_sequence();
        }
        let size = SequenceRecord::content_size(elems.len());
        let mut buf = vec![0u8; size];
        // SAFETY: `buf` is exactly `content_size(elems.len())` bytes.
        unsafe {
            SequenceRecord::write(buf.as_mut_ptr(), elems);
        }
        match self.allocator.store(self.tag, &buf, SequenceRecord::ALIGN) {
            Some(ptr) => unsafe { Value::sequence(ptr.as_ptr().cast()) },
            None => self.record_error(CoreError::OutOfMemory { requested: size, align: SequenceRecord::ALIGN }),
        }
    }

    // -- mapping constructors --

    /// Builds a mapping from (key, value) pairs, preserving their order.
    /// The empty mapping is the shared singleton.
    pub fn mapping(&self, pairs: &[(Value, Value)]) -> Value {
        if pairs.is_empty() {
            return Value::empty_mapping();
        }
        let size = MappingRecord::content_size(pairs.len());
        let mut buf = vec![0u8; size];
        // SAFETY: `buf` is exactly `content_size(pairs.len())` bytes.
        unsafe {
            MappingRecord::write(buf.as_mut_ptr(), pairs);
        }
        match self.allocator.store(self.tag, &buf, MappingRecord::ALIGN) {
            Some(ptr) => unsafe { Value::mapping(ptr.as_ptr().cast()) },
            None => self.record_error(CoreError::OutOfMemory { requested: size, align: MappingRecord::ALIGN }),
        }
    }

    /// Builds a mapping from a flat `[k0, v0, k1, v1, ...]` list. Odd
    /// length is an invalid-argument error: the caller-supplied flat list
    /// must have balanced key/value entries.
    pub fn mapping_flat(&self, flat: &[Value]) -> Value {
        if flat.len() % 2 != 0 {
            return self.record_error(CoreError::InvalidArgument(format!(
                "mapping_flat: odd-length list ({} entries, keys and values must pair up)",
                flat.len()
            )));
        }
        let pairs: Vec<(Value, Value)> = flat.chunks_exact(2).map(|kv| (kv[0], kv[1])).collect();
        self.mapping(&pairs)
    }

    // -- alias/anchor constructor --

    pub fn alias(&self, name: &str, target: Option<Value>) -> Value {
        let name_val = self.string(name);
        let Some(name_ptr) = name_val.string_record() else {
            return Value::INVALID;
        };
        let size = AliasRecord::content_size();
        let mut buf = vec![0u8; size];
        // SAFETY: `buf` is exactly `content_size()` bytes; `name_ptr`
        // points at the string record just stored above, under the same
        // tag, which outlives this alias record.
        unsafe {
            AliasRecord::write(buf.as_mut_ptr(), name_ptr, target);
        }
        match self.allocator.store(self.tag, &buf, AliasRecord::ALIGN) {
            Some(ptr) => unsafe { Value::alias(ptr.as_ptr().cast()) },
            None => self.record_error(CoreError::OutOfMemory { requested: size, align: AliasRecord::ALIGN }),
        }
    }

    // -- document wrapper --

    pub fn document(&self, root: Value, metadata: Value) -> Document {
        Document { root, metadata }
    }

    // -- cross-tag adoption --

    /// Re-stores `v` under this builder's tag, recursing into composites.
    /// Scalars that carry no pointer (null, bool, inline int, float) are
    /// returned unchanged. Per §3.4: "values never cross tag boundaries
    /// silently" — this is the explicit crossing.
    pub fn adopt(&self, v: Value) -> Value {
        match v.kind() {
            Kind::Invalid | Kind::Null | Kind::Bool | Kind::Float => v,
            Kind::Int => self.int(v.as_int(0)),
            Kind::String => self.string(v.as_str("")),
            Kind::Sequence => {
                let elems: Vec<Value> = (0..v.len()).map(|i| self.adopt(v.get_index(i, Value::INVALID))).collect();
                self.sequence(&elems)
            }
            Kind::Mapping => {
                let rec = v.mapping_record().expect("Kind::Mapping implies a mapping record");
                // SAFETY: `rec` was produced by `MappingRecord::write`.
                let pairs: Vec<(Value, Value)> =
                    unsafe { (*rec).pairs() }.map(|(k, val)| (self.adopt(k), self.adopt(val))).collect();
                self.mapping(&pairs)
            }
            Kind::Alias => {
                let rec = v.alias_record().expect("Kind::Alias implies an alias record");
                // SAFETY: `rec` was produced by `AliasRecord::write`.
                let (name, target) = unsafe { ((*(*rec).name()).as_str(), (*rec).target()) };
                self.alias(name, target.map(|t| self.adopt(t)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{BumpArena, DedupConfig, DedupStore};

    fn plain_builder() -> Builder {
        let allocator: Arc<dyn Allocator> = Arc::new(BumpArena::new());
        Builder::new(allocator, BuilderPolicy::default(), true).unwrap()
    }

    fn dedup_builder() -> Builder {
        let allocator: Arc<dyn Allocator> =
            Arc::new(DedupStore::new(BumpArena::new(), DedupConfig { dedup_threshold: 0, ..Default::default() }));
        Builder::new(allocator, BuilderPolicy { dedup_enabled: true, ..Default::default() }, true).unwrap()
    }

    #[test]
    fn scalars_roundtrip() {
        let b = plain_builder();
        assert_eq!(b.bool(true).as_bool(false), true);
        assert_eq!(b.int(42).as_int(0), 42);
        assert_eq!(b.float(1.5).as_float(0.0), 1.5);
        assert_eq!(b.null().kind(), Kind::Null);
    }

    #[test]
    fn boxed_int_roundtrips_through_arena() {
        let b = plain_builder();
        let big = i64::MAX;
        let v = b.int(big);
        assert_eq!(v.kind(), Kind::Int);
        assert_eq!(v.as_int(0), big);
    }

    #[test]
    fn string_roundtrip() {
        let b = plain_builder();
        let v = b.string("hello world");
        assert_eq!(v.as_str(""), "hello world");
    }

    #[test]
    fn sequence_and_mapping_roundtrip() {
        let b = plain_builder();
        let elems = [b.int(1), b.int(2), b.int(3)];
        let seq = b.sequence(&elems);
        assert_eq!(seq.len(), 3);
        assert_eq!(seq.get_index(1, Value::INVALID).as_int(0), 2);

        let key = b.string("k");
        let val = b.int(99);
        let map = b.mapping(&[(key, val)]);
        assert_eq!(map.get_key(key, Value::INVALID).as_int(0), 99);
    }

    #[test]
    fn mapping_flat_pairs_up_keys_and_values() {
        let b = plain_builder();
        let k1 = b.string("a");
        let v1 = b.int(1);
        let k2 = b.string("b");
        let v2 = b.int(2);
        let map = b.mapping_flat(&[k1, v1, k2, v2]);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get_key(k1, Value::INVALID).as_int(0), 1);
        assert_eq!(map.get_key(k2, Value::INVALID).as_int(0), 2);
    }

    #[test]
    fn mapping_flat_rejects_odd_length() {
        let b = plain_builder();
        let v = b.mapping_flat(&[b.int(1), b.int(2), b.int(3)]);
        assert!(!v.is_valid());
        assert!(matches!(b.last_error(), Some(CoreError::InvalidArgument(_))));
    }

    #[test]
    fn empty_sequence_and_mapping_are_the_shared_singleton() {
        let b = plain_builder();
        assert_eq!(b.sequence(&[]).to_bits(), Value::empty_sequence().to_bits());
        assert_eq!(b.mapping(&[]).to_bits(), Value::empty_mapping().to_bits());
    }

    #[test]
    fn dedup_builder_interns_identical_composites() {
        // §4.4 fingerprinting: structurally identical composites share
        // storage once children are interned bottom-up.
        let b = dedup_builder();
        let a1 = b.string("a");
        let a2 = b.string("a");
        assert_eq!(a1.to_bits(), a2.to_bits());

        let seq1 = b.sequence(&[b.int(1), b.int(2)]);
        let seq2 = b.sequence(&[b.int(1), b.int(2)]);
        assert_eq!(seq1.to_bits(), seq2.to_bits());
    }

    #[test]
    fn from_config_builds_a_working_dedup_builder() {
        let b = Builder::from_config(BuilderConfig {
            dedup_enabled: true,
            owns_allocator: true,
            estimated_max_size: 4096,
            ..Default::default()
        })
        .unwrap();
        let a1 = b.string("repeat");
        let a2 = b.string("repeat");
        assert_eq!(a1.to_bits(), a2.to_bits());
    }

    #[test]
    fn from_config_without_dedup_still_constructs_values() {
        let b = Builder::from_config(BuilderConfig::default()).unwrap();
        assert_eq!(b.int(7).as_int(0), 7);
    }

    #[test]
    fn alias_roundtrip() {
        let b = plain_builder();
        let target = b.int(5);
        let v = b.alias("anchor1", Some(target));
        assert_eq!(v.kind(), Kind::Alias);
    }

    #[test]
    fn adopt_deep_copies_into_a_new_tag() {
        let src = plain_builder();
        let dst = plain_builder();
        let original = src.mapping(&[(src.string("k"), src.sequence(&[src.int(1), src.int(2)]))]);
        let adopted = dst.adopt(original);
        let key = dst.string("k");
        let seq = adopted.get_key(key, Value::INVALID);
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.get_index(0, Value::INVALID).as_int(0), 1);
    }
}
