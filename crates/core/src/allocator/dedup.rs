//! Content-addressed dedup store: a hash table layered over a parent
//! allocator that interns byte sequences so structurally equal values share
//! one pointer.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use bitvec::prelude::*;
use parking_lot::{Mutex, RwLock};
use tracing::trace;
use xxhash_rust::xxh3::xxh3_64;

use super::{AllocatorDump, CapFlags, Tag, TAG_NONE};
use crate::error::CoreResult;
use crate::Allocator;

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    pub bloom_filter_bits: u32,
    pub bucket_count_bits: u32,
    pub dedup_threshold: usize,
    pub chain_length_grow_trigger: usize,
    pub estimated_content_size: usize,
    pub minimum_bucket_occupancy: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        let bucket_count_bits = 10;
        DedupConfig {
            bloom_filter_bits: 16,
            bucket_count_bits,
            dedup_threshold: 16,
            chain_length_grow_trigger: 8,
            estimated_content_size: 0,
            minimum_bucket_occupancy: 1usize << (bucket_count_bits - 1),
        }
    }
}

#[derive(Clone, Copy)]
struct BucketEntry {
    hash: u64,
    len: u32,
    ptr: usize,
}

struct DedupTagState {
    buckets: Vec<Vec<BucketEntry>>,
    /// k=2 Bloom filter: two bit positions derived from the high/low
    /// 32 bits of the content hash.
    bloom: BitVec<u8, Lsb0>,
    occupancy: usize,
}

impl DedupTagState {
    fn new(cfg: &DedupConfig) -> Self {
        let bucket_count = 1usize << cfg.bucket_count_bits;
        let bloom_bits = 1usize << cfg.bloom_filter_bits;
        DedupTagState {
            buckets: vec![Vec::new(); bucket_count],
            bloom: bitvec![u8, Lsb0; 0; bloom_bits],
            occupancy: 0,
        }
    }

    fn bloom_positions(&self, hash: u64) -> (usize, usize) {
        let len = self.bloom.len();
        (((hash & 0xFFFF_FFFF) as usize) % len, ((hash >> 32) as usize) % len)
    }

    fn bloom_maybe_present(&self, hash: u64) -> bool {
        let (a, b) = self.bloom_positions(hash);
        self.bloom[a] && self.bloom[b]
    }

    fn bloom_mark(&mut self, hash: u64) {
        let (a, b) = self.bloom_positions(hash);
        self.bloom.set(a, true);
        self.bloom.set(b, true);
    }

    fn rehash(&mut self) {
        let new_count = self.buckets.len() * 2;
        let mut new_buckets = vec![Vec::new(); new_count];
        for chain in self.buckets.drain(..) {
            for entry in chain {
                let idx = (entry.hash as usize) % new_count;
                new_buckets[idx].push(entry);
            }
        }
        self.buckets = new_buckets;
    }
}

pub struct DedupStore<P: Allocator> {
    parent: P,
    cfg: DedupConfig,
    tags: RwLock<HashMap<Tag, Arc<Mutex<DedupTagState>>>>,
}

impl<P: Allocator> DedupStore<P> {
    pub fn new(parent: P, cfg: DedupConfig) -> Self {
        DedupStore { parent, cfg, tags: RwLock::new(HashMap::new()) }
    }

    pub fn parent(&self) -> &P {
        &self.parent
    }

    fn state_for(&self, tag: Tag) -> Option<Arc<Mutex<DedupTagState>>> {
        self.tags.read().get(&tag).cloned()
    }

    /// Look up or insert `bytes` under `tag`. Returns the interned pointer.
    fn intern(&self, tag: Tag, bytes: &[u8], align: usize) -> Option<NonNull<u8>> {
        if bytes.len() < self.cfg.dedup_threshold {
            return self.parent.store(tag, bytes, align);
        }
        let state = self.state_for(tag)?;
        let mut st = state.lock();
        let hash = xxh3_64(bytes);

        if st.bloom_maybe_present(hash) {
            let bucket_count = st.buckets.len();
            let idx = (hash as usize) % bucket_count;
            for entry in &st.buckets[idx] {
                if entry.hash == hash && entry.len as usize == bytes.len() {
                    // SAFETY: `entry.ptr` was stored by a prior successful
                    // `parent.store` of exactly `entry.len` bytes under
                    // this same tag, which is still live (we hold its
                    // dedup-state lock and the tag has not been released).
                    let existing =
                        unsafe { std::slice::from_raw_parts(entry.ptr as *const u8, entry.len as usize) };
                    if existing == bytes {
                        return NonNull::new(entry.ptr as *mut u8);
                    }
                }
            }
        }

        let ptr = self.parent.store(tag, bytes, align)?;
        let bucket_count = st.buckets.len();
        let idx = (hash as usize) % bucket_count;
        st.buckets[idx].push(BucketEntry { hash, len: bytes.len() as u32, ptr: ptr.as_ptr() as usize });
        st.bloom_mark(hash);
        st.occupancy += 1;

        if st.buckets[idx].len() > self.cfg.chain_length_grow_trigger
            && st.occupancy >= self.cfg.minimum_bucket_occupancy
        {
            trace!(target: "fy_value_core::allocator", tag, "dedup rehash triggered");
            st.rehash();
        }

        Some(ptr)
    }
}

impl<P: Allocator> Allocator for DedupStore<P> {
    fn capabilities(&self) -> CapFlags {
        self.parent.capabilities() | CapFlags::CAN_DEDUP | CapFlags::CAN_LOOKUP
    }

    fn get_tag(&self) -> CoreResult<Tag> {
        let tag = self.parent.get_tag()?;
        // Insert-if-absent: a parent allocator with a single implicit tag
        // (`BumpArena`) hands back the same `Tag` to every caller, so an
        // unconditional insert here would wipe an already-live tag's
        // bloom filter and bucket table out from under whoever is still
        // holding pointers interned through it.
        self.tags.write().entry(tag).or_insert_with(|| Arc::new(Mutex::new(DedupTagState::new(&self.cfg))));
        Ok(tag)
    }

    fn release_tag(&self, tag: Tag) {
        if tag == TAG_NONE {
            return;
        }
        self.tags.write().remove(&tag);
        self.parent.release_tag(tag);
    }

    fn alloc(&self, tag: Tag, size: usize, align: usize) -> Option<NonNull<u8>> {
        self.parent.alloc(tag, size, align)
    }

    fn store(&self, tag: Tag, bytes: &[u8], align: usize) -> Option<NonNull<u8>> {
        self.intern(tag, bytes, align)
    }

    fn lookup(&self, tag: Tag, bytes: &[u8], _align: usize) -> Option<NonNull<u8>> {
        let state = self.state_for(tag)?;
        let st = state.lock();
        let hash = xxh3_64(bytes);
        if !st.bloom_maybe_present(hash) {
            return None;
        }
        let idx = (hash as usize) % st.buckets.len();
        for entry in &st.buckets[idx] {
            if entry.hash == hash && entry.len as usize == bytes.len() {
                // SAFETY: see `intern`.
                let existing =
                    unsafe { std::slice::from_raw_parts(entry.ptr as *const u8, entry.len as usize) };
                if existing == bytes {
                    return NonNull::new(entry.ptr as *mut u8);
                }
            }
        }
        None
    }

    fn free(&self, tag: Tag, ptr: NonNull<u8>) {
        self.parent.free(tag, ptr);
    }

    fn contains(&self, tag: Tag, ptr: NonNull<u8>) -> bool {
        self.parent.contains(tag, ptr)
    }

    fn tag_linear_size(&self, tag: Tag) -> Option<usize> {
        self.parent.tag_linear_size(tag)
    }

    fn tag_single_linear(&self, tag: Tag) -> Option<(NonNull<u8>, usize)> {
        self.parent.tag_single_linear(tag)
    }

    fn trim_tag(&self, tag: Tag) {
        self.parent.trim_tag(tag);
    }

    fn reset_tag(&self, tag: Tag) {
        if let Some(state) = self.state_for(tag) {
            *state.lock() = DedupTagState::new(&self.cfg);
        }
        self.parent.reset_tag(tag);
    }

    fn dump(&self, tag: Tag) -> AllocatorDump {
        let mut dump = self.parent.dump(tag);
        dump.caps = self.capabilities();
        dump
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::BumpArena;

    #[test]
    fn identical_content_shares_one_pointer() {
        let store = DedupStore::new(BumpArena::new(), DedupConfig { dedup_threshold: 0, ..Default::default() });
        let tag = store.get_tag().unwrap();
        let a = store.store(tag, b"hello", 1).unwrap();
        let b = store.store(tag, b"hello", 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_content_gets_distinct_pointers() {
        let store = DedupStore::new(BumpArena::new(), DedupConfig { dedup_threshold: 0, ..Default::default() });
        let tag = store.get_tag().unwrap();
        let a = store.store(tag, b"hello", 1).unwrap();
        let b = store.store(tag, b"world", 1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn sub_threshold_bypasses_the_table() {
        let store =
            DedupStore::new(BumpArena::new(), DedupConfig { dedup_threshold: 100, ..Default::default() });
        let tag = store.get_tag().unwrap();
        let a = store.store(tag, b"hi", 1).unwrap();
        let b = store.store(tag, b"hi", 1).unwrap();
        // Below threshold: each store call copies independently.
        assert_ne!(a, b);
    }

    #[test]
    fn interning_ten_thousand_copies_keeps_one_backing_copy() {
        // S5.
        let store = DedupStore::new(BumpArena::new(), DedupConfig { dedup_threshold: 0, ..Default::default() });
        let tag = store.get_tag().unwrap();
        let mut ptrs = Vec::new();
        for _ in 0..10_000 {
            ptrs.push(store.store(tag, b"a", 1).unwrap());
        }
        assert!(ptrs.iter().all(|&p| p == ptrs[0]));
        // One interned "a" plus bookkeeping, nowhere near 10,000 copies.
        assert!(store.tag_linear_size(tag).unwrap() < 10_000);
    }

    #[test]
    fn rehash_preserves_lookup() {
        let cfg = DedupConfig {
            dedup_threshold: 0,
            bucket_count_bits: 2,
            chain_length_grow_trigger: 2,
            minimum_bucket_occupancy: 1,
            ..Default::default()
        };
        let store = DedupStore::new(BumpArena::new(), cfg);
        let tag = store.get_tag().unwrap();
        let mut stored = Vec::new();
        for i in 0..64 {
            let bytes = format!("item-{i}");
            stored.push((bytes.clone(), store.store(tag, bytes.as_bytes(), 1).unwrap()));
        }
        for (bytes, ptr) in &stored {
            assert_eq!(store.lookup(tag, bytes.as_bytes(), 1), Some(*ptr));
        }
    }

    #[test]
    fn get_tag_on_a_shared_tag_preserves_existing_entries() {
        // `BumpArena::get_tag` always returns the same tag, so a second
        // `get_tag` call (as every `pmap`/`pfilter` worker issues against a
        // shared `DedupStore<BumpArena>`) must not wipe entries already
        // interned under it.
        let store = DedupStore::new(BumpArena::new(), DedupConfig { dedup_threshold: 0, ..Default::default() });
        let tag = store.get_tag().unwrap();
        let first = store.store(tag, b"already-interned", 1).unwrap();

        let tag_again = store.get_tag().unwrap();
        assert_eq!(tag_again, tag);

        assert_eq!(store.lookup(tag, b"already-interned", 1), Some(first));
        let second = store.store(tag, b"already-interned", 1).unwrap();
        assert_eq!(second, first);
    }

    #[test]
    fn lookup_absent_returns_none() {
        let store = DedupStore::new(BumpArena::new(), DedupConfig { dedup_threshold: 0, ..Default::default() });
        let tag = store.get_tag().unwrap();
        assert!(store.lookup(tag, b"nope", 1).is_none());
    }
}
