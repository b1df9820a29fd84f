//! Malloc wrapper: each allocation tracked individually so `free` actually
//! frees, at the cost of per-allocation bookkeeping. Intended for
//! diagnostic builds (leak checking, ASan-style instrumentation sits
//! naturally on top of per-allocation tracking).

use std::alloc::Layout;
use std::collections::HashMap;
use std::ptr::NonNull;

use parking_lot::Mutex;

use super::{AllocatorDump, CapFlags, Tag, TAG_NONE};
use crate::error::CoreResult;
use crate::Allocator;

struct TagState {
    live: HashMap<usize, Layout>,
}

pub struct MallocWrapper {
    next_tag: Mutex<Tag>,
    tags: Mutex<HashMap<Tag, TagState>>,
}

impl MallocWrapper {
    pub fn new() -> Self {
        MallocWrapper { next_tag: Mutex::new(0), tags: Mutex::new(HashMap::new()) }
    }
}

impl Default for MallocWrapper {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for MallocWrapper {
    fn capabilities(&self) -> CapFlags {
        CapFlags::CAN_FREE_INDIVIDUAL
            | CapFlags::CAN_FREE_TAG
            | CapFlags::HAS_CONTAINS
            | CapFlags::HAS_EFFICIENT_CONTAINS
            | CapFlags::HAS_TAGS
    }

    fn get_tag(&self) -> CoreResult<Tag> {
        let mut next = self.next_tag.lock();
        let tag = *next;
        *next += 1;
        self.tags.lock().insert(tag, TagState { live: HashMap::new() });
        Ok(tag)
    }

    fn release_tag(&self, tag: Tag) {
        if tag == TAG_NONE {
            return;
        }
        if let Some(state) = self.tags.lock().remove(&tag) {
            for (addr, layout) in state.live {
                // SAFETY: `layout` is exactly what this allocation was made
                // with, recorded at `alloc` time.
                unsafe {
                    std::alloc::dealloc(addr as *mut u8, layout);
                }
            }
        }
    }

    fn alloc(&self, tag: Tag, size: usize, align: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size.max(1), align).ok()?;
        let mut tags = self.tags.lock();
        let state = tags.get_mut(&tag)?;
        // SAFETY: layout has non-zero size by construction above.
        let ptr = unsafe { std::alloc::alloc(layout) };
        let ptr = NonNull::new(ptr)?;
        state.live.insert(ptr.as_ptr() as usize, layout);
        Some(ptr)
    }

    fn store(&self, tag: Tag, bytes: &[u8], align: usize) -> Option<NonNull<u8>> {
        let dst = self.alloc(tag, bytes.len().max(1), align)?;
        // SAFETY: `dst` was just allocated for exactly this many bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len());
        }
        Some(dst)
    }

    fn free(&self, tag: Tag, ptr: NonNull<u8>) {
        let mut tags = self.tags.lock();
        if let Some(state) = tags.get_mut(&tag) {
            if let Some(layout) = state.live.remove(&(ptr.as_ptr() as usize)) {
                // SAFETY: removed from the live set above, matching layout.
                unsafe {
                    std::alloc::dealloc(ptr.as_ptr(), layout);
                }
            }
        }
    }

    fn contains(&self, tag: Tag, ptr: NonNull<u8>) -> bool {
        self.tags
            .lock()
            .get(&tag)
            .is_some_and(|s| s.live.contains_key(&(ptr.as_ptr() as usize)))
    }

    fn tag_linear_size(&self, tag: Tag) -> Option<usize> {
        self.tags
            .lock()
            .get(&tag)
            .map(|s| s.live.values().map(|l| l.size()).sum())
    }

    fn reset_tag(&self, tag: Tag) {
        let mut tags = self.tags.lock();
        if let Some(state) = tags.get_mut(&tag) {
            let drained: Vec<(usize, Layout)> = state.live.drain().collect();
            drop(tags);
            for (addr, layout) in drained {
                // SAFETY: matches `alloc`'s recorded layout.
                unsafe {
                    std::alloc::dealloc(addr as *mut u8, layout);
                }
            }
        }
    }

    fn dump(&self, tag: Tag) -> AllocatorDump {
        let tags = self.tags.lock();
        let (extent_count, live_bytes) = tags
            .get(&tag)
            .map(|s| (s.live.len(), s.live.values().map(|l| l.size()).sum()))
            .unwrap_or((0, 0));
        AllocatorDump { tag, extent_count, live_bytes, caps: self.capabilities() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_individual_actually_frees() {
        let alloc = MallocWrapper::new();
        let tag = alloc.get_tag().unwrap();
        let ptr = alloc.alloc(tag, 32, 8).unwrap();
        assert!(alloc.contains(tag, ptr));
        alloc.free(tag, ptr);
        assert!(!alloc.contains(tag, ptr));
    }

    #[test]
    fn release_tag_frees_remaining_allocations() {
        let alloc = MallocWrapper::new();
        let tag = alloc.get_tag().unwrap();
        for _ in 0..10 {
            alloc.alloc(tag, 16, 8).unwrap();
        }
        assert_eq!(alloc.tag_linear_size(tag), Some(160));
        alloc.release_tag(tag);
        assert_eq!(alloc.tag_linear_size(tag), None);
    }
}
