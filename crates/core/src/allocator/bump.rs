//! Monotonic bump arena: one implicit tag, free-individual is a no-op,
//! release-tag resets the pointer.
//!
//! Backed by `bumpalo`, matching this workspace's existing arena (the
//! thread-local bump pool used for strand-local string allocation).

use std::ptr::NonNull;

use bumpalo::Bump;
use parking_lot::Mutex;
use tracing::trace;

use super::{AllocatorDump, CapFlags, Tag, TAG_DEFAULT, TAG_NONE};
use crate::error::{CoreError, CoreResult};
use crate::Allocator;

struct State {
    bump: Bump,
    /// Every `(addr, len)` range handed out since the last reset, used only
    /// to answer `contains` without reaching into bumpalo's chunk internals.
    live_ranges: Vec<(usize, usize)>,
}

pub struct BumpArena {
    state: Mutex<State>,
}

impl BumpArena {
    pub fn new() -> Self {
        BumpArena {
            state: Mutex::new(State {
                bump: Bump::new(),
                live_ranges: Vec::new(),
            }),
        }
    }

    /// Construct with an initial reserved capacity, avoiding the first
    /// extent's growth churn when the final size is known up front.
    pub fn with_capacity(bytes: usize) -> Self {
        BumpArena {
            state: Mutex::new(State {
                bump: Bump::with_capacity(bytes),
                live_ranges: Vec::new(),
            }),
        }
    }
}

impl Default for BumpArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for BumpArena {
    fn capabilities(&self) -> CapFlags {
        CapFlags::HAS_CONTAINS
    }

    fn get_tag(&self) -> CoreResult<Tag> {
        Ok(TAG_DEFAULT)
    }

    fn release_tag(&self, tag: Tag) {
        if tag == TAG_NONE {
            return;
        }
        self.reset_tag(tag);
    }

    fn alloc(&self, tag: Tag, size: usize, align: usize) -> Option<NonNull<u8>> {
        if tag != TAG_DEFAULT || !align.is_power_of_two() {
            return None;
        }
        let layout = std::alloc::Layout::from_size_align(size, align).ok()?;
        let mut st = self.state.lock();
        let ptr = st.bump.try_alloc_layout(layout).ok()?;
        st.live_ranges.push((ptr.as_ptr() as usize, size));
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

    fn free(&self, _tag: Tag, _ptr: NonNull<u8>) {
        // Bump arenas never free individual allocations.
    }

    fn contains(&self, tag: Tag, ptr: NonNull<u8>) -> bool {
        if tag != TAG_DEFAULT {
            return false;
        }
        let addr = ptr.as_ptr() as usize;
        self.state
            .lock()
            .live_ranges
            .iter()
            .any(|&(base, len)| addr >= base && addr < base + len.max(1))
    }

    fn tag_linear_size(&self, tag: Tag) -> Option<usize> {
        if tag != TAG_DEFAULT {
            return None;
        }
        Some(self.state.lock().bump.allocated_bytes())
    }

    fn reset_tag(&self, tag: Tag) {
        if tag != TAG_DEFAULT {
            return;
        }
        let mut st = self.state.lock();
        st.bump.reset();
        st.live_ranges.clear();
        trace!(target: "fy_value_core::allocator", "bump arena reset");
    }

    fn dump(&self, tag: Tag) -> AllocatorDump {
        AllocatorDump {
            tag,
            extent_count: if tag == TAG_DEFAULT { 1 } else { 0 },
            live_bytes: self.tag_linear_size(tag).unwrap_or(0),
            caps: self.capabilities(),
        }
    }
}

/// Convenience used by callers that want a typed error instead of `None`
/// when a bump-arena `alloc` call fails.
pub fn alloc_or_oom(
    arena: &BumpArena,
    tag: Tag,
    size: usize,
    align: usize,
) -> CoreResult<NonNull<u8>> {
    arena
        .alloc(tag, size, align)
        .ok_or(CoreError::OutOfMemory { requested: size, align })
}
