//! Growable arena: a chain of extents per tag, each grown in place via
//! `mremap(2)` when available, falling back to allocate-and-link.
//!
//! `mremap` is Linux-specific; on other targets (or when `arena_type` is
//! pinned to `malloc`) growth falls back to allocate-new, copy, release-old
//! — the same externally observable contract, with a weaker "in place"
//! guarantee.

use std::collections::HashMap;
use std::ptr::NonNull;

use parking_lot::Mutex;
use tracing::{trace, warn};

use super::{AllocatorDump, CapFlags, Tag, TAG_NONE};
use crate::error::CoreResult;
use crate::Allocator;

/// How a single extent's backing memory is obtained and grown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaType {
    /// `mmap`/`mremap` on Linux, allocate-and-copy elsewhere.
    Default,
    /// Never touches the OS map; extents are `malloc`ed (grown via
    /// allocate-new, copy, free-old).
    Malloc,
    /// Force `mmap`-backed extents even where `mremap` growth isn't
    /// available (growth still falls back to allocate-and-copy).
    Mmap,
}

#[derive(Debug, Clone, Copy)]
pub struct GrowableConfig {
    /// Allocations at or above this size get their own dedicated extent
    /// rather than participating in the grow chain.
    pub big_alloc_threshold: usize,
    /// An extent whose occupancy ratio falls at or below this fraction is a
    /// `trim_tag` candidate.
    pub empty_threshold: f32,
    /// Smallest extent ever created.
    pub minimum_arena_size: usize,
    /// Growth multiplier applied to the requesting size when a new extent
    /// is needed (must be > 1.0).
    pub grow_ratio: f32,
    /// When trimming, shrink a mostly-empty extent down to
    /// `used as f32 * balloon_ratio` instead of exactly `used`, to absorb
    /// a little churn without immediately re-growing.
    pub balloon_ratio: f32,
    pub arena_type: ArenaType,
}

impl Default for GrowableConfig {
    fn default() -> Self {
        GrowableConfig {
            big_alloc_threshold: 64 * 1024,
            empty_threshold: 0.25,
            minimum_arena_size: 4096,
            grow_ratio: 1.5,
            balloon_ratio: 1.1,
            arena_type: ArenaType::Default,
        }
    }
}

struct Extent {
    ptr: *mut u8,
    cap: usize,
    used: usize,
    /// Extents obtained via the OS map vs. `malloc`, since they must be
    /// released with the matching deallocator.
    mapped: bool,
    /// Large allocations get a dedicated, non-growing extent.
    dedicated: bool,
}

// SAFETY: `Extent` is only ever touched through `GrowableArena`'s mutex.
unsafe impl Send for Extent {}

struct TagState {
    extents: Vec<Extent>,
}

pub struct GrowableArena {
    cfg: GrowableConfig,
    next_tag: Mutex<Tag>,
    tags: Mutex<HashMap<Tag, TagState>>,
}

impl GrowableArena {
    pub fn new(cfg: GrowableConfig) -> Self {
        GrowableArena {
            cfg,
            next_tag: Mutex::new(0),
            tags: Mutex::new(HashMap::new()),
        }
    }

    fn new_region(&self, size: usize) -> Option<(*mut u8, bool)> {
        match self.cfg.arena_type {
            ArenaType::Malloc => {
                let layout = std::alloc::Layout::from_size_align(size, 16).ok()?;
                // SAFETY: layout has non-zero size by construction below.
                let ptr = unsafe { std::alloc::alloc(layout) };
                if ptr.is_null() { None } else { Some((ptr, false)) }
            }
            ArenaType::Default | ArenaType::Mmap => unsafe {
                let ptr = libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                );
                if ptr == libc::MAP_FAILED {
                    None
                } else {
                    Some((ptr.cast::<u8>(), true))
                }
            },
        }
    }

    fn release_region(&self, ptr: *mut u8, cap: usize, mapped: bool) {
        if mapped {
            // SAFETY: `ptr`/`cap` came from a prior successful `mmap` of
            // the same size in `new_region`.
            unsafe {
                libc::munmap(ptr.cast::<libc::c_void>(), cap);
            }
        } else {
            // SAFETY: matches the `alloc(Layout::from_size_align(cap, 16))`
            // used in `new_region`'s malloc branch.
            let layout = std::alloc::Layout::from_size_align(cap, 16).unwrap();
            unsafe {
                std::alloc::dealloc(ptr, layout);
            }
        }
    }

    /// Attempt to grow `extent` in place to `new_cap`. Returns `true` on
    /// success (the extent's `ptr`/`cap` are updated).
    fn try_grow_in_place(&self, extent: &mut Extent, new_cap: usize) -> bool {
        if extent.dedicated {
            return false;
        }
        #[cfg(target_os = "linux")]
        {
            if extent.mapped {
                // SAFETY: `extent.ptr` is a live mapping of `extent.cap`
                // bytes from a prior `mmap`/`mremap` call.
                let new_ptr = unsafe {
                    libc::mremap(
                        extent.ptr.cast::<libc::c_void>(),
                        extent.cap,
                        new_cap,
                        libc::MREMAP_MAYMOVE,
                    )
                };
                if new_ptr != libc::MAP_FAILED {
                    extent.ptr = new_ptr.cast::<u8>();
                    extent.cap = new_cap;
                    return true;
                }
                warn!(target: "fy_value_core::allocator", old = extent.cap, new = new_cap, "mremap growth failed, falling back");
                return false;
            }
        }
        false
    }

    fn grow_by_copy(&self, extent: &mut Extent, new_cap: usize) -> bool {
        let Some((new_ptr, mapped)) = self.new_region(new_cap) else {
            return false;
        };
        // SAFETY: both regions are at least `extent.used` bytes, which is
        // <= both `extent.cap` and `new_cap`.
        unsafe {
            std::ptr::copy_nonoverlapping(extent.ptr, new_ptr, extent.used);
        }
        self.release_region(extent.ptr, extent.cap, extent.mapped);
        extent.ptr = new_ptr;
        extent.cap = new_cap;
        extent.mapped = mapped;
        true
    }
}

impl Allocator for GrowableArena {
    fn capabilities(&self) -> CapFlags {
        CapFlags::CAN_FREE_TAG | CapFlags::HAS_CONTAINS | CapFlags::HAS_TAGS
    }

    fn get_tag(&self) -> CoreResult<Tag> {
        let mut next = self.next_tag.lock();
        let tag = *next;
        *next += 1;
        self.tags.lock().insert(tag, TagState { extents: Vec::new() });
        Ok(tag)
    }

    fn release_tag(&self, tag: Tag) {
        if tag == TAG_NONE {
            return;
        }
        if let Some(state) = self.tags.lock().remove(&tag) {
            for extent in state.extents {
                self.release_region(extent.ptr, extent.cap, extent.mapped);
            }
        }
    }

    fn alloc(&self, tag: Tag, size: usize, align: usize) -> Option<NonNull<u8>> {
        if !align.is_power_of_two() {
            return None;
        }
        let mut tags = self.tags.lock();
        let state = tags.get_mut(&tag)?;

        if size >= self.cfg.big_alloc_threshold {
            let (ptr, mapped) = self.new_region(size)?;
            state.extents.push(Extent { ptr, cap: size, used: size, mapped, dedicated: true });
            return NonNull::new(ptr);
        }

        if let Some(extent) = state.extents.last_mut().filter(|e| !e.dedicated) {
            let aligned_used = align_up(extent.used, align);
            if aligned_used + size <= extent.cap {
                // SAFETY: computed offset is within the extent's capacity.
                let ptr = unsafe { extent.ptr.add(aligned_used) };
                extent.used = aligned_used + size;
                return NonNull::new(ptr);
            }
            let needed = aligned_used + size;
            let grown = (needed as f32 * self.cfg.grow_ratio).ceil() as usize;
            let new_cap = grown.max(self.cfg.minimum_arena_size);
            if self.try_grow_in_place(extent, new_cap) || self.grow_by_copy(extent, new_cap) {
                trace!(target: "fy_value_core::allocator", tag, new_cap, "extent grown");
                // SAFETY: see above; extent.cap now >= needed.
                let ptr = unsafe { extent.ptr.add(aligned_used) };
                extent.used = aligned_used + size;
                return NonNull::new(ptr);
            }
            // Growth failed: demote to the full list, start a fresh extent.
        }

        let new_cap = ((size as f32) * self.cfg.grow_ratio)
            .ceil()
            .max(self.cfg.minimum_arena_size as f32) as usize;
        let (ptr, mapped) = self.new_region(new_cap)?;
        state.extents.push(Extent { ptr, cap: new_cap, used: size, mapped, dedicated: false });
        NonNull::new(ptr)
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
        // Individual free is not supported by growable arenas.
    }

    fn contains(&self, tag: Tag, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let tags = self.tags.lock();
        let Some(state) = tags.get(&tag) else { return false };
        state
            .extents
            .iter()
            .any(|e| addr >= e.ptr as usize && addr < e.ptr as usize + e.cap)
    }

    fn tag_linear_size(&self, tag: Tag) -> Option<usize> {
        let tags = self.tags.lock();
        let state = tags.get(&tag)?;
        Some(state.extents.iter().map(|e| e.used).sum())
    }

    fn tag_single_linear(&self, tag: Tag) -> Option<(NonNull<u8>, usize)> {
        let tags = self.tags.lock();
        let state = tags.get(&tag)?;
        if state.extents.len() == 1 {
            let e = &state.extents[0];
            Some((NonNull::new(e.ptr)?, e.used))
        } else {
            None
        }
    }

    fn trim_tag(&self, tag: Tag) {
        let mut tags = self.tags.lock();
        let Some(state) = tags.get_mut(&tag) else { return };
        for extent in state.extents.iter_mut().filter(|e| !e.dedicated) {
            if extent.cap == 0 {
                continue;
            }
            let occupancy = extent.used as f32 / extent.cap as f32;
            if occupancy <= self.cfg.empty_threshold {
                let target = ((extent.used as f32) * self.cfg.balloon_ratio).ceil() as usize;
                let target = target.max(self.cfg.minimum_arena_size).min(extent.cap);
                if target < extent.cap {
                    self.try_grow_in_place(extent, target);
                }
            }
        }
    }

    fn reset_tag(&self, tag: Tag) {
        let mut tags = self.tags.lock();
        if let Some(state) = tags.get_mut(&tag) {
            for extent in &mut state.extents {
                extent.used = 0;
            }
            // Keep only the first extent; release the rest like a fresh tag.
            if state.extents.len() > 1 {
                let extras: Vec<Extent> = state.extents.drain(1..).collect();
                drop(tags);
                for extent in extras {
                    self.release_region(extent.ptr, extent.cap, extent.mapped);
                }
            }
        }
    }

    fn dump(&self, tag: Tag) -> AllocatorDump {
        let tags = self.tags.lock();
        let (extent_count, live_bytes) = tags
            .get(&tag)
            .map(|s| (s.extents.len(), s.extents.iter().map(|e| e.used).sum()))
            .unwrap_or((0, 0));
        AllocatorDump { tag, extent_count, live_bytes, caps: self.capabilities() }
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}
