//! Auto allocator: a scenario-driven selector that instantiates a concrete
//! policy at creation time (§6.4).

use std::ptr::NonNull;

use super::{
    AllocatorDump, BumpArena, CapFlags, DedupConfig, DedupStore, GrowableArena, GrowableConfig,
    MallocWrapper, Tag,
};
use crate::error::CoreResult;
use crate::Allocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioType {
    PerTagFree,
    PerTagFreeDedup,
    PerObjFree,
    PerObjFreeDedup,
    SingleLinear,
    SingleLinearDedup,
}

enum Inner {
    PerTagFree(GrowableArena),
    PerTagFreeDedup(DedupStore<GrowableArena>),
    PerObjFree(MallocWrapper),
    PerObjFreeDedup(DedupStore<MallocWrapper>),
    SingleLinear(BumpArena),
    SingleLinearDedup(DedupStore<BumpArena>),
}

pub struct AutoAllocator {
    inner: Inner,
}

impl AutoAllocator {
    pub fn new(scenario: ScenarioType, estimated_max_size: usize) -> Self {
        let inner = match scenario {
            ScenarioType::PerTagFree => Inner::PerTagFree(GrowableArena::new(GrowableConfig::default())),
            ScenarioType::PerTagFreeDedup => Inner::PerTagFreeDedup(DedupStore::new(
                GrowableArena::new(GrowableConfig::default()),
                DedupConfig::default(),
            )),
            ScenarioType::PerObjFree => Inner::PerObjFree(MallocWrapper::new()),
            ScenarioType::PerObjFreeDedup => {
                Inner::PerObjFreeDedup(DedupStore::new(MallocWrapper::new(), DedupConfig::default()))
            }
            ScenarioType::SingleLinear => {
                let cap = estimated_max_size.max(4096);
                Inner::SingleLinear(BumpArena::with_capacity(cap))
            }
            ScenarioType::SingleLinearDedup => {
                let cap = estimated_max_size.max(4096);
                Inner::SingleLinearDedup(DedupStore::new(
                    BumpArena::with_capacity(cap),
                    DedupConfig::default(),
                ))
            }
        };
        AutoAllocator { inner }
    }
}

macro_rules! dispatch {
    ($self:expr, $method:ident $(, $arg:expr)*) => {
        match &$self.inner {
            Inner::PerTagFree(a) => a.$method($($arg),*),
            Inner::PerTagFreeDedup(a) => a.$method($($arg),*),
            Inner::PerObjFree(a) => a.$method($($arg),*),
            Inner::PerObjFreeDedup(a) => a.$method($($arg),*),
            Inner::SingleLinear(a) => a.$method($($arg),*),
            Inner::SingleLinearDedup(a) => a.$method($($arg),*),
        }
    };
}

impl Allocator for AutoAllocator {
    fn capabilities(&self) -> CapFlags {
        dispatch!(self, capabilities)
    }

    fn get_tag(&self) -> CoreResult<Tag> {
        dispatch!(self, get_tag)
    }

    fn release_tag(&self, tag: Tag) {
        dispatch!(self, release_tag, tag)
    }

    fn alloc(&self, tag: Tag, size: usize, align: usize) -> Option<NonNull<u8>> {
        dispatch!(self, alloc, tag, size, align)
    }

    fn store(&self, tag: Tag, bytes: &[u8], align: usize) -> Option<NonNull<u8>> {
        dispatch!(self, store, tag, bytes, align)
    }

    fn lookup(&self, tag: Tag, bytes: &[u8], align: usize) -> Option<NonNull<u8>> {
        dispatch!(self, lookup, tag, bytes, align)
    }

    fn free(&self, tag: Tag, ptr: NonNull<u8>) {
        dispatch!(self, free, tag, ptr)
    }

    fn contains(&self, tag: Tag, ptr: NonNull<u8>) -> bool {
        dispatch!(self, contains, tag, ptr)
    }

    fn tag_linear_size(&self, tag: Tag) -> Option<usize> {
        dispatch!(self, tag_linear_size, tag)
    }

    fn tag_single_linear(&self, tag: Tag) -> Option<(NonNull<u8>, usize)> {
        dispatch!(self, tag_single_linear, tag)
    }

    fn trim_tag(&self, tag: Tag) {
        dispatch!(self, trim_tag, tag)
    }

    fn reset_tag(&self, tag: Tag) {
        dispatch!(self, reset_tag, tag)
    }

    fn dump(&self, tag: Tag) -> AllocatorDump {
        dispatch!(self, dump, tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_scenario_constructs_and_allocates() {
        for scenario in [
            ScenarioType::PerTagFree,
            ScenarioType::PerTagFreeDedup,
            ScenarioType::PerObjFree,
            ScenarioType::PerObjFreeDedup,
            ScenarioType::SingleLinear,
            ScenarioType::SingleLinearDedup,
        ] {
            let allocator = AutoAllocator::new(scenario, 4096);
            let tag = allocator.get_tag().unwrap();
            let ptr = allocator.store(tag, b"probe", 1).unwrap();
            assert!(allocator.contains(tag, ptr));
        }
    }

    #[test]
    fn dedup_scenarios_actually_dedup() {
        for scenario in [
            ScenarioType::PerTagFreeDedup,
            ScenarioType::PerObjFreeDedup,
            ScenarioType::SingleLinearDedup,
        ] {
            let allocator = AutoAllocator::new(scenario, 4096);
            let tag = allocator.get_tag().unwrap();
            let a = allocator.store(tag, b"duplicate-me", 1).unwrap();
            let b = allocator.store(tag, b"duplicate-me", 1).unwrap();
            assert_eq!(a, b);
        }
    }
}
