//! Page commit/decommit "regions-with-cache" proxy.
//!
//! Wraps any sub-allocator and makes sure every byte an allocation spans is
//! committed the instant `allocate` returns, and that committed pages are
//! decommitted once nothing overlapping them remains live - but only after
//! a bounded LRU grace period, so a free/alloc churn on one region doesn't
//! thrash OS page tables. Grounded on
//! `x_strategy_page_vcd_regions_cached.cpp`'s region refcounting and empty-
//! region cache.

use crate::list::{List, ListNode};
use crate::stats::StatCounter;
use crate::vmem::VirtualMemory;
use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::rc::Rc;

/// The uniform shape every content engine (`CoalesceEngine`, `LargeEngine`,
/// `SegregatedEngine`) presents to the commit proxy and the router.
pub trait SubAllocator {
    fn allocate(&mut self, size: u32, align: u32) -> Option<NonNull<u8>>;
    fn deallocate(&mut self, ptr: NonNull<u8>) -> u32;
}

pub struct CommitProxy<A: SubAllocator> {
    inner: A,
    vmem: Rc<dyn VirtualMemory>,
    base: NonNull<u8>,
    page_size: u32,
    region_size: u32,
    cache_cap: usize,
    refcounts: HashMap<u32, u16>,
    /// FIFO of recently-emptied regions, oldest at the head. Region
    /// numbers are sparse relative to the reservation's full region count,
    /// so the list's links live in a `HashMap` rather than a flat array.
    cached: List,
    cache_nodes: HashMap<u32, ListNode>,
    cached_set: HashSet<u32>,
    pub regions_evicted: StatCounter,
}

impl<A: SubAllocator> CommitProxy<A> {
    pub fn new(
        inner: A,
        vmem: Rc<dyn VirtualMemory>,
        base: NonNull<u8>,
        page_size: u32,
        region_size: u32,
        cache_cap: usize,
    ) -> Self {
        CommitProxy {
            inner,
            vmem,
            base,
            page_size,
            region_size,
            cache_cap,
            refcounts: HashMap::new(),
            cached: List::new(),
            cache_nodes: HashMap::new(),
            cached_set: HashSet::new(),
            regions_evicted: StatCounter::default(),
        }
    }

    fn region_of(&self, addr: usize) -> u32 {
        ((addr - self.base.as_ptr() as usize) / self.region_size as usize) as u32
    }

    fn region_addr(&self, region: u32) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(region as usize * self.region_size as usize)) }
    }

    fn pages_per_region(&self) -> u32 {
        self.region_size / self.page_size
    }

    /// Bump `region`'s refcount, committing it first if this is a 0->1
    /// transition and it isn't already resident via the cache. Returns
    /// `false` only when a fresh commit genuinely failed, in which case no
    /// refcount change is made.
    fn acquire(&mut self, region: u32) -> bool {
        if self.refcounts.contains_key(&region) {
            *self.refcounts.get_mut(&region).unwrap() += 1;
            return true;
        }
        if self.cached_set.remove(&region) {
            self.cached.remove(&mut self.cache_nodes, region);
        } else {
            let addr = self.region_addr(region);
            if !self.vmem.commit(addr, self.page_size, self.pages_per_region()) {
                return false;
            }
        }
        self.refcounts.insert(region, 1);
        true
    }

    fn release(&mut self, region: u32) {
        let count = self.refcounts.get_mut(&region).expect("release of uncommitted region");
        *count -= 1;
        if *count > 0 {
            return;
        }
        self.refcounts.remove(&region);
        self.cached.push_back(&mut self.cache_nodes, region);
        self.cached_set.insert(region);
        if self.cached.len() as usize > self.cache_cap {
            let evicted = self.cached.pop_front(&mut self.cache_nodes).unwrap();
            self.cached_set.remove(&evicted);
            let addr = self.region_addr(evicted);
            self.vmem.decommit(addr, self.page_size, self.pages_per_region());
            self.regions_evicted.record(1);
        }
    }

    fn spanned_regions(&self, addr: usize, size: u32) -> (u32, u32) {
        let start = self.region_of(addr);
        let end = self.region_of(addr + size as usize - 1);
        (start, end)
    }

    pub fn allocate(&mut self, size: u32, align: u32) -> Option<NonNull<u8>> {
        let ptr = self.inner.allocate(size, align)?;
        let (r0, r1) = self.spanned_regions(ptr.as_ptr() as usize, size);

        if !self.acquire(r0) {
            self.inner.deallocate(ptr);
            return None;
        }
        if r1 != r0 && !self.acquire(r1) {
            self.release(r0);
            self.inner.deallocate(ptr);
            return None;
        }
        Some(ptr)
    }

    pub fn deallocate(&mut self, ptr: NonNull<u8>) -> u32 {
        // The freed byte count is only known once the inner allocator has
        // located the allocation, so regions are released after the inner
        // call - this is safe because nothing else touches this proxy's
        // bookkeeping in between (single-threaded, no reentrancy).
        let addr_before = ptr.as_ptr() as usize;
        let freed = self.inner.deallocate(ptr);
        let (r0, r1) = self.spanned_regions(addr_before, freed);
        self.release(r0);
        if r1 != r0 {
            self.release(r1);
        }
        freed
    }

    pub fn committed_region_count(&self) -> usize {
        self.refcounts.len()
    }

    pub fn cached_region_count(&self) -> usize {
        self.cached.len() as usize
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut A {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmem::fake::FakeVmem;
    use std::cell::RefCell;

    struct BumpAllocator {
        base: NonNull<u8>,
        cursor: RefCell<usize>,
    }

    impl SubAllocator for BumpAllocator {
        fn allocate(&mut self, size: u32, _align: u32) -> Option<NonNull<u8>> {
            let mut cursor = self.cursor.borrow_mut();
            let addr = unsafe { self.base.as_ptr().add(*cursor) };
            *cursor += size as usize;
            Some(NonNull::new(addr).unwrap())
        }
        fn deallocate(&mut self, _ptr: NonNull<u8>) -> u32 {
            3 * 1024 * 1024
        }
    }

    #[test]
    fn reference_counted_regions_commit_and_cache() {
        let page_size = 64 * 1024;
        let region_size = 2 * 1024 * 1024;
        let vmem: Rc<dyn VirtualMemory> = Rc::new(FakeVmem::new(page_size));
        let (base, _) = vmem.reserve(64 * 1024 * 1024).unwrap();
        let inner = BumpAllocator { base, cursor: RefCell::new(0) };
        let mut proxy = CommitProxy::new(inner, vmem, base, page_size, region_size, 4);

        let p = proxy.allocate(3 * 1024 * 1024, 8).unwrap();
        assert_eq!(proxy.committed_region_count(), 2);

        proxy.deallocate(p);
        assert_eq!(proxy.committed_region_count(), 0);
        assert_eq!(proxy.cached_region_count(), 2);

        for _ in 0..5 {
            let p = proxy.allocate(3 * 1024 * 1024, 8).unwrap();
            proxy.deallocate(p);
        }
        assert!(proxy.regions_evicted.count.load(std::sync::atomic::Ordering::Relaxed) > 0);
    }
}
