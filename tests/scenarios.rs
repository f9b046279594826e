//! End-to-end scenarios exercising each content engine and the router on
//! top of the others, using the in-process `FakeVmem` stand-in so the
//! suite never touches real OS page tables.

use std::ptr::NonNull;
use std::rc::Rc;

use std::cell::RefCell;

use vmalloc_core::binmap::{Binmap, BinmapConfig};
use vmalloc_core::bins::Bin;
use vmalloc_core::coalesce::CoalesceEngine;
use vmalloc_core::commit::{CommitProxy, SubAllocator};
use vmalloc_core::config::{AllocatorId, BinRangeSpec};
use vmalloc_core::large::LargeEngine;
use vmalloc_core::segregated::SegregatedEngine;
use vmalloc_core::vmem::fake::FakeVmem;
use vmalloc_core::vmem::VirtualMemory;
use vmalloc_core::{Config, VmAllocator};

fn leaked_buffer(len: u64) -> NonNull<u8> {
    let backing = vec![0u8; len as usize].into_boxed_slice();
    NonNull::new(Box::into_raw(backing) as *mut u8).unwrap()
}

/// Scenario 1: segregated fill and drain, 64-byte bin, 8192 allocs.
#[test]
fn segregated_fill_and_drain_8192_allocs() {
    let bin = Bin {
        size: 64,
        allocator: AllocatorId::Segregated,
        bitmap_managed: true,
        alloc_count: 8192,
        l1_len: 32,
        l2_len: 512,
    };
    let chunk_size = 64 * 8192;
    let superchunk_size = chunk_size as u64 * 2;
    let range = superchunk_size * 2;
    let base = leaked_buffer(range);
    let mut engine = SegregatedEngine::new(base, vec![bin], chunk_size, superchunk_size);

    let initial_chunks = engine.active_chunks_for_bin(0);
    let mut ptrs = Vec::with_capacity(8192);
    for _ in 0..8192 {
        ptrs.push(engine.allocate_bin(0).expect("slot available"));
    }

    let mut offsets: Vec<usize> = ptrs.iter().map(|p| p.as_ptr() as usize).collect();
    offsets.sort();
    offsets.dedup();
    assert_eq!(offsets.len(), 8192, "all 8192 pointers must be distinct");

    let seg_lo = base.as_ptr() as usize;
    let seg_hi = seg_lo + range as usize;
    for &p in &ptrs {
        let addr = p.as_ptr() as usize;
        assert!(addr >= seg_lo && addr < seg_hi, "pointer must land within the segregated sub-range");
    }

    for p in ptrs {
        engine.deallocate(p);
    }
    assert_eq!(engine.active_chunks_for_bin(0), initial_chunks);
}

/// Scenario 2: coalescing split-merge, 10 KiB allocations, engine spanning
/// [8 KiB .. 640 KiB) in steps of 256 bytes, 128 iterations.
#[test]
fn coalescing_split_merge_128_iterations() {
    let range: u64 = 640 * 1024 - 8 * 1024;
    let base = leaked_buffer(range);
    let mut engine = CoalesceEngine::new(base, range, 256, 256);

    let mut ptrs = Vec::with_capacity(128);
    for _ in 0..128 {
        ptrs.push(engine.allocate(10 * 1024, 8).expect("allocation"));
    }
    for &p in ptrs.iter().rev() {
        engine.deallocate(p);
    }

    assert_eq!(engine.chain_node_count(), 1, "address tree must contain exactly one node");
    assert_eq!(engine.largest_free(), range, "the lone node must cover the full engine range");
}

/// Scenario 3: large-engine packing with a 64 KiB `allocsize`, 1024
/// requests of 40 KiB each.
#[test]
fn large_engine_packs_sequentially() {
    let bin_size = 64 * 1024;
    let block_size = 2 * 1024 * 1024; // 32 slots/block at bin_size 64 KiB
    let blocks_needed = 1024 / (block_size / bin_size) + 1;
    let range = block_size as u64 * blocks_needed as u64;
    let base = leaked_buffer(range);
    let mut engine = LargeEngine::new(base, range, bin_size, block_size, 64 * 1024);

    let base_addr = base.as_ptr() as usize;
    let mut ptrs = Vec::with_capacity(1024);
    for i in 0..1024u64 {
        let p = engine.allocate_size(40 * 1024, 8).expect("slot available");
        let expected = base_addr + (i as usize) * bin_size as usize;
        assert_eq!(p.as_ptr() as usize, expected, "slot {} must pack without gaps", i);
        ptrs.push(p);
    }
    for p in ptrs {
        let freed = engine.deallocate(p);
        assert_eq!(freed, bin_size);
    }
}

/// A sub-allocator that never reuses an address, so each call hands the
/// commit proxy a fresh span of the reservation - standing in for "new
/// bytes keep getting touched" the way a live workload would, as opposed
/// to a single address cycling in and out of use.
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

/// Scenario 4: commit proxy reference counting with region size 2 MiB and
/// allocation size 3 MiB.
///
/// Every 3 MiB allocation spans two regions and (since the bump allocator
/// always advances) never touches the same bytes twice, so region indices
/// climb steadily: {0,1}, {1,2}, {3,4}, {4,5}, {6,7}, {7,8} across the
/// initial allocation and the five further ones. With a cache capacity of
/// 7, the cache doesn't overflow until the seventh region is freed; by the
/// time the fifth further allocation's regions are released, exactly the
/// original two regions (0 and 1) have aged out and been decommitted.
#[test]
fn commit_proxy_reference_counting_and_eviction() {
    let page_size = 64 * 1024;
    let region_size = 2 * 1024 * 1024;
    let vmem: Rc<dyn VirtualMemory> = Rc::new(FakeVmem::new(page_size));
    let (base, _) = vmem.reserve(64 * 1024 * 1024).unwrap();

    let inner = BumpAllocator { base, cursor: RefCell::new(0) };
    let mut proxy = CommitProxy::new(inner, vmem, base, page_size, region_size, 7);

    let p = proxy.allocate(3 * 1024 * 1024, 8).unwrap();
    assert_eq!(proxy.committed_region_count(), 2);

    proxy.deallocate(p);
    assert_eq!(proxy.committed_region_count(), 0);
    assert_eq!(proxy.cached_region_count(), 2, "both regions should sit in the cache, not yet decommitted");
    assert_eq!(proxy.regions_evicted.count.load(std::sync::atomic::Ordering::Relaxed), 0);

    for _ in 0..5 {
        let p = proxy.allocate(3 * 1024 * 1024, 8).unwrap();
        proxy.deallocate(p);
    }
    assert_eq!(proxy.regions_evicted.count.load(std::sync::atomic::Ordering::Relaxed), 2);
}

/// Scenario 5: two-level binmap find-and-set stress with count = 8192.
#[test]
fn binmap_find_and_set_stress() {
    let cfg = BinmapConfig::new(32, 512, 8192);
    let mut map = Binmap::new(cfg);

    for expected in 0..8192u32 {
        assert_eq!(map.find_and_set(&cfg), Some(expected));
    }
    assert!(map.find_and_set(&cfg).is_none());

    map.clear(&cfg, 100);
    assert_eq!(map.find_and_set(&cfg), Some(100));

    map.clear(&cfg, 4096);
    assert_eq!(map.find_and_set(&cfg), Some(4096));
}

/// Scenario 6: router dispatch coverage - every bin in the table must
/// round-trip through the router into its declared sub-range.
#[test]
fn router_dispatch_covers_every_bin() {
    let mut config = Config::default_tuning();
    // Shrink both bin tables so the test doesn't need gigabytes of address
    // space reserved by `FakeVmem`'s real backing `Vec<u8>` - the default
    // tuning's ~239 segregated bins, each claiming a dedicated superchunk,
    // would alone need far more than fits in a quarter of 256 MiB.
    config.address_range = 256 * 1024 * 1024;
    config.segregated = vec![BinRangeSpec {
        lo: 8,
        hi: 64,
        step: 8,
        allocator: AllocatorId::Segregated,
        slots_per_unit: 64,
    }];
    config.large = vec![BinRangeSpec {
        lo: 1024 * 1024,
        hi: 2 * 1024 * 1024 + 1,
        step: 1024 * 1024,
        allocator: AllocatorId::Large,
        slots_per_unit: 0,
    }];

    let vmem: Box<dyn VirtualMemory> = Box::new(FakeVmem::new(64 * 1024));
    let mut allocator = VmAllocator::new(config, vmem).expect("reservation succeeds");

    let sizes: Vec<(u32, AllocatorId)> = allocator
        .bin_table()
        .iter()
        .map(|b| (b.size, b.allocator))
        .collect();

    for (size, allocator_id) in sizes {
        let p = allocator.allocate(size, 1).unwrap_or_else(|| panic!("allocate bin size {} failed", size));
        assert_eq!(allocator.locate(p), allocator_id, "bin size {} landed in the wrong sub-range", size);
        let freed = allocator.deallocate(p);
        assert_eq!(freed, size, "bin size {} must report exactly its own size on free", size);
    }

    allocator.release();
}
