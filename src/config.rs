//! Allocator configuration.
//!
//! Mirrors the fields the design calls out in its configuration structure:
//! the top-level address range, page size, the per-sub-allocator size
//! ranges (segregated and large engines are described by a table of
//! discrete bins; the coalescing engine owns one contiguous range instead),
//! and the commit proxy's region size / cache cap. `Config::default` is
//! tuned to the size ranges `x_virtual_main_allocator.cpp` wires up: small
//! fixed sizes through a segregated engine, a wide coalescing midrange, and
//! large near-page-multiple sizes through the fixed-slot engine.

/// Which content engine a bin or size range belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocatorId {
    Segregated,
    Coalesce,
    Large,
}

/// One linearly-stepped run of bin sizes within either the segregated or
/// the large engine's territory. `build_table` expands this into one `Bin`
/// per `lo, lo+step, lo+2*step, ..< hi`.
#[derive(Clone, Copy, Debug)]
pub struct BinRangeSpec {
    pub lo: u32,
    pub hi: u32,
    pub step: u32,
    pub allocator: AllocatorId,
    /// Segregated engine: allocations a single chunk holds for this bin.
    /// Large engine: slots a single block holds for this bin (driven by
    /// the bit-width `w` the allocation size implies).
    pub slots_per_unit: u16,
}

/// The coalescing engine's one contiguous range: no discrete bins, every
/// request within `[lo, hi)` is rounded up to a multiple of `step`.
#[derive(Clone, Copy, Debug)]
pub struct CoalesceRange {
    pub lo: u32,
    pub hi: u32,
    pub step: u32,
    pub min_alloc_size: u32,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub address_range: u64,
    pub page_size: u32,

    pub segregated: Vec<BinRangeSpec>,
    pub coalesce: CoalesceRange,
    pub large: Vec<BinRangeSpec>,

    /// Segregated engine: bytes backing one chunk.
    pub chunk_size: u32,
    /// Segregated engine: bytes backing one superchunk window.
    pub superchunk_size: u64,
    /// Large engine: bytes backing one block.
    pub block_size: u32,

    /// Commit proxy: bytes per tracked region.
    pub region_size: u32,
    /// Commit proxy: max recently-emptied regions retained before eviction.
    pub lru_cache_cap: usize,
}

impl Config {
    /// A configuration in the shape of the original source's
    /// `x_virtual_main_allocator.cpp` wiring: 8 B .. 8 KiB through the
    /// segregated engine (two linear phases), 8 KiB .. 640 KiB through the
    /// coalescing engine, and a handful of power-of-two large bins up to
    /// 32 MiB.
    pub fn default_tuning() -> Self {
        Config {
            address_range: 1 << 37, // 128 GiB
            page_size: 64 * 1024,

            segregated: vec![
                BinRangeSpec {
                    lo: 8,
                    hi: 1024,
                    step: 8,
                    allocator: AllocatorId::Segregated,
                    slots_per_unit: 256,
                },
                BinRangeSpec {
                    lo: 1024,
                    hi: 8 * 1024,
                    step: 64,
                    allocator: AllocatorId::Segregated,
                    slots_per_unit: 32,
                },
            ],

            coalesce: CoalesceRange {
                lo: 8 * 1024,
                hi: 640 * 1024,
                step: 256,
                min_alloc_size: 256,
            },

            large: vec![BinRangeSpec {
                lo: 1024 * 1024,
                hi: 32 * 1024 * 1024 + 1,
                step: 1024 * 1024,
                allocator: AllocatorId::Large,
                slots_per_unit: 0, // derived per-bin from bit-width w, see bins::build_table
            }],

            chunk_size: 64 * 1024,
            // Each segregated bin keeps its own dedicated superchunk (see
            // `segregated.rs`'s simplification note), so this must stay
            // small enough that `bin_count * superchunk_size` fits
            // comfortably inside the segregated engine's address window.
            superchunk_size: 8 * 1024 * 1024,
            block_size: 2 * 1024 * 1024,

            region_size: 2 * 1024 * 1024,
            lru_cache_cap: 4,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_tuning()
    }
}
