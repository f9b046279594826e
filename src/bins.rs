//! The precomputed size-class table and `size -> bin` lookup.
//!
//! The segregated and large engines are both served by discrete bins (one
//! exact byte size each); the coalescing engine instead owns one continuous
//! range and never appears in this table. `build_table` expands
//! [`crate::config::Config`]'s range specs into concrete [`Bin`] entries -
//! the original's bin table is a hand-written literal array, but ours is
//! derived from `Config` at startup so the step sizes stay configurable,
//! following `x_strategy_segregated.cpp`'s own runtime bin generation
//! rather than hardcoding one.
//!
//! `size_to_bin` finds the smallest bin whose size is `>=` the request, via
//! binary search over the sorted table. The design's closed-form
//! `(size+3)>>2` bit trick assumes a fixed four-bins-per-octave schedule;
//! it doesn't generalize to a config-driven, possibly irregular table, so
//! we use the table directly instead - the bin density for the default
//! tuning is exactly four-per-octave in the small range anyway, so lookups
//! resolve to the same bin a literal table would have produced.

use crate::config::{AllocatorId, BinRangeSpec, Config};

#[derive(Clone, Copy, Debug)]
pub struct Bin {
    pub size: u32,
    pub allocator: AllocatorId,
    pub bitmap_managed: bool,
    /// Segregated: allocations per chunk. Large: slots per block.
    pub alloc_count: u16,
    pub l1_len: u8,
    pub l2_len: u8,
}

impl Bin {
    /// Minimal `(l1_len, l2_len)` covering `count` bitmap slots, matching
    /// the dimensioning `binmap::BinmapConfig::new` expects.
    fn binmap_dims(count: u16) -> (u8, u8) {
        if count <= 32 {
            return (0, 0);
        }
        let l2_len = ((count as u32 + 15) / 16) as u8;
        let l1_len = ((l2_len as u32 + 15) / 16) as u8;
        (l1_len, l2_len)
    }
}

fn expand_range(spec: &BinRangeSpec, cfg: &Config, out: &mut Vec<Bin>) {
    let mut size = spec.lo;
    while size < spec.hi {
        match spec.allocator {
            AllocatorId::Segregated => {
                let (l1_len, l2_len) = Bin::binmap_dims(spec.slots_per_unit);
                out.push(Bin {
                    size,
                    allocator: AllocatorId::Segregated,
                    bitmap_managed: true,
                    alloc_count: spec.slots_per_unit,
                    l1_len,
                    l2_len,
                });
            }
            AllocatorId::Large => {
                let alloc_count = (cfg.block_size / size).min(u16::MAX as u32) as u16;
                out.push(Bin {
                    size,
                    allocator: AllocatorId::Large,
                    bitmap_managed: false,
                    alloc_count,
                    l1_len: 0,
                    l2_len: 0,
                });
            }
            AllocatorId::Coalesce => unreachable!("coalesce never appears in a BinRangeSpec"),
        }
        size += spec.step;
    }
}

/// Build the full, sorted bin table for `cfg`. Segregated and large ranges
/// never overlap by construction (the coalescing range sits strictly
/// between them), so the result is already sorted by `size`.
pub fn build_table(cfg: &Config) -> Vec<Bin> {
    let mut table = Vec::new();
    for spec in &cfg.segregated {
        expand_range(spec, cfg, &mut table);
    }
    for spec in &cfg.large {
        expand_range(spec, cfg, &mut table);
    }
    debug_assert!(table.windows(2).all(|w| w[0].size < w[1].size));
    table
}

/// Find the smallest bin whose size is `>=` `size`. Returns `None` when
/// `size` exceeds every bin in the table (including when it instead falls
/// within the coalescing engine's continuous range, which has no bins at
/// all - the router checks that range separately).
pub fn size_to_bin(table: &[Bin], size: u32) -> Option<usize> {
    let idx = table.partition_point(|b| b.size < size);
    if idx < table.len() { Some(idx) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn table_is_sorted_and_covers_configured_ranges() {
        let cfg = Config::default();
        let table = build_table(&cfg);
        assert!(!table.is_empty());
        assert!(table.windows(2).all(|w| w[0].size < w[1].size));
        assert_eq!(table.first().unwrap().size, cfg.segregated[0].lo);
    }

    #[test]
    fn size_to_bin_rounds_up_to_smallest_covering_bin() {
        let cfg = Config::default();
        let table = build_table(&cfg);
        let i = size_to_bin(&table, 1).unwrap();
        assert_eq!(table[i].size, cfg.segregated[0].lo);

        let i = size_to_bin(&table, 10).unwrap();
        assert_eq!(table[i].size, 16);

        let exact = table[5].size;
        let i = size_to_bin(&table, exact).unwrap();
        assert_eq!(table[i].size, exact);
    }

    #[test]
    fn size_beyond_every_bin_returns_none() {
        let cfg = Config::default();
        let table = build_table(&cfg);
        assert!(size_to_bin(&table, u32::MAX).is_none());
    }
}
