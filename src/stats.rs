//! Allocator statistics.
//!
//! Not named as a CORE responsibility by the design, but every strategy
//! file in the original implementation updates a counter of some kind, and
//! the teacher crate carries a dedicated `stats` module for exactly this.
//! Kept as plain atomics so the counters can be read without taking any
//! lock the rest of the engine doesn't already need.

use std::sync::atomic::{AtomicI64, Ordering};

/// A running count with a high-water mark, e.g. "bytes committed".
#[derive(Default)]
pub struct StatCount {
    pub allocated: AtomicI64,
    pub freed: AtomicI64,
    pub peak: AtomicI64,
    pub current: AtomicI64,
}

impl StatCount {
    pub fn increase(&self, amount: i64) {
        self.update(amount);
    }

    pub fn decrease(&self, amount: i64) {
        self.update(-amount);
    }

    fn update(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        let mut peak = self.peak.load(Ordering::Relaxed);
        while current > peak {
            match self
                .peak
                .compare_exchange_weak(peak, current, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
        if amount > 0 {
            self.allocated.fetch_add(amount, Ordering::Relaxed);
        } else {
            self.freed.fetch_add(-amount, Ordering::Relaxed);
        }
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }
}

/// A simple event counter with a running total, e.g. "bytes searched during
/// best-fit lookups".
#[derive(Default)]
pub struct StatCounter {
    pub total: AtomicI64,
    pub count: AtomicI64,
}

impl StatCounter {
    pub fn record(&self, amount: i64) {
        self.total.fetch_add(amount, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// All counters tracked across the router and its sub-allocators.
#[derive(Default)]
pub struct Stats {
    /// Bytes reserved from the OS virtual-memory interface.
    pub reserved: StatCount,
    /// Bytes currently committed (backed by physical pages).
    pub committed: StatCount,
    /// Bytes currently decommitted after having been committed.
    pub decommitted: StatCount,
    /// Bytes live across all engines.
    pub allocated: StatCount,
    /// Segregated-engine chunk checkouts.
    pub chunks: StatCount,
    /// Segregated-engine superchunk checkouts.
    pub superchunks: StatCount,
    /// Coalescing-engine node count (address tree size).
    pub coalesce_nodes: StatCount,
    /// Fixed-slot large-engine block checkouts.
    pub large_blocks: StatCount,
    /// Number of `find_bestfit` probes issued against the coalescing engine.
    pub coalesce_searches: StatCounter,
    /// Number of regions evicted from the commit-proxy LRU cache.
    pub regions_evicted: StatCounter,
}
