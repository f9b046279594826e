//! A virtual-memory-backed, multi-strategy general purpose allocator core.
//!
//! Requests are routed by size to one of three content engines - a
//! segregated fixed-slot engine for small sizes, a coalescing free-list
//! engine for the midrange, and a fixed-slot large engine for
//! near-page-multiple sizes - each wrapped in a commit proxy that lazily
//! backs and unbacks the OS pages an allocation touches. See
//! [`router::VmAllocator`] for the entry point.

pub mod binmap;
pub mod bins;
pub mod coalesce;
pub mod commit;
pub mod config;
pub mod error;
pub mod heap;
pub mod large;
pub mod list;
pub mod rbtree;
pub mod router;
pub mod segregated;
pub mod stats;
pub mod vmem;

pub use config::Config;
pub use error::AllocError;
pub use router::VmAllocator;
pub use stats::Stats;
pub use vmem::VirtualMemory;
