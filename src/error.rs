//! Error kinds surfaced by the allocator core.
//!
//! Per the design, out-of-memory conditions are reported through plain
//! `Option::None` return values at the `allocate` boundary - there is no
//! exception path. `AllocError` only exists for the one call that can fail
//! before any allocator state exists to roll back: reserving the address
//! range itself.

use core::fmt;

/// Failure reasons for [`crate::router::VmAllocator::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The OS virtual-memory interface could not reserve the requested
    /// address range.
    ReserveFailed,
    /// The OS virtual-memory interface could not commit the pages backing
    /// the internal bookkeeping heap.
    CommitFailed,
    /// A `Config` field was internally inconsistent (e.g. a sub-allocator's
    /// size range does not divide evenly by its step).
    InvalidConfig(&'static str),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::ReserveFailed => write!(f, "failed to reserve address range from the OS"),
            AllocError::CommitFailed => write!(f, "failed to commit pages for internal bookkeeping"),
            AllocError::InvalidConfig(msg) => write!(f, "invalid allocator configuration: {}", msg),
        }
    }
}

impl std::error::Error for AllocError {}
