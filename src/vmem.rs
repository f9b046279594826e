//! The OS virtual-memory interface.
//!
//! This is the one external collaborator the core leans on directly: it
//! reserves a contiguous address range once, and commits/decommits pages
//! within it on demand. The interface intentionally tracks nothing about
//! what is currently committed - that bookkeeping lives in
//! [`crate::commit::CommitProxy`].

use std::ptr::NonNull;

/// A page-granular virtual memory reservation.
///
/// Implementors must guarantee that `reserve` returns a pointer aligned to
/// the page size it reports, that `commit`/`decommit` operate on ranges
/// that were returned by a prior `reserve`, and that a `release`d pointer
/// is never reused by a later `reserve` call for the lifetime of the
/// allocator.
pub trait VirtualMemory {
    /// Reserve `range` bytes of address space. Returns the base pointer and
    /// the OS page size used to align it. Memory is reserved but not
    /// committed - reads/writes before `commit` are undefined behaviour at
    /// the OS level.
    fn reserve(&self, range: u64) -> Option<(NonNull<u8>, u32)>;

    /// Return the entire reservation to the OS. Idempotent after the first
    /// call on a given `base`.
    fn release(&self, base: NonNull<u8>, range: u64);

    /// Back `page_count` pages starting at `addr` with physical memory.
    /// `addr` must be page aligned. Returns `false` only when the system
    /// genuinely cannot back the pages (e.g. out of physical memory).
    fn commit(&self, addr: NonNull<u8>, page_size: u32, page_count: u32) -> bool;

    /// Release the physical backing of `page_count` pages starting at
    /// `addr`. Subsequent reads of a decommitted page must return zero once
    /// recommitted. Decommit failure is never surfaced to callers - the
    /// region simply stays committed.
    fn decommit(&self, addr: NonNull<u8>, page_size: u32, page_count: u32);
}

#[cfg(unix)]
mod os_impl {
    use super::VirtualMemory;
    use std::ptr::NonNull;

    pub struct OsVirtualMemory;

    impl OsVirtualMemory {
        pub fn new() -> Self {
            OsVirtualMemory
        }

        fn page_size(&self) -> u32 {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u32 }
        }
    }

    impl Default for OsVirtualMemory {
        fn default() -> Self {
            Self::new()
        }
    }

    impl VirtualMemory for OsVirtualMemory {
        fn reserve(&self, range: u64) -> Option<(NonNull<u8>, u32)> {
            let page_size = self.page_size();
            let p = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    range as libc::size_t,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if p == libc::MAP_FAILED {
                log::warn!("mmap reserve failed: {}", errno::errno());
                return None;
            }
            NonNull::new(p as *mut u8).map(|ptr| (ptr, page_size))
        }

        fn release(&self, base: NonNull<u8>, range: u64) {
            let err = unsafe { libc::munmap(base.as_ptr() as *mut libc::c_void, range as libc::size_t) };
            if err != 0 {
                log::warn!("munmap failed: {}, base {:p}, range {}", errno::errno(), base.as_ptr(), range);
            }
        }

        fn commit(&self, addr: NonNull<u8>, page_size: u32, page_count: u32) -> bool {
            let size = page_size as libc::size_t * page_count as libc::size_t;
            let err = unsafe {
                libc::mprotect(addr.as_ptr() as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_WRITE)
            };
            if err != 0 {
                log::warn!("commit (mprotect) failed: {}, addr {:p}, size {}", errno::errno(), addr.as_ptr(), size);
                return false;
            }
            true
        }

        fn decommit(&self, addr: NonNull<u8>, page_size: u32, page_count: u32) {
            let size = page_size as libc::size_t * page_count as libc::size_t;
            unsafe {
                let err = libc::madvise(addr.as_ptr() as *mut libc::c_void, size, libc::MADV_DONTNEED);
                if err != 0 {
                    log::warn!("madvise DONTNEED failed: {}, addr {:p}, size {}", errno::errno(), addr.as_ptr(), size);
                }
                // Drop write access until the next commit re-establishes it,
                // so a stray write to decommitted memory faults instead of
                // silently keeping pages resident.
                libc::mprotect(addr.as_ptr() as *mut libc::c_void, size, libc::PROT_NONE);
            }
        }
    }
}

#[cfg(windows)]
mod os_impl {
    use super::VirtualMemory;
    use std::ptr::NonNull;
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};
    use winapi::um::sysinfoapi::GetSystemInfo;
    use winapi::um::winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE};

    pub struct OsVirtualMemory;

    impl OsVirtualMemory {
        pub fn new() -> Self {
            OsVirtualMemory
        }

        fn page_size(&self) -> u32 {
            unsafe {
                let mut si = std::mem::zeroed();
                GetSystemInfo(&mut si);
                si.dwPageSize
            }
        }
    }

    impl Default for OsVirtualMemory {
        fn default() -> Self {
            Self::new()
        }
    }

    impl VirtualMemory for OsVirtualMemory {
        fn reserve(&self, range: u64) -> Option<(NonNull<u8>, u32)> {
            let page_size = self.page_size();
            let p = unsafe { VirtualAlloc(std::ptr::null_mut(), range as usize, MEM_RESERVE, PAGE_READWRITE) };
            NonNull::new(p as *mut u8).map(|ptr| (ptr, page_size))
        }

        fn release(&self, base: NonNull<u8>, _range: u64) {
            unsafe {
                VirtualFree(base.as_ptr() as *mut _, 0, MEM_RELEASE);
            }
        }

        fn commit(&self, addr: NonNull<u8>, page_size: u32, page_count: u32) -> bool {
            let size = page_size as usize * page_count as usize;
            let p = unsafe { VirtualAlloc(addr.as_ptr() as *mut _, size, MEM_COMMIT, PAGE_READWRITE) };
            !p.is_null()
        }

        fn decommit(&self, addr: NonNull<u8>, page_size: u32, page_count: u32) {
            let size = page_size as usize * page_count as usize;
            unsafe {
                let mut old = 0;
                VirtualProtect(addr.as_ptr() as *mut _, size, PAGE_NOACCESS, &mut old);
                VirtualFree(addr.as_ptr() as *mut _, size, MEM_DECOMMIT);
            }
        }
    }
}

pub use os_impl::OsVirtualMemory;

/// An in-process, heap-backed stand-in for [`VirtualMemory`], used by the
/// crate's own tests and available to downstream callers that want to
/// exercise the allocator without touching real OS page tables.
///
/// `commit`/`decommit` are tracked but not enforced: reads and writes to
/// "decommitted" memory remain valid since the backing `Vec<u8>` is always
/// resident. Callers that want to catch commit/decommit protocol bugs
/// should instead assert against [`FakeVmem::committed_page_count`].
pub mod fake {
    use super::VirtualMemory;
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use std::ptr::NonNull;

    pub struct FakeVmem {
        page_size: u32,
        // Pages currently considered committed, keyed by page index from
        // the start of whichever reservation touched them. Reservations in
        // this test double never overlap in practice (one per test), so a
        // single set keyed by absolute page index is sufficient.
        committed: RefCell<BTreeSet<u64>>,
        backing: RefCell<Vec<Box<[u8]>>>,
    }

    impl FakeVmem {
        pub fn new(page_size: u32) -> Self {
            FakeVmem {
                page_size,
                committed: RefCell::new(BTreeSet::new()),
                backing: RefCell::new(Vec::new()),
            }
        }

        fn page_index(&self, base: NonNull<u8>, addr: NonNull<u8>) -> u64 {
            (addr.as_ptr() as u64 - base.as_ptr() as u64) / self.page_size as u64
        }

        pub fn committed_page_count(&self) -> usize {
            self.committed.borrow().len()
        }
    }

    impl VirtualMemory for FakeVmem {
        fn reserve(&self, range: u64) -> Option<(NonNull<u8>, u32)> {
            let mut buf = vec![0u8; range as usize].into_boxed_slice();
            let ptr = NonNull::new(buf.as_mut_ptr())?;
            self.backing.borrow_mut().push(buf);
            Some((ptr, self.page_size))
        }

        fn release(&self, _base: NonNull<u8>, _range: u64) {
            // Backing storage is dropped wholesale with the FakeVmem; a
            // real implementation would unmap just this reservation.
        }

        fn commit(&self, addr: NonNull<u8>, page_size: u32, page_count: u32) -> bool {
            // Reservations share one backing store in practice (one per
            // test), so we resolve the page index relative to the first
            // allocation's base.
            let base = self
                .backing
                .borrow()
                .first()
                .map(|b| b.as_ptr())
                .unwrap_or_else(|| addr.as_ptr());
            let base = NonNull::new(base as *mut u8).unwrap_or(addr);
            let start = self.page_index(base, addr);
            let mut committed = self.committed.borrow_mut();
            for i in 0..page_count as u64 {
                committed.insert(start + i);
            }
            let _ = page_size;
            true
        }

        fn decommit(&self, addr: NonNull<u8>, page_size: u32, page_count: u32) {
            let base = self
                .backing
                .borrow()
                .first()
                .map(|b| b.as_ptr())
                .unwrap_or_else(|| addr.as_ptr());
            let base = NonNull::new(base as *mut u8).unwrap_or(addr);
            let start = self.page_index(base, addr);
            let mut committed = self.committed.borrow_mut();
            for i in 0..page_count as u64 {
                committed.remove(&(start + i));
            }
            let _ = page_size;
        }
    }
}
