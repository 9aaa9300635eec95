// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stack regions and the allocator seam.
//!
//! The runtime above decides where stacks come from; this core only asks
//! for a region of a given size and hands it back when done. Two
//! allocators ship here: `MmapAllocator` (page-granular, with an
//! inaccessible guard page below the usable range) for native stacks, and
//! `HeapAllocator` (global allocator, no guard page) for small frame stacks
//! and tests.

use std::alloc::{self, Layout};
use std::fmt;
use std::io;
use std::sync::Arc;

use crate::error::StackError;
use crate::memory::round_up;

/// A contiguous stack range. Stacks grow down from `hi` toward `lo`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    /// Lowest usable address.
    pub lo: usize,
    /// One past the highest usable address.
    pub hi: usize,
    /// Inaccessible bytes mapped directly below `lo`.
    pub guard: usize,
}

impl StackRegion {
    pub fn size(&self) -> usize {
        self.hi - self.lo
    }

    pub fn contains(&self, addr: usize) -> bool {
        (self.lo..self.hi).contains(&addr)
    }

    /// Initial stack pointer for a fresh stack.
    pub fn top(&self) -> usize {
        self.hi
    }
}

impl fmt::Debug for StackRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x}) guard {}", self.lo, self.hi, self.guard)
    }
}

/// Source of stack memory.
pub trait StackAllocator: Send + Sync {
    fn allocate_stack(&self, size: usize) -> Result<StackRegion, StackError>;

    /// Return a region obtained from `allocate_stack` on this allocator.
    fn free_stack(&self, region: StackRegion);
}

fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        4096
    } else {
        page as usize
    }
}

/// Anonymous private mappings with one guard page below each stack.
/// Sizes are rounded up to whole pages.
#[derive(Debug, Clone, Copy)]
pub struct MmapAllocator {
    page: usize,
}

impl MmapAllocator {
    pub fn new() -> Self {
        Self { page: page_size() }
    }

    pub fn page_size(&self) -> usize {
        self.page
    }
}

impl Default for MmapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl StackAllocator for MmapAllocator {
    fn allocate_stack(&self, size: usize) -> Result<StackRegion, StackError> {
        if size == 0 {
            return Err(StackError::ZeroSize);
        }
        let usable = round_up(size, self.page);
        let total = usable + self.page;
        // SAFETY: requesting a fresh anonymous mapping; no existing memory
        // is affected.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StackError::AllocFailed {
                size: usable,
                reason: io::Error::last_os_error().to_string(),
            });
        }
        // SAFETY: the first page belongs to the mapping just created.
        if unsafe { libc::mprotect(base, self.page, libc::PROT_NONE) } != 0 {
            let reason = io::Error::last_os_error().to_string();
            // SAFETY: unmapping exactly what was mapped above.
            unsafe { libc::munmap(base, total) };
            return Err(StackError::GuardFailed { size: usable, reason });
        }
        let lo = base as usize + self.page;
        Ok(StackRegion {
            lo,
            hi: lo + usable,
            guard: self.page,
        })
    }

    fn free_stack(&self, region: StackRegion) {
        let base = region.lo - region.guard;
        // SAFETY: `region` came from `allocate_stack`, which mapped exactly
        // `guard + size` bytes starting at `base`.
        let rc = unsafe { libc::munmap(base as *mut libc::c_void, region.size() + region.guard) };
        if rc != 0 {
            tracing::warn!(?region, error = %io::Error::last_os_error(), "munmap of stack failed");
        }
    }
}

/// Global-allocator stacks. No guard page; sizes must be multiples of 16.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapAllocator;

const HEAP_ALIGN: usize = 16;

impl StackAllocator for HeapAllocator {
    fn allocate_stack(&self, size: usize) -> Result<StackRegion, StackError> {
        if size == 0 {
            return Err(StackError::ZeroSize);
        }
        if size % HEAP_ALIGN != 0 {
            return Err(StackError::Unaligned {
                size,
                page: HEAP_ALIGN,
            });
        }
        let layout = Layout::from_size_align(size, HEAP_ALIGN).map_err(|e| StackError::AllocFailed {
            size,
            reason: e.to_string(),
        })?;
        // SAFETY: layout has non-zero size.
        let p = unsafe { alloc::alloc(layout) };
        if p.is_null() {
            return Err(StackError::AllocFailed {
                size,
                reason: "global allocator returned null".into(),
            });
        }
        let lo = p as usize;
        Ok(StackRegion {
            lo,
            hi: lo + size,
            guard: 0,
        })
    }

    fn free_stack(&self, region: StackRegion) {
        // SAFETY: `region` came from `allocate_stack` with this exact layout,
        // which was validated there.
        unsafe {
            let layout = Layout::from_size_align_unchecked(region.size(), HEAP_ALIGN);
            alloc::dealloc(region.lo as *mut u8, layout);
        }
    }
}

/// A region that returns itself to its allocator on drop.
pub struct OwnedStack {
    region: StackRegion,
    allocator: Arc<dyn StackAllocator>,
}

impl OwnedStack {
    pub fn new(allocator: Arc<dyn StackAllocator>, size: usize) -> Result<Self, StackError> {
        let region = allocator.allocate_stack(size)?;
        Ok(Self { region, allocator })
    }

    pub fn region(&self) -> StackRegion {
        self.region
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.region.contains(addr)
    }

    pub fn top(&self) -> usize {
        self.region.top()
    }
}

impl fmt::Debug for OwnedStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnedStack").field(&self.region).finish()
    }
}

impl Drop for OwnedStack {
    fn drop(&mut self) {
        self.allocator.free_stack(self.region);
    }
}
