//! A `RegionProvider` owns the backing address range for one
//! allocator: either a fixed heap buffer, or a reserved virtual range
//! that commits physical pages on demand as either stack advances.
use std::alloc::GlobalAlloc;
use std::alloc::Layout;
use std::alloc::System;
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::error::AllocError;
use crate::map;

/// Heap buffers only need malloc-grade alignment; payload alignment
/// is carved out of the region by the layout rules, not by the base.
const REGION_ALIGN: usize = 16;

pub(crate) trait RegionProvider: std::fmt::Debug {
    /// First address of the region.
    fn begin(&self) -> usize;

    /// One past the last address of the region.
    fn end(&self) -> usize;

    /// One past the highest committed front-side byte.  Equals
    /// `end()` when the whole region is committed up front.
    fn committed_front_end(&self) -> usize;

    /// Lowest committed back-side address.  Equals `begin()` when the
    /// whole region is committed up front.
    fn committed_back_start(&self) -> usize;

    /// Commits pages forward until `committed_front_end() >= limit`.
    /// A failed commit leaves the committed bounds where the last
    /// successful page put them, and the caller must reject the
    /// triggering allocation.
    fn ensure_front_committed(&mut self, limit: usize) -> Result<(), AllocError>;

    /// Commits pages backward until `committed_back_start() <= limit`.
    fn ensure_back_committed(&mut self, limit: usize) -> Result<(), AllocError>;
}

/// A single eagerly-acquired buffer of exactly `max_size` bytes.
#[derive(Debug)]
pub(crate) struct FixedRegion {
    base: NonNull<u8>,
    layout: Layout,
}

impl FixedRegion {
    pub fn new(max_size: usize) -> Result<Self, AllocError> {
        if max_size == 0 {
            log::error!("refusing to construct an empty region");
            return Err(AllocError::ConstructionFailed);
        }

        let layout = Layout::from_size_align(max_size, REGION_ALIGN).map_err(|_| {
            log::error!("cannot describe a {} byte region", max_size);
            AllocError::ConstructionFailed
        })?;

        let base = NonNull::new(unsafe { System.alloc(layout) }).ok_or_else(|| {
            log::error!("not enough memory for a {} byte region", max_size);
            AllocError::ConstructionFailed
        })?;

        log::debug!(
            "acquired fixed region [{:#x}, {:#x})",
            base.as_ptr() as usize,
            base.as_ptr() as usize + max_size
        );
        Ok(Self { base, layout })
    }
}

impl Drop for FixedRegion {
    fn drop(&mut self) {
        unsafe { System.dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl RegionProvider for FixedRegion {
    fn begin(&self) -> usize {
        self.base.as_ptr() as usize
    }

    fn end(&self) -> usize {
        self.begin() + self.layout.size()
    }

    fn committed_front_end(&self) -> usize {
        self.end()
    }

    fn committed_back_start(&self) -> usize {
        self.begin()
    }

    fn ensure_front_committed(&mut self, _limit: usize) -> Result<(), AllocError> {
        Ok(())
    }

    fn ensure_back_committed(&mut self, _limit: usize) -> Result<(), AllocError> {
        Ok(())
    }
}

/// A reserved virtual range with page-granular commits at both
/// extremities.  One page per side is committed at construction; the
/// space in between stays inaccessible until a stack grows into it.
#[derive(Debug)]
pub(crate) struct GrowingRegion {
    base: NonNull<c_void>,
    reserved: usize,
    page_size: usize,
    committed_front_end: usize,
    committed_back_start: usize,
}

impl GrowingRegion {
    /// Reserves `max(max_size, reservation)` bytes, rounded up to the
    /// page size, and commits the first and last page.  In a
    /// single-page reservation the two commits coincide; commits are
    /// idempotent, so that is fine.
    pub fn new(max_size: usize, reservation: usize) -> Result<Self, AllocError> {
        let page_size = map::page_size();
        let wanted = max_size.max(reservation);
        let reserved = crate::layout::align_up(wanted, page_size)
            .filter(|size| *size > 0)
            .ok_or_else(|| {
                log::error!("cannot reserve a {} byte range", wanted);
                AllocError::ConstructionFailed
            })?;

        let base = map::reserve_region(reserved).map_err(|errno| {
            log::error!("reserving {} bytes failed: errno={}", reserved, errno);
            AllocError::ConstructionFailed
        })?;
        let begin = base.as_ptr() as usize;
        log::debug!("reserved virtual range [{:#x}, {:#x})", begin, begin + reserved);

        let initial = map::commit_region(base, page_size).and_then(|()| {
            let last_page = NonNull::new((begin + reserved - page_size) as *mut c_void)
                .expect("page addresses in a reserved range are nonzero");
            map::commit_region(last_page, page_size)
        });
        if let Err(errno) = initial {
            log::error!("committing the initial pages failed: errno={}", errno);
            let _ = map::release_region(base, reserved);
            return Err(AllocError::ConstructionFailed);
        }

        Ok(Self {
            base,
            reserved,
            page_size,
            committed_front_end: begin + page_size,
            committed_back_start: begin + reserved - page_size,
        })
    }

    fn page_at(&self, address: usize) -> NonNull<c_void> {
        debug_assert_eq!(address % self.page_size, 0);
        NonNull::new(address as *mut c_void).expect("page addresses in a reserved range are nonzero")
    }
}

impl Drop for GrowingRegion {
    fn drop(&mut self) {
        let _ = map::release_region(self.base, self.reserved);
    }
}

impl RegionProvider for GrowingRegion {
    fn begin(&self) -> usize {
        self.base.as_ptr() as usize
    }

    fn end(&self) -> usize {
        self.begin() + self.reserved
    }

    fn committed_front_end(&self) -> usize {
        self.committed_front_end
    }

    fn committed_back_start(&self) -> usize {
        self.committed_back_start
    }

    fn ensure_front_committed(&mut self, limit: usize) -> Result<(), AllocError> {
        while self.committed_front_end < limit {
            // Never touch pages outside the reservation; a neighboring
            // mapping could be there.
            if self.committed_front_end == self.end() {
                log::error!("front stack ran out of reserved space at {:#x}", self.end());
                return Err(AllocError::OutOfMemory);
            }

            let page = self.page_at(self.committed_front_end);
            map::commit_region(page, self.page_size).map_err(|errno| {
                log::error!("committing a front page failed: errno={}", errno);
                AllocError::OutOfMemory
            })?;

            self.committed_front_end += self.page_size;
            log::trace!("committed front pages up to {:#x}", self.committed_front_end);
        }

        Ok(())
    }

    fn ensure_back_committed(&mut self, limit: usize) -> Result<(), AllocError> {
        while self.committed_back_start > limit {
            if self.committed_back_start == self.begin() {
                log::error!("back stack ran out of reserved space at {:#x}", self.begin());
                return Err(AllocError::OutOfMemory);
            }

            let page = self.page_at(self.committed_back_start - self.page_size);
            map::commit_region(page, self.page_size).map_err(|errno| {
                log::error!("committing a back page failed: errno={}", errno);
                AllocError::OutOfMemory
            })?;

            self.committed_back_start -= self.page_size;
            log::trace!("committed back pages down to {:#x}", self.committed_back_start);
        }

        Ok(())
    }
}
