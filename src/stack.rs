//! The allocator core: two last-in-first-out stacks sharing one
//! contiguous region.  The front stack grows up from the low address,
//! the back stack down from the high address, and the space between
//! the two cursors is whatever neither side has claimed yet.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ffi::c_void;
use std::ptr;
use std::ptr::NonNull;

use static_assertions::assert_not_impl_any;

use crate::error::AllocError;
use crate::layout;
use crate::layout::Header;
use crate::region::FixedRegion;
use crate::region::GrowingRegion;
use crate::region::RegionProvider;

/// Address space reserved by the on-demand variant when `max_size`
/// asks for less.
pub const DEFAULT_RESERVATION: usize = 1 << 30;

/// How an allocator acquires its backing memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrowthPolicy {
    /// One buffer of exactly `max_size` bytes, acquired up front.
    Fixed,
    /// Reserve `max(max_size, reservation)` bytes of address space
    /// and commit physical pages only as either stack advances.
    OnDemand { reservation: usize },
}

/// Construction options for a `DoubleEndedStackAllocator`.
#[derive(Clone, Copy, Debug)]
pub struct AllocatorConfig {
    pub max_size: usize,
    pub growth: GrowthPolicy,
}

/// Two LIFO allocation stacks over one region.
///
/// `allocate` pushes on the front stack, `allocate_back` on the back
/// stack, and each side only frees its most recent block.  Every
/// block is bracketed by canary words and carries a hidden header
/// just below the payload, so frees validate their pointer and
/// out-of-bounds writes are detected.
pub struct DoubleEndedStackAllocator {
    region: Box<dyn RegionProvider>,
    /// Payload address of the most recent front block, or `begin()`
    /// when the front stack is empty.
    front: usize,
    /// Payload address of the most recent back block, or `end()` when
    /// the back stack is empty.
    back: usize,
}

// Single-threaded by contract; callers who must share an allocator
// wrap it in their own exclusion.
assert_not_impl_any!(DoubleEndedStackAllocator: Send, Sync);

impl DoubleEndedStackAllocator {
    /// Attempts to construct an allocator over a fresh region.
    ///
    /// # Errors
    ///
    /// Returns `ConstructionFailed` when the region cannot be
    /// acquired; no allocator exists afterward.
    pub fn new(config: AllocatorConfig) -> Result<Self, AllocError> {
        let region: Box<dyn RegionProvider> = match config.growth {
            GrowthPolicy::Fixed => Box::new(FixedRegion::new(config.max_size)?),
            GrowthPolicy::OnDemand { reservation } => {
                Box::new(GrowingRegion::new(config.max_size, reservation)?)
            }
        };

        let front = region.begin();
        let back = region.end();
        log::debug!("constructed allocator over [{:#x}, {:#x})", front, back);
        Ok(Self {
            region,
            front,
            back,
        })
    }

    /// Constructs an allocator over a single `max_size` byte buffer.
    pub fn fixed(max_size: usize) -> Result<Self, AllocError> {
        Self::new(AllocatorConfig {
            max_size,
            growth: GrowthPolicy::Fixed,
        })
    }

    /// Constructs a growing allocator: at least `DEFAULT_RESERVATION`
    /// bytes of reserved address space, committed page by page as the
    /// stacks advance.
    pub fn growing(max_size: usize) -> Result<Self, AllocError> {
        Self::new(AllocatorConfig {
            max_size,
            growth: GrowthPolicy::OnDemand {
                reservation: DEFAULT_RESERVATION,
            },
        })
    }

    /// First address of the region.
    #[inline]
    pub fn begin(&self) -> usize {
        self.region.begin()
    }

    /// Top of the front stack: the most recent front payload, or
    /// `begin()` when that stack is empty.
    #[inline]
    pub fn front(&self) -> usize {
        self.front
    }

    /// One past the last address of the region.
    #[inline]
    pub fn end(&self) -> usize {
        self.region.end()
    }

    /// Top of the back stack: the most recent back payload, or
    /// `end()` when that stack is empty.
    #[inline]
    pub fn back(&self) -> usize {
        self.back
    }

    /// Width of one canary; zero when canaries are compiled out.
    pub const fn canary_size() -> usize {
        layout::CANARY_SIZE
    }

    /// Width of the hidden per-block header.
    pub const fn header_size() -> usize {
        layout::HEADER_SIZE
    }

    /// Pushes a `size` byte block on the front stack and returns its
    /// payload address.
    ///
    /// # Errors
    ///
    /// `BadAlignment` and `BadSize` for invalid requests, `Overlap`
    /// when the block would run into the back stack, `OutOfMemory`
    /// when the region cannot commit the backing pages.  Rejected
    /// calls leave the allocator untouched.
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().as_ptr() as usize % align == 0,
              "Payloads honor the requested alignment.")]
    #[ensures(ret.is_ok() -> self.front() == ret.as_ref().unwrap().as_ptr() as usize,
              "The new payload becomes the front cursor.")]
    #[ensures(ret.is_ok() -> old(self.front()) < self.front(),
              "Front payloads are handed out in increasing order.")]
    #[ensures(ret.is_err() -> self.front() == old(self.front()) && self.back() == old(self.back()),
              "Rejected allocations leave the cursors untouched.")]
    #[ensures(self.begin() <= self.front() && self.front() <= self.back() && self.back() <= self.end(),
              "Cursors stay ordered inside the region.")]
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<c_void>, AllocError> {
        self.check_request(size, align)?;

        let prev_size = if self.front == self.begin() {
            0
        } else {
            self.header_at(self.front).size
        };
        let payload = layout::next_front_payload(self.front, self.begin(), prev_size, align)
            .ok_or_else(|| out_of_range("allocate", size))?;
        let limit =
            layout::block_high(payload, size).ok_or_else(|| out_of_range("allocate", size))?;

        if limit > self.region.committed_front_end() {
            self.region.ensure_front_committed(limit)?;
        }

        // The block may not run into the back stack: its ceiling is
        // the back cursor itself while that stack is empty, and the
        // lowest byte of the back stack's top block otherwise.
        let ceiling = if self.back == self.end() {
            self.back
        } else {
            layout::block_low(self.back)
        };
        if limit >= ceiling {
            log::error!(
                "allocate: {} bytes at {:#x} would overlap the back stack at {:#x}",
                size,
                payload,
                ceiling
            );
            return Err(AllocError::Overlap);
        }

        let header = Header {
            prev: self.front,
            size,
        };
        unsafe {
            self.write_canaries(payload, size);
            self.write_header(payload, header);
        }
        self.front = payload;

        log::trace!(
            "allocate: {} bytes at [{:#x}, {:#x})",
            size,
            payload,
            payload + size
        );
        Ok(NonNull::new(payload as *mut c_void).expect("payloads sit above the region base"))
    }

    /// Pushes a `size` byte block on the back stack; the mirror of
    /// `allocate`, growing down from the high address.
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().as_ptr() as usize % align == 0,
              "Payloads honor the requested alignment.")]
    #[ensures(ret.is_ok() -> self.back() == ret.as_ref().unwrap().as_ptr() as usize,
              "The new payload becomes the back cursor.")]
    #[ensures(ret.is_ok() -> self.back() < old(self.back()),
              "Back payloads are handed out in decreasing order.")]
    #[ensures(ret.is_err() -> self.front() == old(self.front()) && self.back() == old(self.back()),
              "Rejected allocations leave the cursors untouched.")]
    #[ensures(self.begin() <= self.front() && self.front() <= self.back() && self.back() <= self.end(),
              "Cursors stay ordered inside the region.")]
    pub fn allocate_back(
        &mut self,
        size: usize,
        align: usize,
    ) -> Result<NonNull<c_void>, AllocError> {
        self.check_request(size, align)?;

        let payload = layout::next_back_payload(self.back, self.end(), size, align)
            .ok_or_else(|| out_of_range("allocate_back", size))?;
        let low = payload
            .checked_sub(layout::HEADER_SIZE + layout::CANARY_SIZE)
            .ok_or_else(|| out_of_range("allocate_back", size))?;

        if low < self.region.committed_back_start() {
            self.region.ensure_back_committed(low)?;
        }

        // The block may not run into the front stack: its floor is
        // the front cursor itself while that stack is empty, and one
        // past the highest byte of the front stack's top block
        // otherwise.
        let floor = if self.front == self.begin() {
            self.front
        } else {
            let front_size = self.header_at(self.front).size;
            layout::block_high(self.front, front_size).expect("live blocks lie inside the region")
        };
        if low <= floor {
            log::error!(
                "allocate_back: {} bytes at {:#x} would overlap the front stack at {:#x}",
                size,
                payload,
                floor
            );
            return Err(AllocError::Overlap);
        }

        let header = Header {
            prev: self.back,
            size,
        };
        unsafe {
            self.write_canaries(payload, size);
            self.write_header(payload, header);
        }
        self.back = payload;

        log::trace!(
            "allocate_back: {} bytes at [{:#x}, {:#x})",
            size,
            payload,
            payload + size
        );
        Ok(NonNull::new(payload as *mut c_void).expect("payloads sit above the region base"))
    }

    /// Frees the top of the front stack.  `ptr` must be the address
    /// returned by the most recent unfreed `allocate` call.
    ///
    /// On `CanaryCorruption` the block is popped anyway: the report
    /// is diagnostic, and the memory was going away either way.
    #[ensures(ret == Err(AllocError::BadPointer) -> self.front() == old(self.front()),
              "Rejected frees leave the cursor untouched.")]
    #[ensures(ret == Err(AllocError::LifoViolation) -> self.front() == old(self.front()),
              "Rejected frees leave the cursor untouched.")]
    #[ensures(ret.is_ok() -> self.front() < old(self.front()),
              "A freed front block rewinds the cursor toward begin.")]
    #[ensures(self.back() == old(self.back()),
              "Front frees never move the back cursor.")]
    pub fn free(&mut self, ptr: *mut c_void) -> Result<(), AllocError> {
        self.check_pointer("free", ptr)?;

        let address = ptr as usize;
        if self.front == self.begin() || address != self.front {
            log::error!("free: {:#x} is not the top of the front stack", address);
            return Err(AllocError::LifoViolation);
        }

        let header = self.header_at(address);
        let intact = self.check_canaries(address, header.size);

        // Whatever the client wrote in the payload stays there;
        // popping only rewinds the cursor.
        self.front = header.prev;

        if intact {
            Ok(())
        } else {
            Err(AllocError::CanaryCorruption)
        }
    }

    /// Frees the top of the back stack; the mirror of `free`.
    #[ensures(ret == Err(AllocError::BadPointer) -> self.back() == old(self.back()),
              "Rejected frees leave the cursor untouched.")]
    #[ensures(ret == Err(AllocError::LifoViolation) -> self.back() == old(self.back()),
              "Rejected frees leave the cursor untouched.")]
    #[ensures(ret.is_ok() -> self.back() > old(self.back()),
              "A freed back block rewinds the cursor toward end.")]
    #[ensures(self.front() == old(self.front()),
              "Back frees never move the front cursor.")]
    pub fn free_back(&mut self, ptr: *mut c_void) -> Result<(), AllocError> {
        self.check_pointer("free_back", ptr)?;

        let address = ptr as usize;
        if self.back == self.end() || address != self.back {
            log::error!("free_back: {:#x} is not the top of the back stack", address);
            return Err(AllocError::LifoViolation);
        }

        let header = self.header_at(address);
        let intact = self.check_canaries(address, header.size);

        self.back = header.prev;

        if intact {
            Ok(())
        } else {
            Err(AllocError::CanaryCorruption)
        }
    }

    /// Frees every live block, front stack first, then back stack.
    ///
    /// Each block goes through the full free path, so canaries are
    /// still validated; corruption lands in the log and does not stop
    /// the sweep.
    #[ensures(self.front() == self.begin() && self.back() == self.end(),
              "Both stacks are empty after a reset.")]
    pub fn reset(&mut self) {
        while self.front != self.begin() {
            let top = self.front as *mut c_void;
            let _ = self.free(top);
        }

        while self.back != self.end() {
            let top = self.back as *mut c_void;
            let _ = self.free_back(top);
        }
    }

    fn check_request(&self, size: usize, align: usize) -> Result<(), AllocError> {
        if !layout::is_power_of_two(align) {
            log::error!("allocation alignment {} is not a power of two", align);
            return Err(AllocError::BadAlignment);
        }

        if size == 0 {
            log::error!("refusing a zero byte allocation");
            return Err(AllocError::BadSize);
        }

        Ok(())
    }

    fn check_pointer(&self, op: &str, ptr: *mut c_void) -> Result<(), AllocError> {
        if ptr.is_null() {
            log::error!("{}: null pointer", op);
            return Err(AllocError::BadPointer);
        }

        let address = ptr as usize;
        if address < self.begin() || address > self.end() {
            log::error!(
                "{}: {:#x} is outside the region [{:#x}, {:#x}]",
                op,
                address,
                self.begin(),
                self.end()
            );
            return Err(AllocError::BadPointer);
        }

        Ok(())
    }

    /// Reads the hidden header just below `payload`.  Alignment
    /// padding can leave headers on odd addresses, hence the
    /// unaligned access.
    fn header_at(&self, payload: usize) -> Header {
        unsafe { ptr::read_unaligned((payload - layout::HEADER_SIZE) as *const Header) }
    }

    unsafe fn write_header(&mut self, payload: usize, header: Header) {
        ptr::write_unaligned((payload - layout::HEADER_SIZE) as *mut Header, header);
    }

    #[cfg(feature = "debug_canaries")]
    unsafe fn write_canaries(&mut self, payload: usize, size: usize) {
        ptr::write_unaligned(layout::block_low(payload) as *mut u32, layout::CANARY);
        ptr::write_unaligned((payload + size) as *mut u32, layout::CANARY);
    }

    #[cfg(not(feature = "debug_canaries"))]
    unsafe fn write_canaries(&mut self, _payload: usize, _size: usize) {}

    /// Returns false if either canary was overwritten; both ends are
    /// checked and reported independently.
    #[cfg(feature = "debug_canaries")]
    fn check_canaries(&self, payload: usize, size: usize) -> bool {
        let mut intact = true;

        let head = unsafe { ptr::read_unaligned(layout::block_low(payload) as *const u32) };
        if head != layout::CANARY {
            log::error!(
                "begin canary of {:#x} was overwritten: {:#010x}",
                payload,
                head
            );
            intact = false;
        }

        let tail = unsafe { ptr::read_unaligned((payload + size) as *const u32) };
        if tail != layout::CANARY {
            log::error!(
                "end canary of {:#x} was overwritten: {:#010x}",
                payload,
                tail
            );
            intact = false;
        }

        intact
    }

    #[cfg(not(feature = "debug_canaries"))]
    fn check_canaries(&self, _payload: usize, _size: usize) -> bool {
        true
    }
}

impl Drop for DoubleEndedStackAllocator {
    fn drop(&mut self) {
        // Sweeping through reset() validates the canaries of anything
        // still live before the region goes away.
        self.reset();
    }
}

impl std::fmt::Debug for DoubleEndedStackAllocator {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("DoubleEndedStackAllocator")
            .field("begin", &format_args!("{:#x}", self.begin()))
            .field("front", &format_args!("{:#x}", self.front))
            .field("back", &format_args!("{:#x}", self.back))
            .field("end", &format_args!("{:#x}", self.end()))
            .finish()
    }
}

fn out_of_range(op: &str, size: usize) -> AllocError {
    log::error!("{}: a {} byte block does not fit in the address space", op, size);
    AllocError::Overlap
}
