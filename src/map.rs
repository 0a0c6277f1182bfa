//! Thin wrappers around the virtual memory syscalls that back the
//! on-demand region provider: reserve address space with no access
//! rights, then commit pages read-write as the stacks advance.
use std::ffi::c_void;
use std::ptr::NonNull;

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("Unable to find page_size: errno={}", errno());
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Attempts to reserve an *address space* region of `size` bytes.
///
/// The pages are mapped without access rights and must go through
/// `commit_region` before anything reads or writes them.
///
/// The `size` argument must be a multiple of the page size.
pub fn reserve_region(size: usize) -> Result<NonNull<c_void>, i32> {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };

    if base == libc::MAP_FAILED {
        Err(errno())
    } else {
        Ok(NonNull::new(base).expect("mmap never returns NULL on success"))
    }
}

/// Backs a region of `size` bytes starting at `base` with
/// (demand-faulted) read-write memory.
///
/// Both arguments must be multiples of the page size, and the range
/// must be a subset of a range obtained from `reserve_region`.
/// Committing an already-committed page is a no-op.
pub fn commit_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (base.as_ptr() as usize % page_size()) == 0 && (size % page_size()) == 0,
        "Bad region base={:p} size={} page_size={}",
        base,
        size,
        page_size()
    );

    let ret = unsafe { libc::mprotect(base.as_ptr(), size, libc::PROT_READ | libc::PROT_WRITE) };

    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Returns a region of `size` bytes starting at `base` to the system.
///
/// The range must be exactly the range obtained from a single
/// `reserve_region` call.
pub fn release_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe { libc::munmap(base.as_ptr(), size) };

    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);
    assert!(page_size().is_power_of_two());
}

// Simulate the allocator's workflow: reserve a range, commit both
// extremities, scribble on the committed pages, and release
// everything.
#[test]
fn smoke_test() {
    let region_size = 4 * page_size();
    let base = reserve_region(region_size).expect("reserve should succeed");

    let top_page =
        NonNull::new((base.as_ptr() as usize + region_size - page_size()) as *mut c_void)
            .expect("Should be non-null");

    commit_region(base, page_size()).expect("should commit the bottom page");
    commit_region(top_page, page_size()).expect("should commit the top page");

    unsafe {
        std::ptr::write_bytes(base.as_ptr() as *mut u8, 42, page_size());
        std::ptr::write_bytes(top_page.as_ptr() as *mut u8, 42, page_size());
        assert_eq!(std::ptr::read(base.as_ptr() as *const u8), 42);
        assert_eq!(std::ptr::read(top_page.as_ptr() as *const u8), 42);
    }

    // Recommitting a committed page must not disturb it.
    commit_region(base, page_size()).expect("recommit should succeed");
    assert_eq!(unsafe { std::ptr::read(base.as_ptr() as *const u8) }, 42);

    release_region(base, region_size).expect("should release everything");
}
