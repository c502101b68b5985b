//! Obtains zero-initialized anonymous page ranges directly from the OS.
//!
//! Replaces the teacher's C-backed `slitter__reserve_region`/
//! `slitter__allocate_region` helpers with direct `libc::mmap` calls, since
//! this crate carries no C sources of its own.
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::shadow;
use crate::stack_trace;

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

static TOTAL_MAPPED: AtomicUsize = AtomicUsize::new(0);

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret <= 0 {
        panic!("unable to determine page size");
    }
    ret as usize
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Rounds `value` up to the nearest multiple of `multiple`, which must be
/// a power of two.
#[inline]
pub fn round_up(value: usize, multiple: usize) -> usize {
    debug_assert!(multiple.is_power_of_two());
    (value + multiple - 1) & !(multiple - 1)
}

/// Rounds `value` up to the next power of two, at least `floor`.
#[inline]
pub fn next_power_of_two_at_least(value: usize, floor: usize) -> usize {
    value.max(floor).next_power_of_two()
}

/// Maps a fresh, zeroed, anonymous region of `size` bytes (a multiple of
/// the page size) and registers it with the shadow map as fully poisoned.
///
/// Aborts the process on failure, after logging a diagnostic and the
/// current stack trace, matching the source's OOM-is-fatal behavior.
pub fn map_pages(size: usize) -> NonNull<c_void> {
    assert!(
        size > 0 && size % page_size() == 0,
        "bad mapping size={} page_size={}",
        size,
        page_size()
    );

    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if addr == libc::MAP_FAILED {
        let errno = std::io::Error::last_os_error();
        log::error!(
            "warden-alloc failed to mmap {} bytes: {}\n{}",
            size,
            errno,
            stack_trace::capture().print()
        );
        std::process::abort();
    }

    TOTAL_MAPPED.fetch_add(size, Ordering::Relaxed);

    let base = NonNull::new(addr).expect("mmap returned NULL on success");
    shadow::register_mapped_range(base.as_ptr() as usize, size);
    base
}

/// Releases a region previously returned by [`map_pages`]. Unused in
/// steady-state operation (chunks are never returned to the OS) but kept
/// for the shadow-region growth path and for tests.
///
/// # Safety
/// `base` must have come from `map_pages`, and `size` must match the
/// original mapping size exactly.
pub unsafe fn unmap_pages(base: NonNull<c_void>, size: usize) {
    let ret = libc::munmap(base.as_ptr(), size);
    assert_eq!(ret, 0, "munmap failed: {}", std::io::Error::last_os_error());
    TOTAL_MAPPED.fetch_sub(size, Ordering::Relaxed);
}

/// Total bytes ever handed out by `map_pages` over the life of the process.
pub fn total_mmapped() -> usize {
    TOTAL_MAPPED.load(Ordering::Relaxed)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_size_is_sane() {
        assert_ne!(page_size(), 0);
        assert!(page_size().is_power_of_two());
    }

    #[test]
    fn round_up_works() {
        assert_eq!(round_up(0, 16), 0);
        assert_eq!(round_up(1, 16), 16);
        assert_eq!(round_up(16, 16), 16);
        assert_eq!(round_up(17, 16), 32);
    }

    #[test]
    fn map_and_unmap_roundtrip() {
        let size = page_size();
        let base = map_pages(size);
        let before = total_mmapped();
        unsafe {
            let slice = std::slice::from_raw_parts(base.as_ptr() as *const u8, size);
            assert!(slice.iter().all(|&b| b == 0));
            unmap_pages(base, size);
        }
        assert_eq!(total_mmapped(), before - size);
    }
}
