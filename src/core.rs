//! Ties the other components together into the allocate/deallocate/
//! reallocate protocol, and the calloc/valloc/memalign/posix_memalign
//! variants built on top of it.
//!
//! Grounded on `individual.rs`'s `allocate`/`release` split
//! (`ClassInfo::allocate_slow`/`release_slow`), generalized from a single
//! size class to the full red-zoned chunk protocol in
//! `asan_allocator.cc`'s `Allocate`/`Deallocate`/`Reallocate`.
use std::ptr::NonNull;

use crate::chunk::{self, ChunkState};
use crate::config;
use crate::free_list;
use crate::page_provider;
use crate::quarantine;
use crate::resolver;
use crate::shadow;
use crate::stack_trace;
use crate::stats;
use crate::thread_registry;

/// Allocates `requested_size` bytes aligned to `alignment` (0 meaning no
/// constraint beyond the red-zone's natural alignment). Aborts the process
/// if the request exceeds the configured large-allocation limit or if the
/// OS cannot supply memory; never returns a null pointer.
pub fn allocate(requested_size: usize, alignment: usize) -> NonNull<u8> {
    let redzone = config::get().redzone_size;
    let size = if requested_size == 0 { 1 } else { requested_size };
    let rounded = page_provider::round_up(size, redzone);

    let mut needed = rounded + redzone;
    if alignment > redzone {
        needed += alignment;
    }

    if needed > config::get().large_malloc_limit_bytes {
        log::error!(
            "warden-alloc: refusing to allocate {} bytes, exceeds configured limit\n{}",
            size,
            stack_trace::capture().print()
        );
        std::process::abort();
    }

    let min_alloc = 2 * redzone;
    let to_allocate = page_provider::next_power_of_two_at_least(needed, min_alloc);

    let c = free_list::allocate_one(to_allocate);
    let chunk_addr = c.addr();
    let natural_addr = chunk_addr + redzone;

    let (user_addr, offset) = if alignment > redzone && natural_addr % alignment != 0 {
        let aligned = page_provider::round_up(natural_addr, alignment);
        let sentinel_addr = aligned - redzone;
        debug_assert!(sentinel_addr + redzone <= chunk_addr + to_allocate);
        unsafe {
            chunk::init_memalign_sentinel(
                NonNull::new_unchecked(sentinel_addr as *mut u8),
                c,
            );
        }
        (aligned, (aligned - chunk_addr) as u32)
    } else {
        (natural_addr, redzone as u32)
    };

    debug_assert!(user_addr + rounded <= chunk_addr + to_allocate);

    let tid = thread_registry::current_tid();
    unsafe {
        let header = c.header();
        header.state = ChunkState::Allocated;
        header.used_size = requested_size;
        header.offset = offset;
        header.alloc_tid = tid;
        header.free_tid = thread_registry::INVALID_TID;
        header.next = None;
        header.alloc_stack = stack_trace::capture();
        header.free_stack = stack_trace::CompressedStack::empty();
    }

    // [user_addr, full_granules) is fully in-bounds and addressable.
    // [full_granules, rounded) is all red zone: a partial granule at the
    // size boundary (if `size` isn't granule-aligned), then whole
    // poisoned granules out to `rounded`, the end of the reserved region.
    let remainder = size % shadow::SHADOW_GRANULARITY;
    let full_granules = size - remainder;
    shadow::poison_range(user_addr, full_granules, shadow::ADDRESSABLE);

    let redzone_start = if remainder != 0 {
        let last_granule = user_addr + full_granules;
        shadow::poison_partial_right_redzone(last_granule, remainder);
        last_granule + shadow::SHADOW_GRANULARITY
    } else {
        user_addr + full_granules
    };
    shadow::poison_range(
        redzone_start,
        (user_addr + rounded).saturating_sub(redzone_start),
        shadow::RIGHT_REDZONE_MAGIC,
    );

    stats::get().record_malloc();
    unsafe { NonNull::new_unchecked(user_addr as *mut u8) }
}

/// Frees `p`. A `None` pointer (C's `free(NULL)`) is a documented no-op.
/// Aborts with a diagnostic on double-free or invalid-free.
pub fn deallocate(p: Option<NonNull<u8>>) {
    let p = match p {
        Some(p) => p,
        None => return,
    };

    let c = unsafe { chunk::ptr_to_chunk(p) };
    let state = unsafe { c.header().state };

    match state {
        ChunkState::Quarantine => {
            log::error!(
                "warden-alloc: attempting double-free on {:p}\ncurrent stack:\n{}\n{}",
                p.as_ptr(),
                stack_trace::capture().print(),
                resolver::describe(p.as_ptr() as usize, 1)
            );
            std::process::abort();
        }
        ChunkState::Allocated => {}
        ChunkState::Available | ChunkState::Memalign => {
            log::error!(
                "warden-alloc: attempting free on address which was not malloc()-ed: {:p}\n{}",
                p.as_ptr(),
                stack_trace::capture().print()
            );
            std::process::abort();
        }
    }

    let redzone = config::get().redzone_size;
    let tid = thread_registry::current_tid();

    let size = unsafe {
        let header = c.header();
        header.free_tid = tid;
        header.free_stack = stack_trace::capture();
        header.used_size
    };

    shadow::poison_range(p.as_ptr() as usize, page_provider::round_up(size, redzone), shadow::FREE_MAGIC);

    unsafe {
        let header = c.header();
        header.state = ChunkState::Quarantine;
        header.next = None;
    }

    stats::get().record_free();
    quarantine::push(c);
}

/// `realloc`. `old = None` behaves as `allocate`. `new_size == 0` returns
/// `None` and does *not* free `old` -- a deliberate, documented deviation
/// from C's `realloc(p, 0)`.
pub fn reallocate(old: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
    let old = match old {
        Some(p) => p,
        None => return Some(allocate(new_size, 0)),
    };

    if new_size == 0 {
        return None;
    }

    let old_chunk = unsafe { chunk::ptr_to_chunk(old) };
    let old_used = unsafe { old_chunk.header().used_size };

    let new_ptr = allocate(new_size, 0);
    unsafe {
        std::ptr::copy_nonoverlapping(old.as_ptr(), new_ptr.as_ptr(), old_used.min(new_size));
    }
    deallocate(Some(old));
    Some(new_ptr)
}

/// `calloc`. Checks `n * size` for overflow and treats overflow as an
/// allocation failure (returns `None`) rather than wrapping.
pub fn callocate(n: usize, size: usize) -> Option<NonNull<u8>> {
    let total = n.checked_mul(size)?;
    let ptr = allocate(total, 0);
    unsafe {
        std::ptr::write_bytes(ptr.as_ptr(), 0, total);
    }
    Some(ptr)
}

/// `valloc`: page-aligned allocation.
pub fn valloc(size: usize) -> NonNull<u8> {
    allocate(size, page_provider::page_size())
}

/// `memalign`: allocation aligned to `alignment`, no validation beyond
/// what `allocate` itself requires.
pub fn memalign(alignment: usize, size: usize) -> NonNull<u8> {
    allocate(size, alignment)
}

/// `posix_memalign`. Returns `Err(EINVAL)` if `alignment` is not a power
/// of two that is also a multiple of `size_of::<*const ()>()`.
pub fn posix_memalign(alignment: usize, size: usize) -> Result<NonNull<u8>, i32> {
    let ptr_size = std::mem::size_of::<*const ()>();
    if alignment == 0 || !alignment.is_power_of_two() || alignment % ptr_size != 0 {
        return Err(libc::EINVAL);
    }
    Ok(allocate(size, alignment))
}

/// Usable size of the allocation at `p`, or 0 if `p` is not a live
/// allocation.
pub fn usable_size(p: NonNull<u8>) -> usize {
    resolver::allocation_size(p.as_ptr() as usize)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_returns_aligned_pointer() {
        let p = allocate(10, 0);
        let redzone = config::get().redzone_size;
        assert_eq!(p.as_ptr() as usize % redzone, 0);
    }

    #[test]
    fn allocate_zero_returns_a_valid_pointer() {
        let p = allocate(0, 0);
        assert_eq!(usable_size(p), 0);
    }

    #[test]
    fn free_then_usable_size_is_zero() {
        let p = allocate(64, 0);
        assert_eq!(usable_size(p), 64);
        deallocate(Some(p));
        assert_eq!(usable_size(p), 0);
    }

    #[test]
    fn free_null_is_a_no_op() {
        deallocate(None);
    }

    #[test]
    fn realloc_preserves_contents() {
        let p = allocate(16, 0);
        unsafe {
            std::ptr::write_bytes(p.as_ptr(), 0xab, 16);
        }
        let q = reallocate(Some(p), 32).expect("growing realloc must succeed");
        let bytes = unsafe { std::slice::from_raw_parts(q.as_ptr(), 16) };
        assert!(bytes.iter().all(|&b| b == 0xab));
    }

    #[test]
    fn realloc_to_zero_returns_none_and_does_not_free() {
        let p = allocate(16, 0);
        assert!(reallocate(Some(p), 0).is_none());
        // `p` is still live; freeing it must not double-free.
        deallocate(Some(p));
    }

    #[test]
    fn calloc_zeroes_memory() {
        let p = callocate(8, 8).expect("should not overflow");
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn calloc_overflow_returns_none() {
        assert!(callocate(usize::MAX, 2).is_none());
    }

    #[test]
    fn posix_memalign_validates_alignment() {
        assert_eq!(posix_memalign(3, 16).unwrap_err(), libc::EINVAL);
        let p = posix_memalign(4096, 100).expect("valid alignment should succeed");
        assert_eq!(p.as_ptr() as usize % 4096, 0);
    }

    #[test]
    fn valloc_is_page_aligned() {
        let p = valloc(100);
        assert_eq!(p.as_ptr() as usize % page_provider::page_size(), 0);
    }
}
