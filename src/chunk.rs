//! The in-band header every heap chunk carries, and the pointer arithmetic
//! that relates a user pointer to its header.
//!
//! Grounded on the teacher's `ClassInfo`/header-carrying idioms in
//! `class.rs` and the intrusive-link pattern in `magazine_impl.rs`, reshaped
//! around `original_source/asan/asan_allocator.cc`'s `ChunkBase`/`AsanChunk`
//! layout (state/size/used_size/offset/alloc_tid/free_tid/next).
use std::ptr::NonNull;

use crate::config;
use crate::stack_trace::CompressedStack;
use crate::thread_registry::INVALID_TID;

/// Lifecycle state of a chunk. Values are arbitrary but distinct, matching
/// the source's habit of giving each chunk state its own magic byte so a
/// stray read of freed allocator metadata is recognizable in a debugger.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChunkState {
    Available = 0xca,
    Allocated = 0xab,
    Quarantine = 0xcb,
    /// A placeholder header inside an over-aligned allocation; `next`
    /// points at the chunk's real header.
    Memalign = 0xae,
}

/// The header every chunk carries at its lowest address.
#[repr(C)]
pub struct ChunkHeader {
    pub state: ChunkState,
    /// Total size of the chunk, a power of two.
    pub size: usize,
    /// Bytes requested by the caller; meaningful only while `Allocated`
    /// or `Quarantine`.
    pub used_size: usize,
    /// Byte offset from this header to the user region's first byte.
    pub offset: u32,
    pub alloc_tid: u32,
    pub free_tid: u32,
    /// Intrusive link: free-list stack, or quarantine FIFO, never both.
    pub next: Option<ChunkPtr>,
    pub alloc_stack: CompressedStack,
    pub free_stack: CompressedStack,
}

/// A `Send`/`Sync` handle to a chunk header living in mapped memory.
///
/// Mirrors the teacher's `LinearRef`: a bare pointer made safe to move
/// across threads because all mutation happens while the owner holds
/// either the global mutex or sole thread-local access.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ChunkPtr(NonNull<ChunkHeader>);

unsafe impl Send for ChunkPtr {}
unsafe impl Sync for ChunkPtr {}

impl ChunkPtr {
    /// # Safety
    /// `ptr` must point at a valid, initialized `ChunkHeader`.
    pub unsafe fn new(ptr: NonNull<ChunkHeader>) -> Self {
        ChunkPtr(ptr)
    }

    #[inline]
    pub fn as_raw(self) -> NonNull<ChunkHeader> {
        self.0
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// # Safety
    /// The caller must hold whatever synchronization this chunk requires
    /// (global mutex for global-list chunks, sole ownership for
    /// thread-local chunks).
    #[allow(clippy::should_implement_trait)]
    pub unsafe fn header(self) -> &'static mut ChunkHeader {
        &mut *self.0.as_ptr()
    }

    /// Address of the chunk's user region, valid once `offset` is set.
    pub unsafe fn user_ptr(self) -> NonNull<u8> {
        let addr = self.addr() + self.header().offset as usize;
        NonNull::new_unchecked(addr as *mut u8)
    }
}

// `ChunkPtr` must stay pointer-sized: it's stored inline in every header
// as the intrusive `next` link, and in every free-list/quarantine slot.
static_assertions::assert_eq_size!(ChunkPtr, usize);

pub fn header_size() -> usize {
    std::mem::size_of::<ChunkHeader>()
}

/// Writes a fresh `Available` header at `addr`, which must be the start of
/// a `size`-byte chunk carved from a page group.
///
/// # Safety
/// `addr` must be valid for writes of `header_size()` bytes and not
/// currently aliased.
pub unsafe fn init_available(addr: NonNull<u8>, size: usize) -> ChunkPtr {
    let header_ptr = addr.as_ptr() as *mut ChunkHeader;
    header_ptr.write(ChunkHeader {
        state: ChunkState::Available,
        size,
        used_size: 0,
        offset: 0,
        alloc_tid: INVALID_TID,
        free_tid: INVALID_TID,
        next: None,
        alloc_stack: CompressedStack::empty(),
        free_stack: CompressedStack::empty(),
    });
    ChunkPtr::new(NonNull::new_unchecked(header_ptr))
}

/// Writes a `Memalign` sentinel header at `addr`, redirecting to `real`.
///
/// # Safety
/// `addr` must be valid for writes of `header_size()` bytes.
pub unsafe fn init_memalign_sentinel(addr: NonNull<u8>, real: ChunkPtr) -> ChunkPtr {
    let header_ptr = addr.as_ptr() as *mut ChunkHeader;
    header_ptr.write(ChunkHeader {
        state: ChunkState::Memalign,
        size: 0,
        used_size: 0,
        offset: 0,
        alloc_tid: INVALID_TID,
        free_tid: INVALID_TID,
        next: Some(real),
        alloc_stack: CompressedStack::empty(),
        free_stack: CompressedStack::empty(),
    });
    ChunkPtr::new(NonNull::new_unchecked(header_ptr))
}

/// Resolves a user pointer back to the chunk that owns it, following a
/// `Memalign` sentinel if present.
///
/// # Safety
/// `p` must have been returned by this crate's allocate family and not yet
/// unmapped.
pub unsafe fn ptr_to_chunk(p: NonNull<u8>) -> ChunkPtr {
    let redzone = config::get().redzone_size;
    let header_addr = p.as_ptr() as usize - redzone;
    let header_ptr = header_addr as *mut ChunkHeader;
    let candidate = ChunkPtr::new(NonNull::new_unchecked(header_ptr));

    if candidate.header().state == ChunkState::Memalign {
        candidate.header().next.expect("memalign sentinel must link to a real chunk")
    } else {
        candidate
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn available_chunk_round_trips() {
        let mut buf = vec![0u8; header_size() + 64];
        let addr = NonNull::new(buf.as_mut_ptr()).unwrap();
        unsafe {
            let chunk = init_available(addr, 128);
            assert_eq!(chunk.header().state, ChunkState::Available);
            assert_eq!(chunk.header().size, 128);
        }
    }

    #[test]
    fn memalign_sentinel_redirects() {
        let mut real_buf = vec![0u8; header_size() + 64];
        let mut sentinel_buf = vec![0u8; header_size()];
        unsafe {
            let real = init_available(NonNull::new(real_buf.as_mut_ptr()).unwrap(), 128);
            real.header().state = ChunkState::Allocated;
            let sentinel =
                init_memalign_sentinel(NonNull::new(sentinel_buf.as_mut_ptr()).unwrap(), real);
            assert_eq!(sentinel.header().state, ChunkState::Memalign);
            assert_eq!(sentinel.header().next, Some(real));
        }
    }
}
