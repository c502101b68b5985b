//! Tracks every contiguous OS mapping handed out to the allocator, and
//! carves fresh chunks out of newly mapped regions.
//!
//! Grounded on `mill.rs`'s `AllocatedChunk` region-carving and on
//! `asan_allocator.cc`'s `page_groups_` registry.
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::chunk::{self, ChunkPtr};
use crate::page_provider;

/// A contiguous mapping that hosts chunks of a single size class.
#[derive(Clone, Copy)]
pub struct PageGroup {
    pub beg: usize,
    pub end: usize,
    pub size_of_chunk: usize,
}

impl PageGroup {
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.beg && addr < self.end
    }
}

/// `kMinMmapSize` from the source this is grounded on: never map less than
/// this many bytes at a time, to amortize the cost of the syscall.
pub fn min_mmap_size() -> usize {
    page_provider::page_size() * 1024
}

lazy_static::lazy_static! {
    // Append-only; the teacher's registries use an atomic index into a
    // fixed array, but every append here already happens under
    // `free_list`'s global mutex, so a plain `Mutex<Vec<_>>` gives the
    // same append-only, linearizable semantics without a second primitive.
    static ref GROUPS: Mutex<Vec<PageGroup>> = Mutex::new(Vec::new());
}

/// Records a new page group. Must be called with the allocator's global
/// free-list mutex held, so readers never observe a torn registry.
pub fn register(group: PageGroup) {
    GROUPS.lock().unwrap().push(group);
}

/// Finds the page group containing `addr`, if any.
///
/// Linear scan: a known performance concern inherited from the source,
/// left unaddressed here (an interval tree would not change behavior).
pub fn find_page_group(addr: usize) -> Option<PageGroup> {
    GROUPS
        .lock()
        .unwrap()
        .iter()
        .find(|g| g.contains(addr))
        .copied()
}

/// Carves `mmap_size` worth of fresh chunks of `size` bytes each, maps the
/// backing pages, registers a `PageGroup`, and returns them linked into a
/// singly linked stack (head first). Always carves at least one chunk.
pub fn get_new_chunks(size: usize) -> ChunkPtr {
    debug_assert!(size.is_power_of_two());

    let page_size = page_provider::page_size();
    let mut mmap_size = page_provider::round_up(size.max(min_mmap_size()), page_size);
    let mut n_chunks = mmap_size / size;

    if size < page_size {
        // Reserve the last chunk as a permanently poisoned sentinel tail;
        // its shadow is already poisoned because the whole mapping starts
        // out fully red.
        n_chunks = n_chunks.saturating_sub(1).max(1);
    } else {
        // Large chunks get one extra guard page appended instead.
        mmap_size += page_size;
    }

    let base = page_provider::map_pages(mmap_size);
    let base_addr = base.as_ptr() as usize;

    let mut head: Option<ChunkPtr> = None;
    for i in (0..n_chunks).rev() {
        let chunk_addr = base_addr + i * size;
        let chunk = unsafe {
            chunk::init_available(NonNull::new_unchecked(chunk_addr as *mut u8), size)
        };
        unsafe {
            chunk.header().next = head;
        }
        head = Some(chunk);
    }

    register(PageGroup {
        beg: base_addr,
        end: base_addr + mmap_size,
        size_of_chunk: size,
    });

    head.expect("n_chunks is always at least 1")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn carves_a_linked_list_of_available_chunks() {
        let size = 4096;
        let head = get_new_chunks(size);
        let mut count = 0;
        let mut cursor = Some(head);
        while let Some(c) = cursor {
            unsafe {
                assert_eq!(c.header().state, crate::chunk::ChunkState::Available);
                assert_eq!(c.header().size, size);
                cursor = c.header().next;
            }
            count += 1;
        }
        assert!(count >= 1);
    }

    #[test]
    fn registers_a_page_group_covering_the_chunks() {
        let size = 4096;
        let head = get_new_chunks(size);
        let group = find_page_group(head.addr()).expect("head must be inside its own group");
        assert_eq!(group.size_of_chunk, size);
        assert!(group.contains(head.addr()));
    }
}
