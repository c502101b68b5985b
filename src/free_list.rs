//! Per-size-class free lists: one global set behind a mutex, one
//! thread-local set per thread for the common, lock-free fast path.
//!
//! Grounded on the teacher's `cache.rs` (`ClassCache`/`thread_local!`
//! per-thread cache that falls back to a slow global path) and
//! `individual.rs`'s `allocate_slow`/`release_slow` split.
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

use std::cell::RefCell;
use std::sync::Mutex;

use crate::chunk::{self, ChunkPtr};
use crate::page_group;

/// Chunks at or above this size always go through the global free list;
/// below it, they're cached per-thread. Matches
/// `kMaxSizeForThreadLocalFreeList` in the source this is grounded on.
pub const MAX_SIZE_FOR_THREAD_LOCAL_FREE_LIST: usize = 1 << 17;

const NUM_CLASSES: usize = usize::BITS as usize;

fn size_class(size: usize) -> usize {
    debug_assert!(size.is_power_of_two());
    size.trailing_zeros() as usize
}

struct GlobalLists {
    heads: [Option<ChunkPtr>; NUM_CLASSES],
}

impl GlobalLists {
    fn new() -> Self {
        GlobalLists {
            heads: [None; NUM_CLASSES],
        }
    }

    #[ensures(self.heads[size_class(size)].is_some(), "Stack is non-empty after a push.")]
    fn push(&mut self, size: usize, chunk: ChunkPtr) {
        let class = size_class(size);
        unsafe {
            chunk.header().next = self.heads[class];
        }
        self.heads[class] = Some(chunk);
    }

    #[ensures(old(self.heads[size_class(size)].is_none()) == ret.is_none(),
              "We only fail to pop from an empty class.")]
    fn pop(&mut self, size: usize) -> Option<ChunkPtr> {
        let class = size_class(size);
        let chunk = self.heads[class]?;
        self.heads[class] = unsafe { chunk.header().next };
        Some(chunk)
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL: Mutex<GlobalLists> = Mutex::new(GlobalLists::new());
}

struct ThreadLocalLists {
    heads: [Option<ChunkPtr>; NUM_CLASSES],
}

impl ThreadLocalLists {
    fn new() -> Self {
        ThreadLocalLists {
            heads: [None; NUM_CLASSES],
        }
    }

    fn push(&mut self, size: usize, chunk: ChunkPtr) {
        let class = size_class(size);
        unsafe {
            chunk.header().next = self.heads[class];
        }
        self.heads[class] = Some(chunk);
    }

    fn pop(&mut self, size: usize) -> Option<ChunkPtr> {
        let class = size_class(size);
        let chunk = self.heads[class]?;
        self.heads[class] = unsafe { chunk.header().next };
        Some(chunk)
    }
}

thread_local! {
    static LOCAL: RefCell<ThreadLocalLists> = RefCell::new(ThreadLocalLists::new());
}

/// Pops `n` chunks of `size` bytes from the global list under one lock
/// acquisition, refilling from fresh page groups as needed. Returns them
/// linked into a singly linked stack.
fn allocate_batch_from_global(size: usize, n: usize) -> ChunkPtr {
    let mut global = GLOBAL.lock().unwrap();
    let mut head: Option<ChunkPtr> = None;
    let mut got = 0;

    while got < n {
        let chunk = match global.pop(size) {
            Some(c) => c,
            None => {
                let fresh = page_group::get_new_chunks(size);
                // `get_new_chunks` may have linked more than one chunk;
                // walk the chain *before* relinking any of it onto the
                // global stack, then push each one individually so `pop`
                // sees them all.
                let mut rest = unsafe { fresh.header().next };
                global.push(size, fresh);
                while let Some(c) = rest {
                    rest = unsafe { c.header().next };
                    global.push(size, c);
                }
                continue;
            }
        };
        unsafe {
            chunk.header().next = head;
        }
        head = Some(chunk);
        got += 1;
    }

    head.expect("n is always at least 1")
}

/// Allocates a single `Available` chunk of the given power-of-two `size`.
pub fn allocate_one(size: usize) -> ChunkPtr {
    if size >= MAX_SIZE_FOR_THREAD_LOCAL_FREE_LIST {
        return allocate_batch_from_global(size, 1);
    }

    LOCAL.with(|local| {
        let mut local = local.borrow_mut();
        if let Some(chunk) = local.pop(size) {
            return chunk;
        }

        let batch_n = (MAX_SIZE_FOR_THREAD_LOCAL_FREE_LIST / size).max(2);
        let mut head = Some(allocate_batch_from_global(size, batch_n));
        let first = head.take().unwrap();
        let mut cursor = unsafe { first.header().next };
        unsafe {
            first.header().next = None;
        }
        while let Some(c) = cursor {
            cursor = unsafe { c.header().next };
            local.push(size, c);
        }
        first
    })
}

/// Returns a chunk (whose `state` must already be `Available`) to the
/// appropriate free list.
pub fn release_one(size: usize, chunk: ChunkPtr) {
    debug_assert_eq!(unsafe { chunk.header().state }, chunk::ChunkState::Available);

    if size >= MAX_SIZE_FOR_THREAD_LOCAL_FREE_LIST {
        GLOBAL.lock().unwrap().push(size, chunk);
        return;
    }

    LOCAL.with(|local| local.borrow_mut().push(size, chunk));
}

/// Pushes a chunk straight onto the global list, used by quarantine
/// eviction which always operates on the global side.
pub fn release_to_global(size: usize, chunk: ChunkPtr) {
    debug_assert_eq!(unsafe { chunk.header().state }, chunk::ChunkState::Available);
    GLOBAL.lock().unwrap().push(size, chunk);
}

/// Moves every chunk cached by the current thread into the global lists.
/// Called when a thread exits.
pub fn thread_local_drain_to_global() {
    LOCAL.with(|local| {
        let mut local = local.borrow_mut();
        let mut global = GLOBAL.lock().unwrap();
        for class in 0..NUM_CLASSES {
            while let Some(chunk) = local.heads[class] {
                local.heads[class] = unsafe { chunk.header().next };
                let size = 1usize << class;
                global.push(size, chunk);
            }
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_then_release_reuses_the_chunk() {
        let size = 1024;
        let a = allocate_one(size);
        release_one(size, a);
        let b = allocate_one(size);
        assert_eq!(a, b);
    }

    #[test]
    fn large_chunks_bypass_thread_local_cache() {
        let size = MAX_SIZE_FOR_THREAD_LOCAL_FREE_LIST.next_power_of_two();
        let a = allocate_one(size);
        release_one(size, a);
        // Goes straight to the global list either way; just check it's
        // reusable without panicking.
        let b = allocate_one(size);
        assert_eq!(a, b);
    }
}
