//! Assigns small integer thread ids, and swallows a thread's local malloc
//! storage (free lists, quarantine) into the globals when it exits.
//!
//! The registry itself follows the teacher's `lazy_static! static ref
//! CLASSES: Mutex<Vec<...>>` global-registry shape; the per-thread guard
//! follows the teacher's `thread_local!` + `Drop`-based cache teardown.
use std::cell::RefCell;
use std::sync::Mutex;

use crate::free_list;
use crate::quarantine;

/// Sentinel meaning "no thread id assigned" -- mirrors the source's
/// convention of a dedicated invalid marker rather than `Option` at the
/// FFI boundary, kept here for symmetry even though this crate is pure Rust.
pub const INVALID_TID: u32 = u32::MAX;

struct Registry {
    next_tid: u32,
    live: Vec<bool>,
}

impl Registry {
    fn register(&mut self) -> u32 {
        let tid = self.next_tid;
        self.next_tid += 1;
        self.live.push(true);
        tid
    }

    fn deregister(&mut self, tid: u32) {
        if let Some(slot) = self.live.get_mut(tid as usize) {
            *slot = false;
        }
    }
}

lazy_static::lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry {
        next_tid: 0,
        live: Vec::new(),
    });
}

struct ThreadGuard {
    tid: u32,
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        free_list::thread_local_drain_to_global();
        quarantine::thread_local_flush_to_global();
        REGISTRY.lock().unwrap().deregister(self.tid);
    }
}

thread_local! {
    static GUARD: RefCell<Option<ThreadGuard>> = RefCell::new(None);
}

/// Returns this thread's id, assigning one on first call.
pub fn current_tid() -> u32 {
    GUARD.with(|guard| {
        let mut guard = guard.borrow_mut();
        if guard.is_none() {
            let tid = REGISTRY.lock().unwrap().register();
            *guard = Some(ThreadGuard { tid });
        }
        guard.as_ref().unwrap().tid
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tid_is_stable_within_a_thread() {
        let a = current_tid();
        let b = current_tid();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_threads_get_distinct_tids() {
        let main_tid = current_tid();
        let spawned_tid = std::thread::spawn(current_tid).join().unwrap();
        assert_ne!(main_tid, spawned_tid);
    }
}
