//! Captures and prints compressed call stacks for allocation/free sites.
//!
//! Grounded on the `backtrace::Backtrace` usage in the LibAFL shadow-memory
//! allocator this crate is enriched from (`AllocationMetadata`'s
//! `allocation_site_backtrace`/`release_site_backtrace` fields), but stores
//! only raw instruction pointers inline rather than a resolved `Backtrace`,
//! since resolving symbols is comparatively expensive and should only
//! happen when a report is actually printed.
use std::mem::MaybeUninit;

/// Maximum number of frames kept per captured stack.
pub const MAX_FRAMES: usize = 8;

/// A fixed-width, unresolved stack trace: just the instruction pointers.
#[derive(Clone, Copy)]
pub struct CompressedStack {
    frames: [usize; MAX_FRAMES],
    len: u8,
}

impl CompressedStack {
    pub const fn empty() -> Self {
        CompressedStack {
            frames: [0; MAX_FRAMES],
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Resolves symbols and formats the trace, one frame per line.
    pub fn print(&self) -> String {
        if self.is_empty() {
            return "  <no stack captured>".to_owned();
        }

        let mut out = String::new();
        for (i, &ip) in self.frames[..self.len as usize].iter().enumerate() {
            let mut name = None;
            backtrace::resolve(ip as *mut std::ffi::c_void, |symbol| {
                if name.is_none() {
                    name = symbol.name().map(|n| n.to_string());
                }
            });
            out.push_str(&format!(
                "    #{} {:#x} {}\n",
                i,
                ip,
                name.as_deref().unwrap_or("<unknown>")
            ));
        }
        out
    }
}

impl Default for CompressedStack {
    fn default() -> Self {
        Self::empty()
    }
}

/// Captures the current call stack, up to `MAX_FRAMES` frames.
pub fn capture() -> CompressedStack {
    let mut frames: [MaybeUninit<usize>; MAX_FRAMES] = unsafe { MaybeUninit::uninit().assume_init() };
    let mut len = 0usize;

    backtrace::trace(|frame| {
        if len >= MAX_FRAMES {
            return false;
        }
        frames[len] = MaybeUninit::new(frame.ip() as usize);
        len += 1;
        len < MAX_FRAMES
    });

    let mut result = CompressedStack::empty();
    for i in 0..len {
        result.frames[i] = unsafe { frames[i].assume_init() };
    }
    result.len = len as u8;
    result
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn capture_is_non_empty_inside_a_call() {
        fn inner() -> CompressedStack {
            capture()
        }

        let stack = inner();
        assert!(!stack.is_empty());
    }

    #[test]
    fn empty_stack_prints_placeholder() {
        let stack = CompressedStack::empty();
        assert!(stack.print().contains("no stack captured"));
    }

    #[test]
    fn print_contains_a_frame_marker() {
        let stack = capture();
        let text = stack.print();
        assert!(text.contains("#0"));
    }
}
