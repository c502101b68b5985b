//! Free-running telemetry counters for the allocator.
//!
//! These are advisory: they use relaxed atomics and are never consulted
//! for correctness decisions, only for diagnostics and the optional
//! periodic report.
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct Stats {
    mmaps: AtomicUsize,
    bytes_mapped: AtomicUsize,
    mallocs: AtomicUsize,
    frees: AtomicUsize,
    quarantine_bytes: AtomicUsize,
}

impl Stats {
    pub fn record_mmap(&self, bytes: usize) {
        self.mmaps.fetch_add(1, Ordering::Relaxed);
        self.bytes_mapped.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_malloc(&self) {
        self.mallocs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_free(&self) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_quarantine_bytes(&self, bytes: usize) {
        self.quarantine_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn mmaps(&self) -> usize {
        self.mmaps.load(Ordering::Relaxed)
    }

    pub fn bytes_mapped(&self) -> usize {
        self.bytes_mapped.load(Ordering::Relaxed)
    }

    pub fn mallocs(&self) -> usize {
        self.mallocs.load(Ordering::Relaxed)
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::Relaxed)
    }

    pub fn quarantine_bytes(&self) -> usize {
        self.quarantine_bytes.load(Ordering::Relaxed)
    }

    /// Formats a one-line human-readable summary.
    pub fn report(&self) -> String {
        format!(
            "mmaps={} bytes_mapped={} mallocs={} frees={} quarantine_bytes={}",
            self.mmaps(),
            self.bytes_mapped(),
            self.mallocs(),
            self.frees(),
            self.quarantine_bytes()
        )
    }
}

lazy_static::lazy_static! {
    static ref STATS: Stats = Stats::default();
}

/// Returns the process-wide stats singleton.
#[inline]
pub fn get() -> &'static Stats {
    &STATS
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters_are_monotonic() {
        let s = Stats::default();
        s.record_mmap(4096);
        s.record_malloc();
        s.record_malloc();
        s.record_free();

        assert_eq!(s.mmaps(), 1);
        assert_eq!(s.bytes_mapped(), 4096);
        assert_eq!(s.mallocs(), 2);
        assert_eq!(s.frees(), 1);

        s.record_mmap(4096);
        assert_eq!(s.mmaps(), 2);
        assert_eq!(s.bytes_mapped(), 8192);
    }

    #[test]
    fn report_contains_all_fields() {
        let s = Stats::default();
        let text = s.report();
        assert!(text.contains("mmaps="));
        assert!(text.contains("bytes_mapped="));
        assert!(text.contains("mallocs="));
        assert!(text.contains("frees="));
        assert!(text.contains("quarantine_bytes="));
    }
}
