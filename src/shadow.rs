//! Shadow memory: one byte of metadata per `SHADOW_GRANULARITY`-byte
//! granule of heap memory.
//!
//! Grounded on `asan_mapping.h`'s `SHADOW_SCALE`/`MEM_TO_SHADOW` macro, but
//! simplified: this crate only shadows bytes it itself has handed out via
//! [`crate::page_provider`], not the whole address space, so shadow storage
//! is a single growable region indexed from the lowest heap address this
//! process has ever mapped (see `map_to_shadow!` in the LibAFL allocator
//! this is grounded on for the incremental-coverage idea).
use std::sync::Mutex;

pub const SHADOW_SCALE: usize = 3;
pub const SHADOW_GRANULARITY: usize = 1 << SHADOW_SCALE;

/// Shadow byte for a fully addressable granule.
pub const ADDRESSABLE: u8 = 0x00;
/// Shadow byte for the left red-zone preceding a chunk's user region.
pub const LEFT_REDZONE_MAGIC: u8 = 0xfa;
/// Shadow byte for the red-zone following a chunk's user region.
pub const RIGHT_REDZONE_MAGIC: u8 = 0xfb;
/// Shadow byte for a user region that has been freed and is in quarantine.
pub const FREE_MAGIC: u8 = 0xfd;

/// Returns the shadow byte a partially-used final granule should carry:
/// the low `used` bytes (1..=7) are addressable, the rest are poisoned.
/// A granule with `used == 0` is fully addressable; out-of-range values
/// saturate to fully poisoned, since partial encoding cannot represent them.
pub fn partial_granule_byte(used: usize) -> u8 {
    if used == 0 || used >= SHADOW_GRANULARITY {
        ADDRESSABLE
    } else {
        used as u8
    }
}

struct Region {
    /// Lowest heap address this region covers. `None` until the first map.
    heap_base: Option<usize>,
    /// Number of heap bytes covered (a multiple of SHADOW_GRANULARITY).
    heap_span: usize,
    /// Raw storage, one byte per granule, `heap_span / SHADOW_GRANULARITY` long.
    bytes: Vec<u8>,
}

impl Region {
    fn new() -> Self {
        Region {
            heap_base: None,
            heap_span: 0,
            bytes: Vec::new(),
        }
    }

    /// Ensures the shadow region covers `[heap_addr, heap_addr + len)`,
    /// growing (by doubling) if needed. All new bytes start out as
    /// `LEFT_REDZONE_MAGIC`, matching freshly mapped chunk pages.
    fn ensure_covers(&mut self, heap_addr: usize, len: usize) {
        let base = *self.heap_base.get_or_insert(heap_addr);
        let base = base.min(heap_addr);
        let end = (heap_addr + len).max(base + self.heap_span);
        let needed_span = end - base;

        if self.heap_base == Some(base) && needed_span <= self.heap_span {
            return;
        }

        let mut new_span = self.heap_span.max(SHADOW_GRANULARITY * 4096);
        while new_span < needed_span {
            new_span *= 2;
        }

        let mut new_bytes = vec![LEFT_REDZONE_MAGIC; new_span / SHADOW_GRANULARITY];
        if let Some(old_base) = self.heap_base {
            let shift = (old_base.saturating_sub(base)) / SHADOW_GRANULARITY;
            for (i, b) in self.bytes.iter().enumerate() {
                new_bytes[i + shift] = *b;
            }
        }

        self.heap_base = Some(base);
        self.heap_span = new_span;
        self.bytes = new_bytes;
    }

    fn index_of(&self, heap_addr: usize) -> usize {
        let base = self.heap_base.expect("shadow region must be initialized");
        (heap_addr - base) / SHADOW_GRANULARITY
    }
}

lazy_static::lazy_static! {
    static ref REGION: Mutex<Region> = Mutex::new(Region::new());
}

/// Marks every granule in `[addr, addr + len)` as freshly mapped
/// (fully poisoned), growing shadow coverage if needed. `len` must be a
/// multiple of `SHADOW_GRANULARITY`.
pub fn register_mapped_range(addr: usize, len: usize) {
    debug_assert_eq!(len % SHADOW_GRANULARITY, 0);
    let mut region = REGION.lock().unwrap();
    region.ensure_covers(addr, len);
    poison_range_locked(&mut region, addr, len, LEFT_REDZONE_MAGIC);
    crate::stats::get().record_mmap(len);
}

fn poison_range_locked(region: &mut Region, addr: usize, len: usize, byte: u8) {
    debug_assert_eq!(addr % SHADOW_GRANULARITY, 0);
    debug_assert_eq!(len % SHADOW_GRANULARITY, 0);
    let start = region.index_of(addr);
    let count = len / SHADOW_GRANULARITY;
    for b in &mut region.bytes[start..start + count] {
        *b = byte;
    }
}

/// Poisons `[addr, addr + len)` with `byte`. Both must be granule-aligned.
pub fn poison_range(addr: usize, len: usize, byte: u8) {
    let mut region = REGION.lock().unwrap();
    region.ensure_covers(addr, len);
    poison_range_locked(&mut region, addr, len, byte);
}

/// Writes the shadow byte for a final, partially used granule starting at
/// `granule_addr`, where only the first `used` bytes are addressable.
pub fn poison_partial_right_redzone(granule_addr: usize, used: usize) {
    let mut region = REGION.lock().unwrap();
    region.ensure_covers(granule_addr, SHADOW_GRANULARITY);
    let idx = region.index_of(granule_addr);
    region.bytes[idx] = partial_granule_byte(used);
}

/// Reads the shadow byte for the granule containing `addr`.
pub fn shadow_byte(addr: usize) -> u8 {
    let region = REGION.lock().unwrap();
    if region.heap_base.is_none() {
        return LEFT_REDZONE_MAGIC;
    }
    let idx = region.index_of(addr - (addr % SHADOW_GRANULARITY));
    region.bytes.get(idx).copied().unwrap_or(LEFT_REDZONE_MAGIC)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_mapping_is_fully_poisoned() {
        register_mapped_range(0x10000, 4096);
        assert_eq!(shadow_byte(0x10000), LEFT_REDZONE_MAGIC);
        assert_eq!(shadow_byte(0x10000 + 4095), LEFT_REDZONE_MAGIC);
    }

    #[test]
    fn poison_range_is_observable() {
        register_mapped_range(0x20000, 4096);
        poison_range(0x20000, 64, ADDRESSABLE);
        assert_eq!(shadow_byte(0x20000), ADDRESSABLE);
        assert_eq!(shadow_byte(0x20000 + 63), ADDRESSABLE);
        assert_eq!(shadow_byte(0x20000 + 64), LEFT_REDZONE_MAGIC);
    }

    #[test]
    fn partial_granule_encodes_used_bytes() {
        register_mapped_range(0x30000, 4096);
        poison_partial_right_redzone(0x30000, 3);
        assert_eq!(shadow_byte(0x30000), 3);

        poison_partial_right_redzone(0x30000 + 8, 0);
        assert_eq!(shadow_byte(0x30000 + 8), ADDRESSABLE);
    }

    #[test]
    fn growth_preserves_existing_bytes() {
        register_mapped_range(0x1_0000_0000, 4096);
        poison_range(0x1_0000_0000, 8, ADDRESSABLE);
        // Force growth far beyond the initial span.
        register_mapped_range(0x1_0000_0000 + (1 << 30), 4096);
        assert_eq!(shadow_byte(0x1_0000_0000), ADDRESSABLE);
    }
}
