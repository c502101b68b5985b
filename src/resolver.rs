//! Resolves an arbitrary address to the chunk that owns it, and classifies
//! an access to that address as inside, to the left, or to the right of
//! the chunk's user region.
//!
//! Grounded on `asan_allocator.cc`'s `FindChunkByAddr`/`DescribeAddress`.
use crate::chunk::{self, ChunkPtr};
use crate::config;
use crate::page_group::{self, PageGroup};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Inside,
    Left,
    Right,
}

#[derive(Clone, Copy)]
pub struct Classification {
    pub chunk: ChunkPtr,
    pub side: Side,
    pub distance: usize,
}

unsafe fn chunk_at(group: &PageGroup, addr: usize) -> ChunkPtr {
    let index = (addr - group.beg) / group.size_of_chunk;
    let chunk_addr = group.beg + index * group.size_of_chunk;
    chunk::ChunkPtr::new(std::ptr::NonNull::new_unchecked(
        chunk_addr as *mut chunk::ChunkHeader,
    ))
}

unsafe fn classify_against(addr: usize, access_size: usize, m: ChunkPtr) -> Option<(Side, usize)> {
    let header = m.header();
    let user_beg = m.addr() + header.offset as usize;
    let user_end = user_beg + header.used_size;
    // The chunk's right redzone reaches past its own end into the next
    // chunk's slot (that's the shared gap two adjacent chunks poison
    // from opposite sides), so a right-side classification must reach
    // that far too, or an overflow landing in the gap is reported as
    // "to the left of" the next chunk instead of "to the right of" this one.
    let right_reach = m.addr() + header.size + config::get().redzone_size;

    if user_beg <= addr && addr + access_size <= user_end {
        return Some((Side::Inside, addr - user_beg));
    }

    if m.addr() <= addr && addr < user_beg {
        return Some((Side::Left, user_beg - addr));
    }

    if addr + access_size >= user_end && addr < right_reach {
        let distance = addr.saturating_sub(user_end);
        return Some((Side::Right, distance));
    }

    None
}

/// Finds the chunk that owns `addr`, classifying the access relative to
/// its user region. Ties between a chunk's left edge and the previous
/// chunk's right redzone favor the closer chunk, and the right-hand chunk
/// on an exact tie.
pub fn find_chunk_by_addr(addr: usize, access_size: usize) -> Option<Classification> {
    let group = page_group::find_page_group(addr)?;
    let m = unsafe { chunk_at(&group, addr) };
    let (side, distance) = unsafe { classify_against(addr, access_size, m) }?;

    if side != Side::Left || m.addr() == group.beg {
        return Some(Classification { chunk: m, side, distance });
    }

    let l_addr = m.addr() - group.size_of_chunk;
    let l = unsafe {
        chunk::ChunkPtr::new(std::ptr::NonNull::new_unchecked(
            l_addr as *mut chunk::ChunkHeader,
        ))
    };

    match unsafe { classify_against(addr, access_size, l) } {
        Some((Side::Right, l_distance)) if l_distance < distance => Some(Classification {
            chunk: l,
            side: Side::Right,
            distance: l_distance,
        }),
        _ => Some(Classification { chunk: m, side, distance }),
    }
}

/// Formats a human-readable description of `addr`, including allocation
/// (and, if freed, free) stacks.
pub fn describe(addr: usize, access_size: usize) -> String {
    let found = match find_chunk_by_addr(addr, access_size) {
        Some(f) => f,
        None => return format!("{:#x} is not associated with any known allocation", addr),
    };

    let header = unsafe { found.chunk.header() };
    let user_beg = found.chunk.addr() + header.offset as usize;

    let side = match found.side {
        Side::Inside => "inside of",
        Side::Left => "to the left of",
        Side::Right => "to the right of",
    };

    let mut out = format!(
        "{:#x} is located {} bytes {} a {}-byte region [{:#x}, {:#x})\n",
        addr,
        found.distance,
        side,
        header.used_size,
        user_beg,
        user_beg + header.used_size
    );

    out.push_str(&format!("allocated by thread T{}:\n", header.alloc_tid));
    out.push_str(&header.alloc_stack.print());

    if header.state == chunk::ChunkState::Quarantine {
        out.push_str(&format!("\nfreed by thread T{}:\n", header.free_tid));
        out.push_str(&header.free_stack.print());
    }

    out
}

/// Returns the usable size of the allocation at `p`, or 0 if `p` does not
/// currently own a live (`Allocated`) chunk.
pub fn allocation_size(p: usize) -> usize {
    match find_chunk_by_addr(p, 1) {
        Some(found) => {
            let header = unsafe { found.chunk.header() };
            if header.state == chunk::ChunkState::Allocated {
                header.used_size
            } else {
                0
            }
        }
        None => 0,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::page_group;

    #[test]
    fn inside_access_classifies_correctly() {
        let size = 4096;
        let head = page_group::get_new_chunks(size);
        unsafe {
            head.header().state = chunk::ChunkState::Allocated;
            head.header().offset = 16;
            head.header().used_size = 100;
        }

        let user_beg = head.addr() + 16;
        let found = find_chunk_by_addr(user_beg + 10, 1).expect("should resolve");
        assert_eq!(found.side, Side::Inside);
        assert_eq!(found.distance, 10);
    }

    #[test]
    fn right_access_classifies_correctly() {
        let size = 4096;
        let head = page_group::get_new_chunks(size);
        unsafe {
            head.header().state = chunk::ChunkState::Allocated;
            head.header().offset = 16;
            head.header().used_size = 100;
        }

        let user_beg = head.addr() + 16;
        let found = find_chunk_by_addr(user_beg + 100, 1).expect("should resolve");
        assert_eq!(found.side, Side::Right);
    }

    #[test]
    fn left_edge_tie_break_favors_the_closer_previous_chunk() {
        let size = 4096;
        let l = page_group::get_new_chunks(size);
        let m = unsafe { l.header().next }.expect("page group should carve more than one chunk");

        unsafe {
            l.header().state = chunk::ChunkState::Allocated;
            l.header().offset = 16;
            l.header().used_size = size - 20;

            m.header().state = chunk::ChunkState::Allocated;
            m.header().offset = 16;
            m.header().used_size = 100;
        }

        // `m.addr()` sits 4 bytes past `l`'s user region and 16 bytes
        // before `m`'s own user region: a tie an unextended AT_RIGHT check
        // on `l` would miss entirely, reporting this as left-of-`m` even
        // though it's closer to `l`'s overflow.
        let found = find_chunk_by_addr(m.addr(), 1).expect("should resolve");
        assert_eq!(found.chunk, l);
        assert_eq!(found.side, Side::Right);
        assert_eq!(found.distance, 4);
    }

    #[test]
    fn describe_mentions_the_region() {
        let size = 4096;
        let head = page_group::get_new_chunks(size);
        unsafe {
            head.header().state = chunk::ChunkState::Allocated;
            head.header().offset = 16;
            head.header().used_size = 100;
        }
        let user_beg = head.addr() + 16;
        let text = describe(user_beg + 5, 1);
        assert!(text.contains("byte region"));
    }
}
