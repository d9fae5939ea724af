//! Pos - totally ordered obstack positions
//!
//! A `Pos` packs (chunk generation, byte offset within chunk) into one
//! word. Generations are assigned in allocation order starting at zero,
//! so relational comparison on the packed value orders positions by age
//! even though chunk addresses are arbitrary: older < younger.

use super::chunk::{ChunkHeader, CHUNK_SIZE};

const OFFSET_BITS: u32 = CHUNK_SIZE.trailing_zeros();
const OFFSET_MASK: u64 = (CHUNK_SIZE as u64) - 1;

/// Packed (generation, offset-in-chunk) position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pos(u64);

impl Pos {
    /// The zero position: start of generation zero.
    pub const ZERO: Pos = Pos(0);

    #[inline]
    pub fn new(generation: usize, offset_in_chunk: usize) -> Pos {
        debug_assert!(offset_in_chunk < CHUNK_SIZE);
        Pos(((generation as u64) << OFFSET_BITS) | offset_in_chunk as u64)
    }

    /// Compute the position of an address inside a live obstack chunk.
    ///
    /// # Safety
    ///
    /// `addr` must point into a chunk whose header is initialized.
    #[inline]
    pub unsafe fn from_address(addr: usize) -> Pos {
        let chunk = ChunkHeader::containing(addr);
        Pos::new((*chunk).generation, addr & OFFSET_MASK as usize)
    }

    #[inline]
    pub fn generation(self) -> usize {
        (self.0 >> OFFSET_BITS) as usize
    }

    #[inline]
    pub fn offset_in_chunk(self) -> usize {
        (self.0 & OFFSET_MASK) as usize
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Pos {
        Pos(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_roundtrip() {
        let pos = Pos::new(7, 1000);
        assert_eq!(pos.generation(), 7);
        assert_eq!(pos.offset_in_chunk(), 1000);
    }

    #[test]
    fn test_total_order() {
        // Older generation always compares below, regardless of offset.
        assert!(Pos::new(1, CHUNK_SIZE - 8) < Pos::new(2, 64));
        // Same generation: offset decides.
        assert!(Pos::new(3, 64) < Pos::new(3, 72));
        assert_eq!(Pos::new(4, 8), Pos::new(4, 8));
    }
}
