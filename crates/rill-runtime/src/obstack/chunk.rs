//! Chunks - fixed-size blocks of obstack memory
//!
//! Chunks are 16 KiB, allocated size-aligned from the arena so the chunk
//! base (and from it the generation) can be recovered from any interior
//! pointer with one mask. The header occupies the first 64 bytes; the
//! rest is bump-allocated payload.

use crate::arena::{Arena, MemoryKind};
use crate::error::Result;
use std::ptr::NonNull;

/// Chunk size in bytes. Also the chunk alignment.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Bytes reserved for the header at the start of each chunk.
pub const CHUNK_HEADER_SIZE: usize = 64;

/// Usable payload bytes per chunk. The final word stays reserved so the
/// bump pointer can never sit exactly on the chunk boundary.
pub const CHUNK_CAPACITY: usize = CHUNK_SIZE - CHUNK_HEADER_SIZE - 8;

/// Allocations larger than this go to the large-object list: they could
/// never fit a fresh chunk.
pub const LARGE_THRESHOLD: usize = CHUNK_CAPACITY;

/// Header at the base of every chunk.
#[repr(C)]
pub struct ChunkHeader {
    /// Generation number; the high bits of every Pos inside this chunk.
    pub generation: usize,

    /// Next-older chunk in this obstack's list, or null.
    pub prev: *mut ChunkHeader,
}

static_assertions::const_assert!(std::mem::size_of::<ChunkHeader>() <= CHUNK_HEADER_SIZE);

impl ChunkHeader {
    /// The chunk containing `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must point into a live chunk.
    #[inline]
    pub unsafe fn containing(addr: usize) -> *mut ChunkHeader {
        (addr & !(CHUNK_SIZE - 1)) as *mut ChunkHeader
    }

    #[inline]
    pub fn base(&self) -> usize {
        self as *const ChunkHeader as usize
    }

    /// First allocatable address.
    #[inline]
    pub fn payload_start(&self) -> usize {
        self.base() + CHUNK_HEADER_SIZE
    }

    /// One past the last allocatable address.
    #[inline]
    pub fn end(&self) -> usize {
        self.base() + CHUNK_SIZE
    }
}

/// Allocates and recycles raw chunks for one obstack.
///
/// Freed chunks are kept on a local freelist up to a garbage limit; the
/// excess goes back to the arena. The freelist makes the common
/// note/collect churn of a hot loop allocation-free.
pub struct ChunkAllocator {
    freelist: Vec<usize>,
    garbage_limit: usize,
}

impl ChunkAllocator {
    pub fn new() -> ChunkAllocator {
        ChunkAllocator {
            freelist: Vec::new(),
            garbage_limit: 16,
        }
    }

    /// Allocate a chunk and initialize its header.
    pub fn new_chunk(
        &mut self,
        generation: usize,
        prev: *mut ChunkHeader,
    ) -> Result<*mut ChunkHeader> {
        let base = match self.freelist.pop() {
            Some(base) => {
                // Recycled spans keep their arena tag only while live;
                // re-tag.
                Arena::global().set_memory_kind(base, CHUNK_SIZE, MemoryKind::Obstack);
                base
            }
            None => Arena::global()
                .alloc_aligned(MemoryKind::Obstack, CHUNK_SIZE, CHUNK_SIZE)?
                .as_ptr() as usize,
        };

        let header = base as *mut ChunkHeader;
        unsafe {
            (*header).generation = generation;
            (*header).prev = prev;
        }
        Ok(header)
    }

    /// Return a chunk to the freelist (and the excess to the arena).
    pub fn delete_chunk(&mut self, chunk: *mut ChunkHeader) {
        let base = chunk as usize;
        Arena::global().set_memory_kind(base, CHUNK_SIZE, MemoryKind::Unknown);
        self.freelist.push(base);
        if self.freelist.len() > self.garbage_limit {
            self.collect_garbage();
        }
    }

    /// Release freelisted chunks back to the arena, keeping a small
    /// working set.
    pub fn collect_garbage(&mut self) {
        while self.freelist.len() > self.garbage_limit / 2 {
            let base = self.freelist.pop().expect("freelist non-empty");
            Arena::global().free(
                MemoryKind::Obstack,
                unsafe { NonNull::new_unchecked(base as *mut u8) },
            );
        }
    }
}

impl Drop for ChunkAllocator {
    fn drop(&mut self) {
        let garbage_limit = std::mem::replace(&mut self.garbage_limit, 0);
        self.collect_garbage();
        self.garbage_limit = garbage_limit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_is_size_aligned() {
        let mut alloc = ChunkAllocator::new();
        let chunk = alloc.new_chunk(0, std::ptr::null_mut()).unwrap();
        assert_eq!(chunk as usize % CHUNK_SIZE, 0);
        unsafe {
            assert_eq!((*chunk).generation, 0);
            assert!((*chunk).prev.is_null());
        }
        alloc.delete_chunk(chunk);
    }

    #[test]
    fn test_containing_recovers_header() {
        let mut alloc = ChunkAllocator::new();
        let chunk = alloc.new_chunk(9, std::ptr::null_mut()).unwrap();
        let inner = unsafe { (*chunk).payload_start() } + 100;
        let found = unsafe { ChunkHeader::containing(inner) };
        assert_eq!(found, chunk);
        assert_eq!(unsafe { (*found).generation }, 9);
        alloc.delete_chunk(chunk);
    }

    #[test]
    fn test_freelist_recycles() {
        let mut alloc = ChunkAllocator::new();
        let chunk = alloc.new_chunk(1, std::ptr::null_mut()).unwrap();
        let base = chunk as usize;
        alloc.delete_chunk(chunk);
        let again = alloc.new_chunk(2, std::ptr::null_mut()).unwrap();
        assert_eq!(again as usize, base);
        alloc.delete_chunk(again);
    }
}
