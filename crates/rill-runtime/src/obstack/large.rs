//! Large and pinned object storage
//!
//! Objects that cannot fit a fresh chunk, and objects allocated pinned,
//! live outside the chunk chain: each gets its own arena span with a
//! header recording the owner list linkage, the payload size, and the pin
//! position. The pin is the Pos the object logically occupies; the
//! collector frees a large object when its pin is younger than the
//! collection note and nothing reachable kept it alive.
//!
//! Span layout:
//!
//! ```text
//! ┌───────────────┬─────────────────────┬──────────────┐
//! │ LargeObjHeader│ object metadata ... │ user payload │
//! └───────────────┴─────────────────────┴──────────────┘
//! ```
//!
//! Large objects never move; the collector only patches their reference
//! slots and advances their pins.

use super::pos::Pos;
use crate::arena::{Arena, MemoryKind};
use crate::error::Result;
use rill_util::round_up;
use std::ptr::NonNull;

/// Bytes reserved for the header at the start of each large span.
pub const LARGE_HEADER_SIZE: usize = 64;

/// Header preceding every large or pinned allocation.
#[repr(C)]
pub struct LargeObjHeader {
    /// Next-older large object in the owning obstack's list.
    pub next: *mut LargeObjHeader,

    /// Metadata + payload bytes following this header.
    pub size: usize,

    /// The obstack position this object is pinned at.
    pub pin: Pos,

    /// Was this allocated through `alloc_pinned` (never relocatable and
    /// survives as long as explicitly rooted)?
    pub pinned: bool,
}

static_assertions::const_assert!(std::mem::size_of::<LargeObjHeader>() <= LARGE_HEADER_SIZE);

impl LargeObjHeader {
    /// Allocate a large span. `size` covers object metadata + payload.
    pub fn alloc(
        size: usize,
        pin: Pos,
        pinned: bool,
        next: *mut LargeObjHeader,
    ) -> Result<*mut LargeObjHeader> {
        let total = LARGE_HEADER_SIZE + round_up(size, 8);
        let base = Arena::global().alloc(MemoryKind::Large, total)?.as_ptr() as usize;
        let header = base as *mut LargeObjHeader;
        unsafe {
            (*header).next = next;
            (*header).size = size;
            (*header).pin = pin;
            (*header).pinned = pinned;
            // Large allocations are handed out zeroed so partially
            // initialized metadata never confuses the collector.
            std::ptr::write_bytes((base + LARGE_HEADER_SIZE) as *mut u8, 0, round_up(size, 8));
        }
        Ok(header)
    }

    /// Free the whole span.
    pub fn free(header: *mut LargeObjHeader) {
        let base = header as usize;
        Arena::global().free(MemoryKind::Large, unsafe {
            NonNull::new_unchecked(base as *mut u8)
        });
    }

    /// First byte after the header (start of object metadata).
    #[inline]
    pub fn data_start(&self) -> usize {
        self as *const LargeObjHeader as usize + LARGE_HEADER_SIZE
    }

    /// Recover the header from the start of its data area.
    ///
    /// # Safety
    ///
    /// `data_start` must have been returned by [`LargeObjHeader::data_start`].
    #[inline]
    pub unsafe fn from_data_start(data_start: usize) -> *mut LargeObjHeader {
        (data_start - LARGE_HEADER_SIZE) as *mut LargeObjHeader
    }

    /// Recover the header for an object payload inside a large span.
    ///
    /// The span base is granule-aligned and the kind map already told the
    /// caller this address is `MemoryKind::Large`; the header sits at the
    /// start of the granule run. Because every span begins with the
    /// header, masking down to the granule that starts the span requires
    /// walking granules backwards; instead the collector records the
    /// metadata size from the object's type, which is what this helper
    /// takes.
    #[inline]
    pub unsafe fn from_payload(payload_addr: usize, metadata_bytes: usize) -> *mut LargeObjHeader {
        Self::from_data_start(payload_addr - metadata_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_layout() {
        let header = LargeObjHeader::alloc(100, Pos::ZERO, false, std::ptr::null_mut()).unwrap();
        unsafe {
            assert_eq!((*header).size, 100);
            assert!(!(*header).pinned);
            let data = (*header).data_start();
            assert_eq!(data % 8, 0);
            assert_eq!(LargeObjHeader::from_data_start(data), header);
            // Data area is zeroed.
            assert_eq!(*(data as *const u64), 0);
        }
        LargeObjHeader::free(header);
    }

    #[test]
    fn test_from_payload() {
        let header = LargeObjHeader::alloc(64, Pos::ZERO, true, std::ptr::null_mut()).unwrap();
        unsafe {
            let payload = (*header).data_start() + 8;
            assert_eq!(LargeObjHeader::from_payload(payload, 8), header);
        }
        LargeObjHeader::free(header);
    }
}
