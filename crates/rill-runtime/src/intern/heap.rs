//! Interner heap - storage for canonical objects
//!
//! Interned objects are individually freed on finalization, so bump
//! allocation alone does not work here. The heap carves 64 KiB spans out
//! of the arena (tagged `MemoryKind::IObj` so the collector can classify
//! interned pointers in O(1)) and runs a segregated freelist over them:
//! sizes up to 4 KiB round to 8-byte size classes, anything larger gets a
//! dedicated arena span.

use crate::arena::{Arena, MemoryKind};
use crate::error::Result;
use parking_lot::Mutex;
use rill_util::round_up;
use std::ptr::NonNull;

const SPAN_SIZE: usize = 64 * 1024;
const MAX_CLASS_BYTES: usize = 4096;
const CLASS_COUNT: usize = MAX_CLASS_BYTES / 8 + 1;

struct HeapInner {
    /// Bump region inside the current span.
    cursor: usize,
    remaining: usize,

    /// Freelists indexed by size / 8.
    classes: Vec<Vec<usize>>,
}

/// The process-wide interner heap.
pub struct InternHeap {
    inner: Mutex<HeapInner>,
}

lazy_static::lazy_static! {
    static ref HEAP: InternHeap = InternHeap {
        inner: Mutex::new(HeapInner {
            cursor: 0,
            remaining: 0,
            classes: vec![Vec::new(); CLASS_COUNT],
        }),
    };
}

impl InternHeap {
    pub fn global() -> &'static InternHeap {
        &HEAP
    }

    /// Allocate `size` bytes of zeroed, 8-aligned interner storage.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        let size = round_up(size.max(8), 8);
        if size > MAX_CLASS_BYTES {
            let mem = Arena::global().alloc(MemoryKind::IObj, size)?;
            unsafe { std::ptr::write_bytes(mem.as_ptr(), 0, size) };
            return Ok(mem);
        }

        let mut inner = self.inner.lock();
        if let Some(addr) = inner.classes[size / 8].pop() {
            unsafe { std::ptr::write_bytes(addr as *mut u8, 0, size) };
            return Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) });
        }
        if inner.remaining < size {
            // Leftover tail of the old span goes to a freelist class so it
            // is not lost.
            if inner.remaining >= 8 {
                let tail = inner.cursor;
                let tail_size = inner.remaining & !7;
                inner.classes[tail_size / 8].push(tail);
            }
            let span = Arena::global().alloc(MemoryKind::IObj, SPAN_SIZE)?;
            inner.cursor = span.as_ptr() as usize;
            inner.remaining = SPAN_SIZE;
        }
        let addr = inner.cursor;
        inner.cursor += size;
        inner.remaining -= size;
        drop(inner);

        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, size) };
        Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }

    /// Return a block to the heap.
    pub fn free(&self, ptr: NonNull<u8>, size: usize) {
        let size = round_up(size.max(8), 8);
        if size > MAX_CLASS_BYTES {
            Arena::global().free(MemoryKind::IObj, ptr);
            return;
        }
        let mut inner = self.inner.lock();
        inner.classes[size / 8].push(ptr.as_ptr() as usize);
    }
}
