//! Arena - page-aligned address-range allocator
//!
//! The arena reserves one large contiguous virtual region up front
//! (anonymous mapping, committed lazily by the OS) and carves page-aligned
//! spans out of it for the three managed memory kinds: obstack chunks,
//! interned objects, and large/pinned objects. Every span is tagged in the
//! [`KindMap`] so any pointer can be classified in O(1) without touching
//! the pointee.
//!
//! Span allocation is deliberately simple: a bump cursor over the
//! reservation plus a size-keyed freelist of returned spans. The obstack
//! recycles chunks aggressively on its own, so the freelist here mostly
//! sees whole-span churn from large objects and intern blocks.

pub mod kind_map;

pub use kind_map::{KindMap, MemoryKind, GRANULE_SIZE};

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use memmap2::MmapMut;
use parking_lot::Mutex;
use rill_util::round_up;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::ptr::NonNull;

struct ArenaInner {
    /// Bump cursor into the reservation (offset from base).
    cursor: usize,

    /// Freed spans, keyed by (span size, alignment): stack of addresses.
    freelist: BTreeMap<(usize, usize), Vec<usize>>,

    /// (size, alignment) of every live span, so `free` does not need them
    /// as arguments.
    span_sizes: FxHashMap<usize, (usize, usize)>,
}

/// The arena. One per runtime; see [`Arena::global`].
pub struct Arena {
    /// Keeps the reservation mapped. Never read through this directly.
    _reservation: MmapMut,

    base: usize,
    size: usize,

    kind_map: KindMap,
    inner: Mutex<ArenaInner>,
}

// Spans handed out are disjoint; the mapping itself is only touched
// through them.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

lazy_static::lazy_static! {
    static ref GLOBAL_ARENA: Arena =
        Arena::new(&RuntimeConfig::default()).expect("failed to reserve runtime arena");
}

impl Arena {
    /// Reserve the arena described by `config`.
    pub fn new(config: &RuntimeConfig) -> Result<Arena> {
        config.validate()?;
        let page = page_size::get().max(GRANULE_SIZE);
        let size = round_up(config.arena_reserve, page);

        let reservation = MmapMut::map_anon(size)
            .map_err(|_| RuntimeError::OutOfMemory { requested: size })?;
        let base = reservation.as_ptr() as usize;
        debug_assert_eq!(base % GRANULE_SIZE, 0);

        Ok(Arena {
            _reservation: reservation,
            base,
            size,
            kind_map: KindMap::new(),
            inner: Mutex::new(ArenaInner {
                cursor: 0,
                freelist: BTreeMap::new(),
                span_sizes: FxHashMap::default(),
            }),
        })
    }

    /// The process-wide arena.
    pub fn global() -> &'static Arena {
        &GLOBAL_ARENA
    }

    /// Allocate a span of at least `size` bytes tagged with `kind`.
    ///
    /// The returned address is granule-aligned; the span is a whole number
    /// of granules.
    pub fn alloc(&self, kind: MemoryKind, size: usize) -> Result<NonNull<u8>> {
        self.alloc_aligned(kind, size, GRANULE_SIZE)
    }

    /// Like [`Arena::alloc`] but with an explicit alignment (power of two,
    /// at least the granule size). Obstack chunks are size-aligned so a
    /// chunk base can be recovered from any interior pointer.
    pub fn alloc_aligned(
        &self,
        kind: MemoryKind,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>> {
        debug_assert_ne!(kind, MemoryKind::Unknown);
        debug_assert!(align.is_power_of_two() && align >= GRANULE_SIZE);
        let span = round_up(size.max(1), GRANULE_SIZE);

        let addr = {
            let mut inner = self.inner.lock();

            let recycled = inner
                .freelist
                .get_mut(&(span, align))
                .and_then(|stack| stack.pop());
            let addr = match recycled {
                Some(addr) => addr,
                None => {
                    let addr = round_up(self.base + inner.cursor, align);
                    let end = addr + span - self.base;
                    if end > self.size {
                        return Err(RuntimeError::OutOfMemory { requested: size });
                    }
                    inner.cursor = end;
                    addr
                }
            };
            inner.span_sizes.insert(addr, (span, align));
            addr
        };

        self.kind_map.set_memory_kind(addr, span, kind);
        log::trace!("arena alloc {:?} span {:#x}+{:#x}", kind, addr, span);

        // Safe: addr is inside the non-null reservation.
        Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }

    /// Return a span to the arena and untag it.
    pub fn free(&self, kind: MemoryKind, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let (span, _align) = {
            let mut inner = self.inner.lock();
            let key = inner
                .span_sizes
                .remove(&addr)
                .unwrap_or_else(|| crate::fatal!("arena free of unknown span {:#x}", addr));
            inner.freelist.entry(key).or_default().push(addr);
            key
        };
        self.kind_map.set_memory_kind(addr, span, MemoryKind::Unknown);
        log::trace!("arena free {:?} span {:#x}+{:#x}", kind, addr, span);
    }

    /// Classify an arbitrary address.
    #[inline]
    pub fn kind_of(&self, addr: usize) -> MemoryKind {
        self.kind_map.kind_of(addr)
    }

    /// Re-tag an address range (used when the collector converts a shadow
    /// area into live obstack memory).
    pub fn set_memory_kind(&self, addr: usize, len: usize, kind: MemoryKind) {
        self.kind_map.set_memory_kind(addr, len, kind);
    }

    /// Is `addr` inside the reservation?
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }
}

/// Classify an address against the global arena.
#[inline]
pub fn kind_of(addr: usize) -> MemoryKind {
    Arena::global().kind_of(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_tags_kind() {
        let arena = Arena::global();
        let ptr = arena.alloc(MemoryKind::Obstack, 16 * 1024).unwrap();
        let addr = ptr.as_ptr() as usize;
        assert_eq!(arena.kind_of(addr), MemoryKind::Obstack);
        assert_eq!(arena.kind_of(addr + 16 * 1024 - 1), MemoryKind::Obstack);
        arena.free(MemoryKind::Obstack, ptr);
        assert_eq!(arena.kind_of(addr), MemoryKind::Unknown);
    }

    #[test]
    fn test_small_alloc_rounds_to_granule() {
        let arena = Arena::global();
        let ptr = arena.alloc(MemoryKind::Large, 100).unwrap();
        let addr = ptr.as_ptr() as usize;
        assert_eq!(addr % GRANULE_SIZE, 0);
        assert_eq!(arena.kind_of(addr + GRANULE_SIZE - 1), MemoryKind::Large);
        arena.free(MemoryKind::Large, ptr);
    }

    #[test]
    fn test_recycles_spans() {
        let arena = Arena::global();
        let a = arena.alloc(MemoryKind::IObj, GRANULE_SIZE).unwrap();
        let addr = a.as_ptr() as usize;
        arena.free(MemoryKind::IObj, a);
        let b = arena.alloc(MemoryKind::IObj, GRANULE_SIZE).unwrap();
        assert_eq!(b.as_ptr() as usize, addr);
        arena.free(MemoryKind::IObj, b);
    }

    #[test]
    fn test_distinct_spans_disjoint() {
        let arena = Arena::global();
        let a = arena.alloc(MemoryKind::Obstack, 16 * 1024).unwrap();
        let b = arena.alloc(MemoryKind::Obstack, 16 * 1024).unwrap();
        let (a_addr, b_addr) = (a.as_ptr() as usize, b.as_ptr() as usize);
        assert!(a_addr + 16 * 1024 <= b_addr || b_addr + 16 * 1024 <= a_addr);
        arena.free(MemoryKind::Obstack, a);
        arena.free(MemoryKind::Obstack, b);
    }
}
