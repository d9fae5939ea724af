//! Obstack - per-thread bump heap with note/collect semantics
//!
//! The obstack grows incrementally: instead of freeing individual
//! allocations, positions are *noted* and memory is reclaimed by
//! collecting back to a previous note. Small allocations bump a pointer
//! through a chain of fixed-size chunks; oversized or pinned allocations
//! go to a side list of large objects; interned objects referenced by this
//! obstack are tracked in a refcount map so collecting past their
//! registration releases them.
//!
//! The collector (see [`collector`]) is copying: objects younger than the
//! collected note move, and handles plus explicit root arrays are
//! rewritten to follow them.

pub mod chunk;
pub mod collector;
pub mod freeze;
pub mod handle;
pub mod large;
pub mod pos;
pub mod stats;

pub use chunk::{CHUNK_CAPACITY, CHUNK_HEADER_SIZE, CHUNK_SIZE, LARGE_THRESHOLD};
pub use handle::Handle;
pub use pos::Pos;
pub use stats::{AllocStats, CollectMode};

use crate::arena::MemoryKind;
use crate::error::Result;
use crate::object::{IObj, IObjOrFake, ObjectKind, RObj, RObjOrFake, Type, ALLOC_ALIGN};
use chunk::{ChunkAllocator, ChunkHeader};
use handle::HandleNode;
use large::LargeObjHeader;
use rill_util::round_up;
use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use std::cell::Cell;
use std::ptr::NonNull;

/// Bookkeeping for one interned object held by this obstack.
struct IObjRef {
    /// Position of the registration; collecting past it drops the ref.
    pos: Pos,
    /// Previously registered iobj (payload address), forming a
    /// newest-first chain through the map.
    prev: usize,
}

/// The per-process bump heap.
pub struct Obstack {
    /// Bump pointer inside the current chunk.
    next_alloc: usize,

    /// Newest chunk; older chunks hang off `prev`.
    current_chunk: *mut ChunkHeader,

    chunk_allocator: ChunkAllocator,

    /// Newest large object, or null.
    current_large: *mut LargeObjHeader,

    /// Interned objects this obstack holds one reference to.
    iobj_refs: FxHashMap<usize, IObjRef>,

    /// Head of the newest-first registration chain (payload address).
    current_iobj: usize,

    /// Anchor of the circular handle list.
    handles: Box<HandleNode>,

    stats: AllocStats,

    /// Oldest position in this obstack (nothing older can be collected).
    first_note: Pos,
}

// An obstack is owned by exactly one process and accessed by the thread
// currently running that process.
unsafe impl Send for Obstack {}

thread_local! {
    static TL_OBSTACK: Cell<*mut Obstack> = const { Cell::new(std::ptr::null_mut()) };
}

impl Obstack {
    /// Create an obstack whose first chunk is generation zero.
    pub fn new() -> Result<Obstack> {
        Obstack::with_first_generation(0)
    }

    /// Create a worker obstack whose positions continue after
    /// `parent_note`, so every allocation it makes is younger than the
    /// parent position it will be joined at.
    pub fn new_worker(parent_note: Pos) -> Result<Obstack> {
        Obstack::with_first_generation(parent_note.generation() + 1)
    }

    fn with_first_generation(generation: usize) -> Result<Obstack> {
        let mut chunk_allocator = ChunkAllocator::new();
        let first = chunk_allocator.new_chunk(generation, std::ptr::null_mut())?;
        let next_alloc = unsafe { (*first).payload_start() };
        let mut stats = AllocStats::default();
        stats.modify_chunk(1);
        Ok(Obstack {
            next_alloc,
            current_chunk: first,
            chunk_allocator,
            current_large: std::ptr::null_mut(),
            iobj_refs: FxHashMap::default(),
            current_iobj: 0,
            handles: HandleNode::anchor(),
            stats,
            first_note: Pos::new(generation, CHUNK_HEADER_SIZE),
        })
    }

    /// Install `obstack` as the current thread's obstack, returning the
    /// previous installation.
    pub fn swap_cur(obstack: *mut Obstack) -> *mut Obstack {
        TL_OBSTACK.with(|tl| tl.replace(obstack))
    }

    /// Run `f` against the current thread's obstack.
    ///
    /// # Panics
    ///
    /// Panics if no obstack is installed (no process is running).
    pub fn with_cur<R>(f: impl FnOnce(&mut Obstack) -> R) -> R {
        let ptr = TL_OBSTACK.with(|tl| tl.get());
        assert!(!ptr.is_null(), "no obstack installed on this thread");
        f(unsafe { &mut *ptr })
    }

    /// Is an obstack installed on this thread?
    pub fn cur_is_installed() -> bool {
        TL_OBSTACK.with(|tl| !tl.get().is_null())
    }

    // ------------------------------------------------------------------
    // Notes and usage

    /// Record the current bump position. O(1), no allocation.
    #[inline]
    pub fn note(&self) -> Pos {
        unsafe { Pos::from_address(self.next_alloc) }
    }

    /// The oldest collectable position of this obstack.
    #[inline]
    pub fn first_note(&self) -> Pos {
        self.first_note
    }

    /// Resolve a note to its address inside the chunk chain.
    fn note_addr(&self, note: Pos) -> usize {
        let mut chunk = self.current_chunk;
        while !chunk.is_null() {
            let header = unsafe { &*chunk };
            if header.generation == note.generation() {
                return header.base() + note.offset_in_chunk();
            }
            chunk = header.prev;
        }
        crate::fatal!("note {:?} is not in this obstack", note);
    }

    /// Bytes of small allocation since `note`.
    fn small_usage_since(&self, note: Pos) -> usize {
        let mut total = 0;
        let mut chunk = self.current_chunk;
        let mut upper = self.next_alloc;
        while !chunk.is_null() {
            let header = unsafe { &*chunk };
            if header.generation < note.generation() {
                break;
            }
            let lower = if header.generation == note.generation() {
                header.base() + note.offset_in_chunk()
            } else {
                header.payload_start()
            };
            total += upper.saturating_sub(lower);
            if header.generation == note.generation() {
                break;
            }
            chunk = header.prev;
            upper = if chunk.is_null() {
                0
            } else {
                unsafe { (*chunk).end() }
            };
        }
        total
    }

    /// Bytes of large allocation since `note`.
    fn large_usage_since(&self, note: Pos) -> usize {
        let mut total = 0;
        let mut cursor = self.current_large;
        while !cursor.is_null() {
            let header = unsafe { &*cursor };
            if header.pin >= note {
                total += header.size;
            }
            cursor = header.next;
        }
        total
    }

    /// Memory usage since the given note.
    pub fn usage(&self, note: Pos) -> usize {
        self.small_usage_since(note) + self.large_usage_since(note)
    }

    /// Total memory usage of this obstack.
    pub fn total_usage(&self) -> usize {
        self.usage(self.first_note)
    }

    // ------------------------------------------------------------------
    // Allocation

    #[inline]
    fn current_generation(&self) -> usize {
        unsafe { (*self.current_chunk).generation }
    }

    /// Bump-allocate `size` bytes (already 8-aligned, fits a chunk).
    ///
    /// The bump pointer never reaches the chunk end exactly: a position
    /// at the boundary would mask to the next chunk's base, corrupting
    /// every Pos computed from it.
    fn alloc_small(&mut self, size: usize) -> Result<usize> {
        debug_assert!(size <= CHUNK_CAPACITY);
        debug_assert_eq!(size % ALLOC_ALIGN, 0);
        let end = unsafe { (*self.current_chunk).end() };
        if self.next_alloc + size >= end {
            self.stats.alloc_fragment(end - self.next_alloc);
            let chunk = self
                .chunk_allocator
                .new_chunk(self.current_generation() + 1, self.current_chunk)?;
            self.stats.modify_chunk(1);
            self.current_chunk = chunk;
            self.next_alloc = unsafe { (*chunk).payload_start() };
        }
        let addr = self.next_alloc;
        self.next_alloc += size;
        Ok(addr)
    }

    /// Allocate `size` bytes of 8-byte-aligned storage.
    ///
    /// Oversized requests divert to the large-object list; the returned
    /// pointer is the start of the block either way.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        let size = round_up(size.max(ALLOC_ALIGN), ALLOC_ALIGN);
        if size > LARGE_THRESHOLD {
            return self.alloc_large(size, false);
        }
        self.stats.alloc_small(size);
        let addr = self.alloc_small(size)?;
        Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }

    /// Allocate zeroed storage.
    pub fn calloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        let mem = self.alloc(size)?;
        unsafe {
            std::ptr::write_bytes(mem.as_ptr(), 0, round_up(size.max(ALLOC_ALIGN), ALLOC_ALIGN))
        };
        Ok(mem)
    }

    /// Allocate storage that will never be moved by the collector.
    pub fn alloc_pinned(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.alloc_large(round_up(size.max(ALLOC_ALIGN), ALLOC_ALIGN), true)
    }

    fn alloc_large(&mut self, size: usize, pinned: bool) -> Result<NonNull<u8>> {
        let pin = self.note();
        let header = LargeObjHeader::alloc(size, pin, pinned, self.current_large)?;
        self.current_large = header;
        self.stats.alloc_large(size);
        self.stats.modify_large(1, size as isize);
        Ok(unsafe { NonNull::new_unchecked((*header).data_start() as *mut u8) })
    }

    /// Allocate an object of a class or invocation type, with zeroed
    /// payload and initialized metadata.
    pub fn alloc_object(&mut self, type_: &'static Type) -> Result<RObj> {
        debug_assert!(matches!(
            type_.kind(),
            ObjectKind::Class | ObjectKind::Invocation | ObjectKind::CycleHandle
        ));
        let meta = type_.uninterned_metadata_byte_size();
        let size = meta + type_.user_byte_size();
        let mem = self.alloc(size)?.as_ptr() as usize;
        unsafe { std::ptr::write_bytes(mem as *mut u8, 0, size) };
        let obj = unsafe { RObj::from_addr(mem + meta) };
        obj.set_vtable(type_.vtable());
        Ok(obj)
    }

    /// Allocate an array instance with `len` elements, zeroed.
    pub fn alloc_array(&mut self, type_: &'static Type, len: usize) -> Result<RObj> {
        debug_assert_eq!(type_.kind(), ObjectKind::Array);
        let meta = type_.uninterned_metadata_byte_size();
        let size = meta + type_.user_byte_size() * len;
        let mem = self.alloc(size)?.as_ptr() as usize;
        unsafe { std::ptr::write_bytes(mem as *mut u8, 0, size) };
        let obj = unsafe { RObj::from_addr(mem + meta) };
        obj.set_size_word(len);
        obj.set_vtable(type_.vtable());
        Ok(obj)
    }

    /// Allocate a long-string instance holding `bytes`.
    pub fn alloc_string_bytes(
        &mut self,
        type_: &'static Type,
        bytes: &[u8],
        size_word: usize,
    ) -> Result<RObj> {
        debug_assert_eq!(type_.kind(), ObjectKind::String);
        let meta = type_.uninterned_metadata_byte_size();
        let size = meta + round_up(bytes.len().max(1), ALLOC_ALIGN);
        let mem = self.alloc(size)?.as_ptr() as usize;
        unsafe { std::ptr::write_bytes(mem as *mut u8, 0, size) };
        let obj = unsafe { RObj::from_addr(mem + meta) };
        obj.set_size_word(size_word);
        obj.set_vtable(type_.vtable());
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), obj.payload_ptr(), bytes.len());
        }
        Ok(obj)
    }

    /// Shallow-clone `obj` into this obstack (payload bytes and size
    /// word; references are shared).
    pub fn shallow_clone(&mut self, obj: RObj) -> Result<RObj> {
        let type_ = obj.type_();
        let meta = type_.uninterned_metadata_byte_size();
        let size = meta + obj.payload_byte_size();
        let mem = self.alloc(size)?.as_ptr() as usize;
        unsafe {
            std::ptr::copy_nonoverlapping(
                (obj.addr() - meta) as *const u8,
                mem as *mut u8,
                size,
            );
        }
        Ok(unsafe { RObj::from_addr(mem + meta) })
    }

    /// Store a reference into an object slot. Debug builds verify the
    /// destination is runtime-managed memory.
    pub fn store(&mut self, slot: *mut RObjOrFake, value: RObjOrFake) {
        debug_assert_ne!(
            crate::arena::kind_of(slot as usize),
            MemoryKind::Unknown,
            "store target is not runtime memory"
        );
        unsafe { *slot = value };
    }

    /// Write one element of an array without bounds checking beyond debug
    /// assertions.
    pub fn vector_unsafe_set(&mut self, array: RObj, index: usize, value: RObjOrFake) {
        debug_assert_eq!(array.type_().kind(), ObjectKind::Array);
        debug_assert!(index < array.array_len());
        let slot_bytes = array.type_().user_byte_size();
        let slot = (array.addr() + index * slot_bytes) as *mut RObjOrFake;
        unsafe { *slot = value };
    }

    // ------------------------------------------------------------------
    // Interned-object references

    /// Intern `obj` and register the resulting reference with this
    /// obstack: it is released when the current position is collected.
    pub fn intern(&mut self, obj: RObjOrFake) -> Result<IObjOrFake> {
        if !obj.is_ptr() {
            return Ok(obj.as_iobj_or_fake());
        }
        let iobj = crate::intern::intern(obj.unwrap_ptr())?;
        self.adopt_iobj_ref(iobj);
        Ok(IObjOrFake::from_obj(iobj))
    }

    /// Register an already-interned object as a root of this obstack.
    /// Increfs if this obstack was not already holding a reference.
    pub fn register_iobj(&mut self, obj: IObjOrFake) -> IObjOrFake {
        if let Some(iobj) = obj.ptr() {
            if !self.iobj_refs.contains_key(&iobj.addr()) {
                iobj.incref();
                self.record_iobj_ref(iobj);
            }
        }
        obj
    }

    /// Take ownership of one reference to `iobj` (the caller already
    /// holds the refcount being transferred).
    pub(crate) fn adopt_iobj_ref(&mut self, iobj: IObj) {
        if self.iobj_refs.contains_key(&iobj.addr()) {
            // Already holding one reference; fold the new one away.
            crate::lock::safe_decref_iobj(iobj);
        } else {
            self.record_iobj_ref(iobj);
        }
    }

    fn record_iobj_ref(&mut self, iobj: IObj) {
        let pos = self.note();
        self.iobj_refs.insert(
            iobj.addr(),
            IObjRef {
                pos,
                prev: self.current_iobj,
            },
        );
        self.current_iobj = iobj.addr();
        self.stats.modify_intern(1);
    }

    /// Number of interned objects currently referenced.
    pub fn iobj_count(&self) -> usize {
        self.iobj_refs.len()
    }

    /// Does this obstack hold a reference to `iobj`?
    pub fn holds_iobj(&self, iobj: IObj) -> bool {
        self.iobj_refs.contains_key(&iobj.addr())
    }

    /// Drop registrations made at or after `note`, keeping `survivors`.
    /// Survivor registrations are rewritten at `note`.
    fn sweep_iobjs(&mut self, note: Pos, survivors: Option<&FxHashSet<usize>>) {
        let mut survivors_chain = Vec::new();
        let mut cursor = self.current_iobj;
        while cursor != 0 {
            let entry = match self.iobj_refs.get(&cursor) {
                Some(entry) => entry,
                None => break,
            };
            if entry.pos < note {
                break;
            }
            let prev = entry.prev;
            let keep = survivors.map(|set| set.contains(&cursor)).unwrap_or(false);
            if keep {
                survivors_chain.push(cursor);
            } else {
                self.iobj_refs.remove(&cursor);
                self.stats.modify_intern(-1);
                crate::lock::safe_decref_iobj(unsafe { IObj::from_addr(cursor) });
            }
            cursor = prev;
        }
        // Rebuild the head of the chain: survivors, rewritten at `note`,
        // in front of the untouched older entries.
        self.current_iobj = cursor;
        for &addr in survivors_chain.iter().rev() {
            let prev = self.current_iobj;
            if let Some(entry) = self.iobj_refs.get_mut(&addr) {
                entry.pos = note;
                entry.prev = prev;
            }
            self.current_iobj = addr;
        }
    }

    // ------------------------------------------------------------------
    // Handles

    /// Create a movable root for `value`, owned by the current process.
    pub fn make_handle(&mut self, value: RObjOrFake) -> Handle {
        Handle::new(&self.handles, value, crate::process::Process::current_ref())
    }

    /// Are there any registered handles?
    pub fn any_handles(&self) -> bool {
        self.handles.any()
    }

    /// Are there any handles wrapping real pointers?
    pub fn any_valid_handles(&self) -> bool {
        self.handles.any_valid()
    }

    pub(crate) fn handle_anchor(&self) -> &HandleNode {
        &self.handles
    }

    // ------------------------------------------------------------------
    // Collection

    /// Collect everything younger than `note` with no extra roots (the
    /// handles are still roots).
    pub fn collect(&mut self, note: Pos) {
        self.collect_roots(note, &mut []);
    }

    /// Collect everything younger than `note`, keeping `roots` (and
    /// handles) alive. Root slots are updated in place.
    pub fn collect_roots(&mut self, note: Pos, roots: &mut [RObjOrFake]) {
        collector::collect(self, note, roots, CollectMode::Manual);
    }

    /// Deep-freeze `obj`, returning a structurally frozen snapshot.
    pub fn freeze(&mut self, obj: RObjOrFake) -> Result<RObjOrFake> {
        freeze::freeze(self, obj)
    }

    // ------------------------------------------------------------------
    // Child adoption

    /// Steal everything from a finished worker obstack: chunks, large
    /// objects, iobj references, handles, stats. The child is left empty.
    ///
    /// `new_owner` becomes the owner of every migrated handle.
    pub fn absorb(&mut self, child: &mut Obstack, new_owner: &crate::process::ProcessRef) {
        let join_note = self.note();

        // Chunks: renumber the child chain to continue our generations,
        // then splice it in as our newest chunks.
        let mut child_chunks = Vec::new();
        let mut cursor = child.current_chunk;
        while !cursor.is_null() {
            child_chunks.push(cursor);
            cursor = unsafe { (*cursor).prev };
        }
        if !child_chunks.is_empty() {
            let end = unsafe { (*self.current_chunk).end() };
            self.stats.alloc_fragment(end - self.next_alloc);
            let mut generation = self.current_generation();
            for &chunk in child_chunks.iter().rev() {
                generation += 1;
                unsafe { (*chunk).generation = generation };
            }
            let last_chunk = child_chunks[child_chunks.len() - 1];
            unsafe {
                (*last_chunk).prev = self.current_chunk;
            }
            self.current_chunk = child_chunks[0];
            self.next_alloc = child.next_alloc;
        }
        child.current_chunk = std::ptr::null_mut();
        child.next_alloc = 0;

        // Large objects: adopt at the join position.
        if !child.current_large.is_null() {
            let mut cursor = child.current_large;
            let mut tail = cursor;
            while !cursor.is_null() {
                // Child pins live in the child's position space; adopt
                // them conservatively at the join position.
                unsafe { (*cursor).pin = join_note };
                tail = cursor;
                cursor = unsafe { (*cursor).next };
            }
            unsafe { (*tail).next = self.current_large };
            self.current_large = child.current_large;
            child.current_large = std::ptr::null_mut();
        }

        // IObj references: adopt, folding duplicates.
        let child_refs = std::mem::take(&mut child.iobj_refs);
        child.current_iobj = 0;
        for (addr, _) in child_refs {
            let iobj = unsafe { IObj::from_addr(addr) };
            self.adopt_iobj_ref(iobj);
        }

        // Handles: migrate and reassign ownership.
        self.handles.splice_from(&child.handles, new_owner);

        self.stats.merge(&child.stats);
        child.stats = AllocStats::default();
    }

    pub fn stats(&self) -> &AllocStats {
        &self.stats
    }

    /// Debug check of the chunk chain and bump pointer.
    pub fn verify_invariants(&self) {
        if cfg!(debug_assertions) {
            let end = unsafe { (*self.current_chunk).end() };
            let start = unsafe { (*self.current_chunk).payload_start() };
            assert!(self.next_alloc >= start && self.next_alloc <= end);
            let mut cursor = self.current_chunk;
            let mut last_generation = usize::MAX;
            while !cursor.is_null() {
                let header = unsafe { &*cursor };
                assert!(header.generation < last_generation || last_generation == usize::MAX);
                last_generation = header.generation;
                cursor = header.prev;
            }
        }
    }
}

impl Drop for Obstack {
    fn drop(&mut self) {
        // Release every interned reference.
        let mut cursor = self.current_iobj;
        while cursor != 0 {
            let prev = self.iobj_refs.get(&cursor).map(|r| r.prev).unwrap_or(0);
            crate::lock::safe_decref_iobj(unsafe { IObj::from_addr(cursor) });
            cursor = prev;
        }
        self.iobj_refs.clear();

        // Free large objects.
        let mut cursor = self.current_large;
        while !cursor.is_null() {
            let next = unsafe { (*cursor).next };
            LargeObjHeader::free(cursor);
            cursor = next;
        }

        // Free chunks.
        let mut cursor = self.current_chunk;
        while !cursor.is_null() {
            let prev = unsafe { (*cursor).prev };
            self.chunk_allocator.delete_chunk(cursor);
            cursor = prev;
        }

        if log::log_enabled!(log::Level::Debug) {
            self.stats.report();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Type;

    fn ref_pair_type() -> &'static Type {
        Type::class_factory("ObPair", 16, &[0, 8])
    }

    #[test]
    fn test_note_orders_with_allocation() {
        let mut ob = Obstack::new().unwrap();
        let n1 = ob.note();
        ob.alloc(64).unwrap();
        let n2 = ob.note();
        assert!(n1 < n2);
    }

    #[test]
    fn test_alloc_is_aligned() {
        let mut ob = Obstack::new().unwrap();
        for size in [1, 7, 13, 100, 255] {
            let mem = ob.alloc(size).unwrap();
            assert_eq!(mem.as_ptr() as usize % ALLOC_ALIGN, 0);
        }
    }

    #[test]
    fn test_usage_counts_small() {
        let mut ob = Obstack::new().unwrap();
        let note = ob.note();
        ob.alloc(64).unwrap();
        ob.alloc(32).unwrap();
        assert_eq!(ob.usage(note), 96);
    }

    #[test]
    fn test_overflow_opens_chunk() {
        let mut ob = Obstack::new().unwrap();
        let note = ob.note();
        let before = ob.stats().cur_chunk_count();
        for _ in 0..(CHUNK_SIZE / 512) + 2 {
            ob.alloc(512).unwrap();
        }
        assert!(ob.stats().cur_chunk_count() > before);
        ob.verify_invariants();
        assert!(ob.usage(note) >= 512 * ((CHUNK_SIZE / 512) + 2));
    }

    #[test]
    fn test_large_allocation_diverts() {
        let mut ob = Obstack::new().unwrap();
        let mem = ob.alloc(CHUNK_SIZE * 2).unwrap();
        assert_eq!(crate::arena::kind_of(mem.as_ptr() as usize), MemoryKind::Large);
        assert_eq!(ob.stats().cur_large_count(), 1);
    }

    #[test]
    fn test_pinned_is_large_regardless_of_size() {
        let mut ob = Obstack::new().unwrap();
        let mem = ob.alloc_pinned(16).unwrap();
        assert_eq!(crate::arena::kind_of(mem.as_ptr() as usize), MemoryKind::Large);
    }

    #[test]
    fn test_alloc_object_layout() {
        let mut ob = Obstack::new().unwrap();
        let obj = ob.alloc_object(ref_pair_type()).unwrap();
        assert_eq!(obj.payload_byte_size(), 16);
        assert!(!obj.is_frozen());
        assert_eq!(crate::arena::kind_of(obj.addr()), MemoryKind::Obstack);
    }

    #[test]
    fn test_alloc_array_layout() {
        let array_type = Type::array_factory("ObWordArray", 8, &[], Default::default());
        let mut ob = Obstack::new().unwrap();
        let arr = ob.alloc_array(array_type, 10).unwrap();
        assert_eq!(arr.array_len(), 10);
        assert_eq!(arr.payload_byte_size(), 80);
    }

    #[test]
    fn test_shallow_clone_copies_payload() {
        let mut ob = Obstack::new().unwrap();
        let obj = ob.alloc_object(ref_pair_type()).unwrap();
        unsafe { *(obj.addr() as *mut u64) = 0xdead_beef };
        let copy = ob.shallow_clone(obj).unwrap();
        assert_ne!(copy.addr(), obj.addr());
        assert_eq!(unsafe { *(copy.addr() as *const u64) }, 0xdead_beef);
    }

    #[test]
    fn test_worker_positions_are_younger() {
        let mut parent = Obstack::new().unwrap();
        parent.alloc(64).unwrap();
        let note = parent.note();
        let worker = Obstack::new_worker(note).unwrap();
        assert!(worker.note() > note);
    }
}
