//! Copying collector
//!
//! Collects the range `[note, next_alloc)` of one obstack, single-threaded
//! and stop-the-world within the owning process. Reachable objects younger
//! than the note are evacuated into a shadow buffer, the young chunks are
//! released, and the survivors are re-allocated at the note, with every
//! recorded reference slot patched to the new addresses.
//!
//! Trace rules per slot value:
//! - fake or null: skipped without dereferencing.
//! - interned object: kept; the obstack's iobj-ref bookkeeping decides
//!   which references survive.
//! - obstack object older than the note: scanned once in place, never
//!   moved.
//! - obstack object younger than the note: copied to the shadow buffer;
//!   the original's metadata word becomes a forwarding marker.
//! - large object: never moved; its slots are scanned and its pin is
//!   pulled back to the note if it survives.
//!
//! Failure policy: the collector itself never allocates through a path
//! that could re-enter collection, and any internal inconsistency aborts.

use super::large::LargeObjHeader;
use super::pos::Pos;
use super::stats::CollectMode;
use super::Obstack;
use crate::arena::{kind_of, MemoryKind};
use crate::object::{RObj, RObjOrFake, FORWARD_TAG, STRIPE_COLLECT, WORD_SIZE};
use rustc_hash::FxHashSet;

/// One evacuated object in the shadow buffer.
struct ShadowRec {
    /// Byte offset of the record in the shadow buffer (metadata start).
    offset: usize,
    /// Metadata bytes preceding the payload.
    meta: usize,
    /// Total bytes (metadata + payload).
    total: usize,
    /// Final payload address, filled in during installation.
    final_payload: usize,
}

/// Transient collector state. Does not borrow the obstack; the driver
/// threads both through every step.
struct Scratch {
    note: Pos,
    shadow: Vec<u64>,
    shadow_bytes: usize,
    recs: Vec<ShadowRec>,
    /// Slots currently holding a forwarding marker, to patch later.
    patches: Vec<*mut usize>,
    /// Slots still to examine.
    work: Vec<*mut usize>,
    visited_old: FxHashSet<usize>,
    surviving_iobjs: FxHashSet<usize>,
    surviving_large: FxHashSet<usize>,
    scanned_bytes: usize,
    visit_count: usize,
}

// Forwarding markers reuse the metadata tag bits: the "address" half of
// the word carries the shadow record index.
#[inline]
fn marker_for(rec_index: usize) -> usize {
    crate::object::robj::MetaWord::pack(rec_index << 3, FORWARD_TAG).bits()
}

#[inline]
fn rec_of_marker(word: usize) -> usize {
    let marker = crate::object::robj::MetaWord::from_bits(word);
    debug_assert_ne!(marker.tag() & FORWARD_TAG, 0);
    marker.addr() >> 3
}

/// Entry point: collect `ob` back to `note` with the given extra roots.
pub(super) fn collect(ob: &mut Obstack, note: Pos, roots: &mut [RObjOrFake], mode: CollectMode) {
    debug_assert!(note >= ob.first_note(), "collecting past the obstack start");
    debug_assert!(note <= ob.note(), "collecting a future note");

    if roots.is_empty() && !ob.any_valid_handles() {
        sweep(ob, note, mode);
        return;
    }

    let young_bytes = ob.small_usage_since(note);
    let mut scratch = Scratch {
        note,
        shadow: Vec::with_capacity(young_bytes / WORD_SIZE + 1),
        shadow_bytes: 0,
        recs: Vec::new(),
        patches: Vec::new(),
        work: Vec::new(),
        visited_old: FxHashSet::default(),
        surviving_iobjs: FxHashSet::default(),
        surviving_large: FxHashSet::default(),
        scanned_bytes: 0,
        visit_count: 0,
    };

    // Phase A: trace from the roots, evacuating young survivors.
    for root in roots.iter_mut() {
        scratch.work.push(root as *mut RObjOrFake as *mut usize);
    }
    ob.handle_anchor().for_each(|node| {
        if node.value().is_ptr() {
            // Cell<RObjOrFake> is a transparent wrapper over the word.
            let slot = node as *const super::handle::HandleNode as *mut usize;
            scratch.work.push(slot);
        }
    });

    while let Some(slot) = scratch.work.pop() {
        visit_slot(&mut scratch, slot);
    }

    // Phase B1: release the references registered after the note that no
    // survivor still needs.
    let survivors = std::mem::take(&mut scratch.surviving_iobjs);
    ob.sweep_iobjs(note, Some(&survivors));

    // Phase B2: rewind the chunk chain to the note. The survivors are
    // safe in the shadow buffer.
    let reclaimed = young_bytes;
    release_young_chunks(ob, note);

    // Phase B3: re-allocate the survivors at the note, oldest-evacuated
    // first, and learn their final addresses.
    for rec in scratch.recs.iter_mut() {
        let mem = ob
            .alloc_small(rec.total)
            .unwrap_or_else(|_| crate::fatal!("allocation failure during collection"));
        rec.final_payload = mem + rec.meta;
    }

    // Phase B4: patch every recorded slot (roots, handles, old-generation
    // objects, large payloads, and the shadow copies themselves).
    for &slot in scratch.patches.iter() {
        let word = unsafe { *slot };
        let rec = &scratch.recs[rec_of_marker(word)];
        unsafe { *slot = rec.final_payload };
    }

    // Phase B5: install the shadow copies at their final addresses.
    let shadow_base = scratch.shadow.as_ptr() as usize;
    for rec in scratch.recs.iter() {
        unsafe {
            std::ptr::copy_nonoverlapping(
                (shadow_base + rec.offset) as *const u8,
                (rec.final_payload - rec.meta) as *mut u8,
                rec.total,
            );
        }
    }

    // Phase B6: sweep the large-object list.
    sweep_large(ob, note, Some(&scratch.surviving_large));

    let survivor_bytes: usize = scratch.recs.iter().map(|r| r.total).sum();
    ob.stats.alloc_shadow(survivor_bytes);
    ob.stats.gc_scan(scratch.scanned_bytes);
    ob.stats.gc_visit(scratch.visit_count);
    ob.stats
        .gc_reclaim(reclaimed.saturating_sub(survivor_bytes));
    ob.stats.count_collect(mode);

    log::debug!(
        "collect: {} roots, {} survivors ({} bytes), reclaimed {} bytes",
        roots.len(),
        scratch.recs.len(),
        survivor_bytes,
        reclaimed.saturating_sub(survivor_bytes)
    );

    ob.verify_invariants();
}

/// Examine one slot, evacuating or scanning its target as needed.
fn visit_slot(scratch: &mut Scratch, slot: *mut usize) {
    let word = unsafe { *slot };
    let value = RObjOrFake::from_bits(word);
    if !value.is_ptr() {
        return;
    }
    let addr = value.bits();
    scratch.visit_count += 1;

    match kind_of(addr) {
        MemoryKind::IObj => {
            // Interned objects are kept alive by the iobj-ref map; just
            // record that the reference is still live.
            scratch.surviving_iobjs.insert(addr);
        }
        MemoryKind::Obstack => {
            let obj = unsafe { RObj::from_addr(addr) };
            if obj.is_forwarded() {
                unsafe { *slot = obj.meta_word() };
                scratch.patches.push(slot);
                return;
            }
            let pos = unsafe { Pos::from_address(addr) };
            if pos < scratch.note {
                // Old object: scan once in place.
                if scratch.visited_old.insert(addr) {
                    scan_object_slots(scratch, obj.payload_ptr(), obj);
                    scratch.scanned_bytes += obj.payload_byte_size();
                }
                return;
            }
            let rec_index = evacuate(scratch, obj);
            unsafe { *slot = marker_for(rec_index) };
            scratch.patches.push(slot);
        }
        MemoryKind::Large => {
            let obj = unsafe { RObj::from_addr(addr) };
            let meta = obj.type_().uninterned_metadata_byte_size();
            let header = unsafe { LargeObjHeader::from_payload(addr, meta) };
            if scratch.surviving_large.insert(header as usize) {
                unsafe {
                    if (*header).pin >= scratch.note {
                        (*header).pin = scratch.note;
                    }
                }
                scan_object_slots(scratch, obj.payload_ptr(), obj);
                scratch.scanned_bytes += obj.payload_byte_size();
            }
        }
        MemoryKind::Unknown => {
            // Not runtime memory (static data); leave it alone.
        }
    }
}

/// Copy `obj` (metadata + payload) into the shadow buffer, mark the
/// original forwarded, and queue the shadow copy's reference slots.
fn evacuate(scratch: &mut Scratch, obj: RObj) -> usize {
    let type_ = obj.type_();
    let meta = type_.uninterned_metadata_byte_size();
    let payload_bytes = obj.payload_byte_size();
    let total = meta + payload_bytes;

    let offset = scratch.shadow_bytes;
    debug_assert_eq!(offset % WORD_SIZE, 0);
    let needed_words = (offset + total) / WORD_SIZE;
    // A reallocation here would invalidate queued shadow slots.
    assert!(
        needed_words <= scratch.shadow.capacity(),
        "shadow buffer undersized"
    );
    scratch.shadow.resize(needed_words, 0);
    scratch.shadow_bytes = offset + total;

    let shadow_base = scratch.shadow.as_mut_ptr() as usize;
    unsafe {
        std::ptr::copy_nonoverlapping(
            (obj.addr() - meta) as *const u8,
            (shadow_base + offset) as *mut u8,
            total,
        );
    }

    let rec_index = scratch.recs.len();
    scratch.recs.push(ShadowRec {
        offset,
        meta,
        total,
        final_payload: 0,
    });
    obj.set_meta_word(marker_for(rec_index));

    // Queue the reference slots of the *copy*; the original is now junk.
    let copy_payload = (shadow_base + offset + meta) as *mut u8;
    let copy = unsafe { RObj::from_addr(copy_payload as usize) };
    scan_object_slots(scratch, copy_payload, copy);
    scratch.scanned_bytes += payload_bytes;

    rec_index
}

/// Queue every collect-stripe reference slot of an object's payload.
fn scan_object_slots(scratch: &mut Scratch, payload: *mut u8, obj: RObj) {
    let type_ = obj.type_();
    let mask = type_.ref_mask();
    if !mask.any_refs() {
        return;
    }
    let words = obj.payload_words();
    mask.for_each_ref(STRIPE_COLLECT, words, |byte_offset| {
        scratch
            .work
            .push(unsafe { payload.add(byte_offset) } as *mut usize);
    });
}

/// Fast path: no roots survive, so everything younger than the note dies.
pub(super) fn sweep(ob: &mut Obstack, note: Pos, mode: CollectMode) {
    let reclaimed = ob.small_usage_since(note);
    ob.sweep_iobjs(note, None);
    release_young_chunks(ob, note);
    sweep_large(ob, note, None);
    ob.stats.gc_reclaim(reclaimed);
    ob.stats.count_sweep(mode);
}

/// Free chunks newer than the note and rewind the bump pointer to it.
fn release_young_chunks(ob: &mut Obstack, note: Pos) {
    loop {
        let chunk = ob.current_chunk;
        let header = unsafe { &*chunk };
        if header.generation == note.generation() {
            ob.next_alloc = header.base() + note.offset_in_chunk();
            return;
        }
        debug_assert!(header.generation > note.generation());
        let prev = header.prev;
        assert!(!prev.is_null(), "note older than the chunk chain");
        ob.current_chunk = prev;
        ob.chunk_allocator.delete_chunk(chunk);
        ob.stats.modify_chunk(-1);
    }
}

/// Drop large objects pinned after the note, keeping `survivors`.
fn sweep_large(ob: &mut Obstack, note: Pos, survivors: Option<&FxHashSet<usize>>) {
    let mut kept: *mut LargeObjHeader = std::ptr::null_mut();
    let mut kept_tail: *mut LargeObjHeader = std::ptr::null_mut();
    let mut cursor = ob.current_large;
    ob.current_large = std::ptr::null_mut();
    while !cursor.is_null() {
        let next = unsafe { (*cursor).next };
        let header = unsafe { &mut *cursor };
        let survives = header.pin < note
            || survivors
                .map(|set| set.contains(&(cursor as usize)))
                .unwrap_or(false);
        if survives {
            header.next = std::ptr::null_mut();
            if kept.is_null() {
                kept = cursor;
            } else {
                unsafe { (*kept_tail).next = cursor };
            }
            kept_tail = cursor;
        } else {
            ob.stats.modify_large(-1, -(header.size as isize));
            LargeObjHeader::free(cursor);
        }
        cursor = next;
    }
    ob.current_large = kept;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_roundtrip() {
        let marker = marker_for(17);
        assert_ne!(marker & FORWARD_TAG, 0);
        assert_eq!(rec_of_marker(marker), 17);
    }
}
