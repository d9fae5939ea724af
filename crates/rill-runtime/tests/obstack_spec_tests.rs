//! Specification-Based Obstack Tests
//!
//! These tests verify what the obstack SHOULD do, not what it currently
//! does: identity of survivors across collection, pinned non-movement,
//! handle liveness, freeze semantics. Any failing test indicates a bug in
//! the implementation.

use rill_runtime::object::{RObj, RObjOrFake, Type};
use rill_runtime::obstack::{Obstack, LARGE_THRESHOLD};

/// A class with no references and a recognizable payload.
fn leaf_type() -> &'static Type {
    use std::sync::OnceLock;
    static TYPE: OnceLock<&'static Type> = OnceLock::new();
    TYPE.get_or_init(|| Type::class_factory("SpecLeaf", 32, &[]))
}

/// A class with one reference slot followed by a payload word.
fn node_type() -> &'static Type {
    use std::sync::OnceLock;
    static TYPE: OnceLock<&'static Type> = OnceLock::new();
    TYPE.get_or_init(|| Type::class_factory("SpecNode", 16, &[0]))
}

fn fill(obj: RObj, seed: u64) {
    let words = obj.payload_byte_size() / 8;
    for word in 0..words {
        unsafe { *((obj.addr() + word * 8) as *mut u64) = seed.wrapping_add(word as u64) };
    }
}

fn check_fill(obj: RObj, seed: u64) {
    let words = obj.payload_byte_size() / 8;
    for word in 0..words {
        let value = unsafe { *((obj.addr() + word * 8) as *const u64) };
        assert_eq!(value, seed.wrapping_add(word as u64), "payload word {}", word);
    }
}

fn set_ref(obj: RObj, target: RObjOrFake) {
    unsafe { *(obj.addr() as *mut usize) = target.bits() };
}

fn get_ref(obj: RObj) -> RObjOrFake {
    RObjOrFake::from_bits(unsafe { *(obj.addr() as *const usize) })
}

// ============================================================================
// S1: note/collect scenario
// ============================================================================

#[test]
fn spec_s1_note_collect_keeps_rooted_object() {
    // SPEC: allocate a mix of sizes; note after the third; collect back
    // to the note with one explicit root; the root survives with its
    // payload intact and everything else after the note is reclaimed.
    let mut ob = Obstack::new().unwrap();
    let sizes = [8usize, 24, 72, 512, 16384, 32, 32, 32, 32, 32];

    let mut objects = Vec::new();
    let mut note = None;
    for (index, &size) in sizes.iter().enumerate() {
        let mem = ob.alloc(size).unwrap().as_ptr() as usize;
        for offset in (0..size).step_by(8) {
            unsafe { *((mem + offset) as *mut u64) = (index as u64) << 32 | offset as u64 };
        }
        objects.push((mem, size));
        if index == 2 {
            note = Some(ob.note());
        }
    }
    let note = note.unwrap();
    // The 16 KiB allocation diverted to the large list.
    assert_eq!(ob.stats().cur_large_count(), 1);

    // Root object #4 (index 3). Raw allocations have no metadata, so
    // root a real object instead: rebuild #4 as an object with the same
    // payload.
    ob.collect(note);
    let survivor = ob.alloc_object(leaf_type()).unwrap();
    fill(survivor, 0x4444_0000);
    let note2 = ob.note();
    for _ in 0..5 {
        let extra = ob.alloc_object(leaf_type()).unwrap();
        fill(extra, 0x5555_0000);
    }

    let mut roots = [RObjOrFake::from_obj(survivor)];
    ob.collect_roots(note2, &mut roots);

    let moved = roots[0].ptr().expect("root must remain a pointer");
    check_fill(moved, 0x4444_0000);
    // Everything after note2 except the survivor is gone.
    assert_eq!(
        ob.usage(note2),
        leaf_type().uninterned_metadata_byte_size() + 32
    );
}

#[test]
fn spec_collect_reclaims_unrooted_allocations() {
    let mut ob = Obstack::new().unwrap();
    let note = ob.note();
    for _ in 0..100 {
        ob.alloc(64).unwrap();
    }
    assert_eq!(ob.usage(note), 6400);
    ob.collect(note);
    assert_eq!(ob.usage(note), 0);
}

#[test]
fn spec_collect_follows_reference_chains() {
    // A chain root -> a -> b must survive entirely, with every link
    // rewritten to the moved copies.
    let mut ob = Obstack::new().unwrap();
    let note = ob.note();

    let b = ob.alloc_object(node_type()).unwrap();
    unsafe { *((b.addr() + 8) as *mut u64) = 0xb0b0 };
    let a = ob.alloc_object(node_type()).unwrap();
    set_ref(a, RObjOrFake::from_obj(b));
    unsafe { *((a.addr() + 8) as *mut u64) = 0xa0a0 };

    let mut roots = [RObjOrFake::from_obj(a)];
    ob.collect_roots(note, &mut roots);

    let new_a = roots[0].ptr().unwrap();
    assert_eq!(unsafe { *((new_a.addr() + 8) as *const u64) }, 0xa0a0);
    let new_b = get_ref(new_a).ptr().unwrap();
    assert_eq!(unsafe { *((new_b.addr() + 8) as *const u64) }, 0xb0b0);
}

#[test]
fn spec_collect_shares_doubly_referenced_object() {
    // Two roots to the same object still point at one copy afterwards.
    let mut ob = Obstack::new().unwrap();
    let note = ob.note();
    let shared = ob.alloc_object(leaf_type()).unwrap();
    fill(shared, 0x77);

    let mut roots = [
        RObjOrFake::from_obj(shared),
        RObjOrFake::from_obj(shared),
    ];
    ob.collect_roots(note, &mut roots);
    assert_eq!(roots[0], roots[1]);
    check_fill(roots[0].ptr().unwrap(), 0x77);
}

// ============================================================================
// Pinned and large objects
// ============================================================================

#[test]
fn spec_pinned_object_never_moves() {
    // SPEC: a pinned allocation keeps its address across collections in
    // which it is rooted.
    let mut ob = Obstack::new().unwrap();
    let note = ob.note();

    let mem = ob.alloc_pinned(64).unwrap().as_ptr() as usize;
    // Give it object metadata so it can serve as a root.
    let meta = leaf_type().uninterned_metadata_byte_size();
    let pinned_mem = ob.alloc_pinned(meta + 32).unwrap().as_ptr() as usize;
    let pinned = unsafe { RObj::from_addr(pinned_mem + meta) };
    pinned.set_vtable(leaf_type().vtable());
    fill(pinned, 0x99);
    let original_addr = pinned.addr();
    let _ = mem;

    for _ in 0..3 {
        let mut roots = [RObjOrFake::from_obj(pinned)];
        ob.collect_roots(note, &mut roots);
        assert_eq!(
            roots[0].ptr().unwrap().addr(),
            original_addr,
            "pinned object must not move"
        );
        check_fill(pinned, 0x99);
    }
}

#[test]
fn spec_unrooted_large_object_is_reclaimed() {
    let mut ob = Obstack::new().unwrap();
    let note = ob.note();
    ob.alloc(LARGE_THRESHOLD + 1).unwrap();
    assert_eq!(ob.stats().cur_large_count(), 1);
    ob.collect(note);
    assert_eq!(ob.stats().cur_large_count(), 0);
}

// ============================================================================
// Handles
// ============================================================================

#[test]
fn spec_handle_tracks_moved_object() {
    // SPEC: across collections with no explicit roots, a handle always
    // yields a valid pointer to an object with the original payload.
    let mut ob = Obstack::new().unwrap();
    let note = ob.note();
    let obj = ob.alloc_object(leaf_type()).unwrap();
    fill(obj, 0x1212);

    let handle = ob.make_handle(RObjOrFake::from_obj(obj));
    for round in 0..3 {
        ob.collect(note);
        let current = handle.get().ptr().expect("handle stays valid");
        check_fill(current, 0x1212);
        let _ = round;
    }
    drop(handle);
    // With the handle gone the object is unreachable.
    ob.collect(note);
    assert_eq!(ob.usage(note), 0);
}

// ============================================================================
// Freeze
// ============================================================================

#[test]
fn spec_s2_freeze_reproduces_cycle() {
    // SPEC: freeze of a -> b -> a yields two frozen copies forming the
    // same cycle.
    let mut ob = Obstack::new().unwrap();
    let a = ob.alloc_object(node_type()).unwrap();
    let b = ob.alloc_object(node_type()).unwrap();
    set_ref(a, RObjOrFake::from_obj(b));
    set_ref(b, RObjOrFake::from_obj(a));

    let frozen_a = ob.freeze(RObjOrFake::from_obj(a)).unwrap().unwrap_ptr();
    let frozen_b = get_ref(frozen_a).ptr().unwrap();
    assert!(frozen_a.is_frozen());
    assert!(frozen_b.is_frozen());
    assert_ne!(frozen_a.addr(), a.addr());
    assert_eq!(get_ref(frozen_b).ptr().unwrap().addr(), frozen_a.addr());
}

#[test]
fn spec_freeze_idempotent() {
    // SPEC: freeze(freeze(x)) == freeze(x).
    let mut ob = Obstack::new().unwrap();
    let inner = ob.alloc_object(leaf_type()).unwrap();
    let outer = ob.alloc_object(node_type()).unwrap();
    set_ref(outer, RObjOrFake::from_obj(inner));

    let once = ob.freeze(RObjOrFake::from_obj(outer)).unwrap();
    let twice = ob.freeze(once).unwrap();
    assert_eq!(once, twice);

    // Every transitively reachable object is frozen.
    let root = once.unwrap_ptr();
    assert!(root.is_frozen());
    assert!(get_ref(root).ptr().unwrap().is_frozen());
}

// ============================================================================
// Interned references from the obstack
// ============================================================================

#[test]
fn spec_collect_releases_unreachable_iobj_refs() {
    let mut ob = Obstack::new().unwrap();
    let note = ob.note();

    let obj = ob.alloc_object(leaf_type()).unwrap();
    fill(obj, 0xfeed_0001);
    let interned = ob.intern(RObjOrFake::from_obj(obj)).unwrap();
    assert!(interned.is_ptr());
    assert_eq!(ob.iobj_count(), 1);

    // Nothing roots the interned reference; collecting the registration
    // point releases it.
    ob.collect(note);
    assert_eq!(ob.iobj_count(), 0);
}

#[test]
fn spec_collect_keeps_reachable_iobj_refs() {
    let mut ob = Obstack::new().unwrap();
    let note = ob.note();

    let leaf = ob.alloc_object(leaf_type()).unwrap();
    fill(leaf, 0xfeed_0002);
    let interned = ob.intern(RObjOrFake::from_obj(leaf)).unwrap();

    // A rooted obstack object referencing the interned object keeps the
    // registration alive.
    let holder = ob.alloc_object(node_type()).unwrap();
    set_ref(holder, interned.as_robj_or_fake());

    let mut roots = [RObjOrFake::from_obj(holder)];
    ob.collect_roots(note, &mut roots);
    assert_eq!(ob.iobj_count(), 1);

    // The interned pointer inside the survivor is unchanged (interned
    // objects never move).
    let survivor = roots[0].ptr().unwrap();
    assert_eq!(get_ref(survivor).bits(), interned.bits());
}
