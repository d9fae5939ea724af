//! Interner - concurrent canonicalization of immutable objects
//!
//! The intern table maps structural value to one canonical copy in the
//! interner heap. Lookup hashes the payload (reference slots already hold
//! canonical pointers, so a plain byte comparison is structural
//! comparison), takes the bucket's shard lock, and either increfs the
//! existing canonical object or installs a clone.
//!
//! Interning is deep: the object graph is walked leaves-first with a
//! strongly-connected-component pass (Tarjan), so by the time an object is
//! cloned all its reference slots point at canonical objects. Cyclic
//! components collapse into delegate-refcounted groups (see [`cycle`]).
//!
//! Decref-to-zero finalizes: the object leaves the table, its type's
//! state-change hook runs, its own references drop, and the memory returns
//! to the interner heap. Finalization is always driven from the lock
//! manager with no locks held.

pub mod cycle;
pub mod heap;

use crate::error::Result;
use crate::object::{
    IObj, IObjOrFake, ObjectKind, RObj, RObjOrFake, StateChange, Type, TypeHints, STRIPE_COLLECT,
    WORD_SIZE,
};
use dashmap::DashMap;
use heap::InternHeap;
use rustc_hash::FxHashMap;
use std::hash::{BuildHasher, Hash, Hasher};

lazy_static::lazy_static! {
    static ref TABLE: DashMap<u64, Vec<IObj>> = DashMap::new();
    static ref HASHER: ahash::RandomState = ahash::RandomState::new();
}

/// Structural hash of an interned (or about-to-be-interned) object:
/// vtable, instance size word, and payload bytes. Reference slots hold
/// canonical pointers, so hashing them raw is structural.
pub(crate) fn structural_hash(vtable_bits: usize, size_word: usize, payload: &[u8]) -> u64 {
    let mut hasher = HASHER.build_hasher();
    vtable_bits.hash(&mut hasher);
    size_word.hash(&mut hasher);
    payload.hash(&mut hasher);
    hasher.finish()
}

fn hash_iobj(obj: IObj) -> u64 {
    let size_word = match obj.type_().kind() {
        ObjectKind::Array | ObjectKind::String => obj.size_word(),
        _ => 0,
    };
    let payload =
        unsafe { std::slice::from_raw_parts(obj.payload_ptr() as *const u8, obj.payload_byte_size()) };
    structural_hash(obj.meta_word(), size_word, payload)
}

fn structurally_equal(a: IObj, b: IObj) -> bool {
    if a.meta_word() != b.meta_word() {
        return false;
    }
    let kind = a.type_().kind();
    if matches!(kind, ObjectKind::Array | ObjectKind::String) && a.size_word() != b.size_word() {
        return false;
    }
    let size = a.payload_byte_size();
    if size != b.payload_byte_size() {
        return false;
    }
    unsafe {
        std::slice::from_raw_parts(a.payload_ptr() as *const u8, size)
            == std::slice::from_raw_parts(b.payload_ptr() as *const u8, size)
    }
}

/// Number of canonical objects currently in the table (test support).
pub fn table_len() -> usize {
    TABLE.iter().map(|bucket| bucket.value().len()).sum()
}

/// Every canonical object currently in the table, each pinned with one
/// reference the caller must release (persistence support). Objects
/// racing toward finalization are skipped.
pub fn snapshot() -> Vec<IObj> {
    let mut objects = Vec::new();
    for bucket in TABLE.iter() {
        for &obj in bucket.value().iter() {
            if obj.try_incref() {
                objects.push(obj);
            }
        }
    }
    objects
}

// ----------------------------------------------------------------------
// Materialization (memo-cache deserialization)

/// Build a long-string object directly in interner memory with one
/// reference for the caller. Not yet published in the table.
pub(crate) fn materialize_string(bytes: &[u8]) -> Result<IObj> {
    let type_ = crate::string::string_type();
    let meta = type_.interned_metadata_byte_size();
    let total = meta + bytes.len().max(WORD_SIZE);
    let mem = InternHeap::global().alloc(total)?.as_ptr() as usize;
    let obj = unsafe { IObj::from_addr(mem + meta) };
    obj.set_vtable(type_.frozen_vtable());
    obj.set_size_word(crate::string::long_string_size_word(bytes));
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), obj.payload_ptr(), bytes.len());
    }
    obj.set_local_refcount(1);
    Ok(obj)
}

/// Build an object of `vtable`'s type in interner memory from raw
/// payload words (reference slots still hold table indices), with one
/// reference for the caller. Not yet published in the table.
pub(crate) fn materialize_raw(
    vtable: crate::object::VTableRef,
    array_len: Option<u32>,
    payload: &[u64],
) -> Result<IObj> {
    let type_ = vtable.type_();
    let meta = type_.interned_metadata_byte_size();
    let payload_bytes = payload.len() * WORD_SIZE;
    let total = meta + payload_bytes.max(WORD_SIZE);
    let mem = InternHeap::global().alloc(total)?.as_ptr() as usize;
    let obj = unsafe { IObj::from_addr(mem + meta) };
    obj.set_vtable(type_.frozen_vtable());
    if let Some(len) = array_len {
        obj.set_size_word(len as usize);
    }
    unsafe {
        std::ptr::copy_nonoverlapping(
            payload.as_ptr() as *const u8,
            obj.payload_ptr(),
            payload_bytes,
        );
    }
    obj.set_local_refcount(1);
    Ok(obj)
}

/// Publish a materialized object: insert it into the table (its
/// reference slots are already canonical) and run the initialize hook.
pub(crate) fn install_materialized(obj: IObj) {
    if !obj.type_().hints().contains(TypeHints::AVOID_INTERN_TABLE) {
        let hash = hash_iobj(obj);
        TABLE.entry(hash).or_default().push(obj);
    }
    run_state_change(obj, StateChange::Initialize);
}

// ----------------------------------------------------------------------
// Deep intern

enum NodeState {
    /// On the Tarjan stack; `index` is its DFS index.
    InProgress { index: u32 },
    /// Canonicalized; the interner context holds one reference.
    Done(IObjOrFake),
}

struct InternCx {
    nodes: FxHashMap<usize, NodeState>,
    stack: Vec<usize>,
    next_index: u32,
}

impl InternCx {
    fn new() -> InternCx {
        InternCx {
            nodes: FxHashMap::default(),
            stack: Vec::new(),
            next_index: 0,
        }
    }

    fn done(&self, addr: usize) -> IObjOrFake {
        match self.nodes.get(&addr) {
            Some(NodeState::Done(canonical)) => *canonical,
            _ => crate::fatal!("interner dependency not canonicalized"),
        }
    }
}

impl Drop for InternCx {
    fn drop(&mut self) {
        // Release the context's reference on every canonicalized node.
        for state in self.nodes.values() {
            if let NodeState::Done(done) = state {
                if let Some(iobj) = done.ptr() {
                    crate::lock::safe_decref_iobj(iobj);
                }
            }
        }
    }
}

/// Intern `root`, returning the canonical copy with one reference
/// transferred to the caller.
pub fn intern(root: RObj) -> Result<IObj> {
    let mut cx = InternCx::new();
    visit(&mut cx, root)?;
    let canonical = cx
        .done(root.addr())
        .ptr()
        .unwrap_or_else(|| crate::fatal!("intern root resolved to a fake pointer"));
    canonical.incref();
    Ok(canonical)
}

/// Intern a pointer-or-fake word; fakes pass through untouched.
pub fn intern_or_fake(value: RObjOrFake) -> Result<IObjOrFake> {
    match value.ptr() {
        Some(obj) => Ok(IObjOrFake::from_obj(intern(obj)?)),
        None => Ok(value.as_iobj_or_fake()),
    }
}

/// Tarjan DFS. Returns the node's lowlink.
fn visit(cx: &mut InternCx, obj: RObj) -> Result<u32> {
    let addr = obj.addr();
    if crate::arena::kind_of(addr) == crate::arena::MemoryKind::IObj {
        // Already canonical: take a context reference and stop.
        let iobj = unsafe { IObj::from_addr(addr) };
        if !cx.nodes.contains_key(&addr) {
            iobj.incref();
            cx.nodes
                .insert(addr, NodeState::Done(IObjOrFake::from_obj(iobj)));
        }
        return Ok(u32::MAX);
    }

    let index = cx.next_index;
    cx.next_index += 1;
    cx.nodes.insert(addr, NodeState::InProgress { index });
    cx.stack.push(addr);
    let mut lowlink = index;

    for slot_value in ref_slot_values(obj) {
        let child = match slot_value.ptr() {
            Some(child) => child,
            None => continue,
        };
        let child_state = match cx.nodes.get(&child.addr()) {
            None => None,
            Some(NodeState::InProgress { index }) => Some(Some(*index)),
            Some(NodeState::Done(_)) => Some(None),
        };
        match child_state {
            None => {
                let child_low = visit(cx, child)?;
                lowlink = lowlink.min(child_low);
            }
            Some(Some(back_edge_index)) => lowlink = lowlink.min(back_edge_index),
            Some(None) => {}
        }
    }

    if lowlink == index {
        // This node roots a strongly connected component: everything on
        // the stack from it upward.
        let first = cx
            .stack
            .iter()
            .rposition(|&member| member == addr)
            .expect("SCC root on stack");
        let members: Vec<usize> = cx.stack.split_off(first);
        canonicalize_component(cx, &members)?;
    }
    Ok(lowlink)
}

/// The reference-slot values of an uninterned object.
fn ref_slot_values(obj: RObj) -> Vec<RObjOrFake> {
    let mask = obj.type_().ref_mask();
    let mut values = Vec::new();
    if mask.any_refs() {
        mask.for_each_ref(STRIPE_COLLECT, obj.payload_words(), |offset| {
            let word = unsafe { *((obj.addr() + offset) as *const usize) };
            values.push(RObjOrFake::from_bits(word));
        });
    }
    values
}

/// Canonicalize one component whose descendants are all Done.
fn canonicalize_component(cx: &mut InternCx, members: &[usize]) -> Result<()> {
    if members.len() == 1 {
        let addr = members[0];
        let obj = unsafe { RObj::from_addr(addr) };
        if !has_self_loop(obj) {
            let canonical = intern_single(cx, obj)?;
            cx.nodes.insert(addr, NodeState::Done(canonical));
            return Ok(());
        }
    }
    intern_cycle(cx, members)
}

fn has_self_loop(obj: RObj) -> bool {
    ref_slot_values(obj)
        .into_iter()
        .any(|value| value.is_ptr() && value.bits() == obj.addr())
}

/// Clone `obj` into interner memory with canonicalized slots.
///
/// The clone's reference slots each hold one refcount on their target.
fn make_clone(cx: &InternCx, obj: RObj) -> Result<IObj> {
    let type_ = obj.type_();
    let meta = type_.interned_metadata_byte_size();
    let payload_bytes = obj.payload_byte_size();
    let total = meta + payload_bytes.max(WORD_SIZE);

    let mem = InternHeap::global().alloc(total)?.as_ptr() as usize;
    let clone = unsafe { IObj::from_addr(mem + meta) };
    unsafe {
        std::ptr::copy_nonoverlapping(
            obj.payload_ptr() as *const u8,
            clone.payload_ptr(),
            payload_bytes,
        );
    }
    // Interned objects are frozen by construction.
    clone.set_vtable(type_.frozen_vtable());
    if matches!(type_.kind(), ObjectKind::Array | ObjectKind::String) {
        clone.set_size_word(obj.size_word());
    }

    // Canonicalize the reference slots, taking one reference per slot.
    let mask = type_.ref_mask();
    if mask.any_refs() {
        let mut offsets = Vec::new();
        mask.for_each_ref(STRIPE_COLLECT, clone.payload_words(), |offset| {
            offsets.push(offset)
        });
        for offset in offsets {
            let slot = (clone.addr() + offset) as *mut usize;
            let value = RObjOrFake::from_bits(unsafe { *slot });
            if let Some(child) = value.ptr() {
                let canonical = if crate::arena::kind_of(child.addr())
                    == crate::arena::MemoryKind::IObj
                {
                    IObjOrFake::from_obj(unsafe { IObj::from_addr(child.addr()) })
                } else {
                    cx.done(child.addr())
                };
                if let Some(canonical_obj) = canonical.ptr() {
                    canonical_obj.incref();
                }
                unsafe { *slot = canonical.bits() };
            }
        }
    }
    Ok(clone)
}

/// Drop a clone that lost the canonicalization race: release its slot
/// references and return its memory.
fn discard_clone(clone: IObj) {
    for value in iobj_ref_slot_values(clone) {
        if let Some(child) = value.ptr() {
            crate::lock::safe_decref_iobj(child);
        }
    }
    free_iobj_memory(clone);
}

fn iobj_ref_slot_values(obj: IObj) -> Vec<IObjOrFake> {
    let mask = obj.type_().ref_mask();
    let mut values = Vec::new();
    if mask.any_refs() {
        mask.for_each_ref(STRIPE_COLLECT, obj.payload_words(), |offset| {
            let word = unsafe { *((obj.addr() + offset) as *const usize) };
            values.push(IObjOrFake::from_bits(word));
        });
    }
    values
}

fn free_iobj_memory(obj: IObj) {
    let type_ = obj.type_();
    let meta = type_.interned_metadata_byte_size();
    let total = meta + obj.payload_byte_size().max(WORD_SIZE);
    let base = (obj.addr() - meta) as *mut u8;
    InternHeap::global().free(unsafe { std::ptr::NonNull::new_unchecked(base) }, total);
}

/// Intern one acyclic object. Returns a Done value carrying one context
/// reference.
fn intern_single(cx: &InternCx, obj: RObj) -> Result<IObjOrFake> {
    let clone = make_clone(cx, obj)?;
    clone.set_local_refcount(1);

    if obj.type_().hints().contains(TypeHints::AVOID_INTERN_TABLE) {
        run_state_change(clone, StateChange::Initialize);
        return Ok(IObjOrFake::from_obj(clone));
    }

    let hash = hash_iobj(clone);
    let mut winner = None;
    {
        let mut bucket = TABLE.entry(hash).or_default();
        for &candidate in bucket.iter() {
            if structurally_equal(candidate, clone) && candidate.try_incref() {
                winner = Some(candidate);
                break;
            }
        }
        if winner.is_none() {
            bucket.push(clone);
        }
    }

    match winner {
        Some(canonical) => {
            discard_clone(clone);
            Ok(IObjOrFake::from_obj(canonical))
        }
        None => {
            run_state_change(clone, StateChange::Initialize);
            Ok(IObjOrFake::from_obj(clone))
        }
    }
}

lazy_static::lazy_static! {
    static ref CYCLE_HANDLE_TYPE: &'static Type = Type::cycle_handle_factory("CycleHandle");
}

/// Allocate a cycle-handle sentinel: a well-formed interned object that
/// stands in for not-yet-interned back edges while a component is under
/// construction.
fn make_cycle_handle() -> Result<IObj> {
    let type_: &'static Type = *CYCLE_HANDLE_TYPE;
    let meta = type_.interned_metadata_byte_size();
    let mem = InternHeap::global().alloc(meta + WORD_SIZE)?.as_ptr() as usize;
    let handle = unsafe { IObj::from_addr(mem + meta) };
    handle.set_vtable(type_.frozen_vtable());
    handle.set_local_refcount(1);
    Ok(handle)
}

/// Intern a cyclic component: clone every member with a cycle-handle
/// sentinel standing in for the back edges, elect the first member as
/// delegate, then replace the sentinel with the real member addresses.
///
/// Cyclic components are canonical as groups: structurally identical
/// cycles built separately stay distinct (cross-group deduplication is
/// not attempted), but every member still enters the table so acyclic
/// objects referencing it canonicalize normally.
fn intern_cycle(cx: &mut InternCx, members: &[usize]) -> Result<()> {
    let sentinel = make_cycle_handle()?;
    let mut clones: FxHashMap<usize, IObj> = FxHashMap::default();
    let mut clone_list = Vec::with_capacity(members.len());
    let mut back_edges: Vec<(IObj, usize, usize)> = Vec::new();
    for &addr in members {
        let obj = unsafe { RObj::from_addr(addr) };
        let clone = make_intra_deferred_clone(cx, obj, members, sentinel, &mut back_edges)?;
        clones.insert(addr, clone);
        clone_list.push(clone);
    }

    // The SCC pass proper: replace every sentinel occurrence with the
    // final member address. Intra-component references do not carry
    // refcounts; only references from outside the component do.
    for (clone, offset, original_target) in back_edges {
        let slot = (clone.addr() + offset) as *mut usize;
        debug_assert_eq!(unsafe { *slot }, sentinel.addr());
        unsafe { *slot = clones[&original_target].addr() };
    }
    free_iobj_memory(sentinel);

    // Elect the delegate and fold the refcounts: one context reference
    // per member.
    let delegate = clone_list[0];
    delegate.set_local_refcount(members.len() as u32);
    for &clone in clone_list.iter().skip(1) {
        clone.set_local_refcount(0);
        clone.set_delegate(delegate);
    }
    cycle::register_group(delegate, clone_list.iter().map(|c| c.addr()).collect());

    // Install every member in the table and run the hooks.
    for &clone in clone_list.iter() {
        let hash = hash_iobj(clone);
        TABLE.entry(hash).or_default().push(clone);
        run_state_change(clone, StateChange::Initialize);
    }

    for (index, &addr) in members.iter().enumerate() {
        cx.nodes.insert(
            addr,
            NodeState::Done(IObjOrFake::from_obj(clone_list[index])),
        );
    }
    Ok(())
}

/// Clone for cycle interning: extra-component slots canonicalize (with
/// refcounts) now; intra-component slots hold the sentinel until the SCC
/// pass wires them, and are recorded in `back_edges` as
/// (clone, payload offset, original target address).
fn make_intra_deferred_clone(
    cx: &InternCx,
    obj: RObj,
    members: &[usize],
    sentinel: IObj,
    back_edges: &mut Vec<(IObj, usize, usize)>,
) -> Result<IObj> {
    let type_ = obj.type_();
    let meta = type_.interned_metadata_byte_size();
    let payload_bytes = obj.payload_byte_size();
    let total = meta + payload_bytes.max(WORD_SIZE);

    let mem = InternHeap::global().alloc(total)?.as_ptr() as usize;
    let clone = unsafe { IObj::from_addr(mem + meta) };
    unsafe {
        std::ptr::copy_nonoverlapping(
            obj.payload_ptr() as *const u8,
            clone.payload_ptr(),
            payload_bytes,
        );
    }
    clone.set_vtable(type_.frozen_vtable());
    if matches!(type_.kind(), ObjectKind::Array | ObjectKind::String) {
        clone.set_size_word(obj.size_word());
    }

    let mask = type_.ref_mask();
    if mask.any_refs() {
        let mut offsets = Vec::new();
        mask.for_each_ref(STRIPE_COLLECT, clone.payload_words(), |offset| {
            offsets.push(offset)
        });
        for offset in offsets {
            let slot = (clone.addr() + offset) as *mut usize;
            let value = RObjOrFake::from_bits(unsafe { *slot });
            let child = match value.ptr() {
                Some(child) => child,
                None => continue,
            };
            if members.contains(&child.addr()) {
                back_edges.push((clone, offset, child.addr()));
                unsafe { *slot = sentinel.addr() };
                continue;
            }
            let canonical =
                if crate::arena::kind_of(child.addr()) == crate::arena::MemoryKind::IObj {
                    IObjOrFake::from_obj(unsafe { IObj::from_addr(child.addr()) })
                } else {
                    cx.done(child.addr())
                };
            if let Some(canonical_obj) = canonical.ptr() {
                canonical_obj.incref();
            }
            unsafe { *slot = canonical.bits() };
        }
    }
    Ok(clone)
}

// ----------------------------------------------------------------------
// Finalization

fn run_state_change(obj: IObj, change: StateChange) {
    if let Some(hook) = obj.type_().on_state_change() {
        hook(obj, change);
    }
    if obj.type_().kind() == ObjectKind::Invocation {
        crate::memo::invocation::invocation_on_state_change(obj, change);
    }
}

/// Called by the lock manager when a deferred decref drove a delegate's
/// refcount to zero. No locks are held.
pub(crate) fn finalize(delegate: IObj) {
    debug_assert_eq!(delegate.local_refcount(), 0);
    debug_assert!(delegate.is_delegate());

    match cycle::take_group(delegate) {
        Some(group) => {
            let member_set: rustc_hash::FxHashSet<usize> =
                group.members.iter().copied().collect();
            for &addr in group.members.iter() {
                let member = unsafe { IObj::from_addr(addr) };
                remove_from_table(member);
                run_state_change(member, StateChange::Finalize);
            }
            // Drop external references, then free the whole component.
            for &addr in group.members.iter() {
                let member = unsafe { IObj::from_addr(addr) };
                for value in iobj_ref_slot_values(member) {
                    if let Some(child) = value.ptr() {
                        if !member_set.contains(&child.addr()) {
                            crate::lock::safe_decref_iobj(child);
                        }
                    }
                }
            }
            for &addr in group.members.iter() {
                free_iobj_memory(unsafe { IObj::from_addr(addr) });
            }
        }
        None => {
            remove_from_table(delegate);
            run_state_change(delegate, StateChange::Finalize);
            for value in iobj_ref_slot_values(delegate) {
                if let Some(child) = value.ptr() {
                    crate::lock::safe_decref_iobj(child);
                }
            }
            free_iobj_memory(delegate);
        }
    }
}

fn remove_from_table(obj: IObj) {
    if obj.type_().hints().contains(TypeHints::AVOID_INTERN_TABLE) {
        return;
    }
    let hash = hash_iobj(obj);
    if let Some(mut bucket) = TABLE.get_mut(&hash) {
        bucket.retain(|&candidate| candidate.addr() != obj.addr());
    }
    TABLE.remove_if(&hash, |_, bucket| bucket.is_empty());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obstack::Obstack;

    fn leaf_type() -> &'static Type {
        lazy_static::lazy_static! {
            static ref TYPE: &'static Type = Type::class_factory("InternLeaf", 8, &[]);
        }
        *TYPE
    }

    fn pair_type() -> &'static Type {
        lazy_static::lazy_static! {
            static ref TYPE: &'static Type = Type::class_factory("InternPair", 16, &[0]);
        }
        *TYPE
    }

    fn new_leaf(ob: &mut Obstack, value: u64) -> RObj {
        let obj = ob.alloc_object(leaf_type()).unwrap();
        unsafe { *(obj.addr() as *mut u64) = value };
        obj
    }

    #[test]
    fn test_structural_canonicalization() {
        let mut ob = Obstack::new().unwrap();
        let a = new_leaf(&mut ob, 0x6001);
        let b = new_leaf(&mut ob, 0x6001);
        let ia = intern(a).unwrap();
        let ib = intern(b).unwrap();
        assert_eq!(ia.addr(), ib.addr());
        assert!(ia.local_refcount() >= 2);
        crate::lock::safe_decref_iobj(ia);
        crate::lock::safe_decref_iobj(ib);
    }

    #[test]
    fn test_different_values_distinct() {
        let mut ob = Obstack::new().unwrap();
        let a = new_leaf(&mut ob, 0x7001);
        let b = new_leaf(&mut ob, 0x7002);
        let ia = intern(a).unwrap();
        let ib = intern(b).unwrap();
        assert_ne!(ia.addr(), ib.addr());
        crate::lock::safe_decref_iobj(ia);
        crate::lock::safe_decref_iobj(ib);
    }

    #[test]
    fn test_deep_intern_canonicalizes_children() {
        let mut ob = Obstack::new().unwrap();
        let leaf1 = new_leaf(&mut ob, 0x8001);
        let leaf2 = new_leaf(&mut ob, 0x8001);

        let p1 = ob.alloc_object(pair_type()).unwrap();
        let p2 = ob.alloc_object(pair_type()).unwrap();
        unsafe {
            *(p1.addr() as *mut usize) = leaf1.addr();
            *(p2.addr() as *mut usize) = leaf2.addr();
        }

        let i1 = intern(p1).unwrap();
        let i2 = intern(p2).unwrap();
        assert_eq!(i1.addr(), i2.addr());
        let child = IObjOrFake::from_bits(unsafe { *(i1.addr() as *const usize) });
        assert!(child.is_ptr());
        crate::lock::safe_decref_iobj(i1);
        crate::lock::safe_decref_iobj(i2);
    }

    #[test]
    fn test_interned_objects_are_frozen() {
        let mut ob = Obstack::new().unwrap();
        let obj = new_leaf(&mut ob, 0x9001);
        let interned = intern(obj).unwrap();
        assert!(interned.is_frozen());
        crate::lock::safe_decref_iobj(interned);
    }

    #[test]
    fn test_cycle_collapse() {
        let mut ob = Obstack::new().unwrap();
        let a = ob.alloc_object(pair_type()).unwrap();
        let b = ob.alloc_object(pair_type()).unwrap();
        unsafe {
            *(a.addr() as *mut usize) = b.addr();
            *(a.addr() as *mut usize).add(1) = 0xa1;
            *(b.addr() as *mut usize) = a.addr();
            *(b.addr() as *mut usize).add(1) = 0xb1;
        }

        let ia = intern(a).unwrap();
        let delegate = ia.delegate();
        assert_eq!(cycle::group_size(delegate), 2);

        // One external reference: ours. Non-delegate members carry zero.
        assert_eq!(delegate.local_refcount(), 1);
        let peer = IObjOrFake::from_bits(unsafe { *(ia.addr() as *const usize) })
            .ptr()
            .unwrap();
        let non_delegate = if peer.addr() == delegate.addr() { ia } else { peer };
        if non_delegate.addr() != delegate.addr() {
            assert_eq!(non_delegate.local_refcount(), 0);
            assert_eq!(non_delegate.delegate().addr(), delegate.addr());
        }

        // Dropping the last external reference finalizes the whole group.
        crate::lock::safe_decref_iobj(ia);
        assert_eq!(cycle::group_size(delegate), 0);
    }
}
