//! Invocation - the memoized call and its MVCC revision list
//!
//! An invocation is the interned identity of one memoized call
//! (entrypoint + arguments); its bookkeeping struct is embedded in the
//! interned object's metadata. It owns a linked list of revisions sorted
//! newest-first: non-overlapping lifespans, touching equal values merged.
//!
//! Evaluation walks the list for an entry covering the query transaction:
//! a real value is a hit, a placeholder suspends the caller on the
//! in-flight context, a refreshable head delegates to the refresh
//! machine, and a miss inserts a placeholder and runs the body on a
//! child memo process.

use super::caller::{Caller, SyncCaller, SyncCell};
use super::cleanup;
use super::context::{self, Context};
use super::lru;
use super::refresher;
use super::revision::{lock_revision, Revision, RevisionRef};
use super::trace::MAX_TRACE_SIZE;
use super::value::MemoValue;
use super::{oldest_visible_txn, TxnId, NEVER_TXN};
use crate::error::{Result, RuntimeError};
use crate::object::{IObj, StateChange};
use rill_util::SpinLock;
use std::cell::Cell;

/// Which global list an invocation currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwningList {
    None,
    Lru,
    Cleanup,
}

/// Embedded bookkeeping for one memoized call. Lives in the interned
/// metadata of the invocation object, just before the refcount word.
#[repr(C)]
pub struct Invocation {
    mutex: SpinLock,
    owning_list: Cell<OwningList>,

    pub(super) lru_prev: Cell<*mut Invocation>,
    pub(super) lru_next: Cell<*mut Invocation>,

    /// Newest revision; `next` walks toward older entries.
    head: Cell<*mut Revision>,
    tail: Cell<*mut Revision>,

    /// Payload address of the interned object this struct is embedded in.
    self_iobj: Cell<usize>,
}

unsafe impl Send for Invocation {}
unsafe impl Sync for Invocation {}

/// Interned-metadata bytes reserved for the embedded struct.
pub fn invocation_extra_bytes() -> usize {
    rill_util::round_up(std::mem::size_of::<Invocation>(), 8)
}

impl Invocation {
    /// The embedded invocation of an interned invocation object.
    pub fn from_iobj(iobj: IObj) -> &'static Invocation {
        let base = iobj.addr() - iobj.type_().interned_metadata_byte_size();
        unsafe { &*(base as *const Invocation) }
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self as *const Invocation as usize
    }

    /// The interned object this struct is embedded in.
    pub fn as_iobj(&self) -> IObj {
        unsafe { IObj::from_addr(self.self_iobj.get()) }
    }

    #[inline]
    pub(super) fn mutex(&self) -> &SpinLock {
        &self.mutex
    }

    pub(super) fn owning_list(&self) -> OwningList {
        self.owning_list.get()
    }

    pub(super) fn set_owning_list(&self, list: OwningList) {
        self.owning_list.set(list);
    }

    /// Number of revisions in the list (test support; takes the lock).
    pub fn revision_count(&self) -> usize {
        let _guard = lock_invocation(self);
        let mut count = 0;
        let mut cursor = self.head.get();
        while !cursor.is_null() {
            count += 1;
            cursor = unsafe { (*cursor).next.get() };
        }
        count
    }

    /// The newest revision (test and transaction support; caller holds
    /// the lock).
    pub(super) fn head_lck(&self) -> *mut Revision {
        self.head.get()
    }

    /// Detach every revision, cutting them loose to survive on their own
    /// as graph nodes.
    pub(super) fn detach_revisions_lck(&self) {
        while !self.head.get().is_null() {
            let head = self.head.get();
            detach_revision_lck(self, head, false);
        }
    }

    /// Discard cached state no task can query anymore.
    pub(super) fn cleanup_lck(&self) {
        let oldest = oldest_visible_txn();
        loop {
            let tail = self.tail.get();
            if tail.is_null() {
                break;
            }
            let rev = unsafe { &*tail };
            if rev.end_lck() > oldest {
                break;
            }
            // Keep a refreshable head: it can still extend its lifespan
            // to serve future queries without a recompute.
            if tail == self.head.get() && rev.can_refresh() && rev.has_trace_lck() {
                break;
            }
            detach_revision_lck(self, tail, false);
        }

        let tail = self.tail.get();
        let tail_end = if tail.is_null() {
            NEVER_TXN
        } else {
            unsafe { &*tail }.end_lck()
        };
        if tail_end != NEVER_TXN && tail_end > oldest {
            cleanup::register_cleanup_lck(self, tail_end);
        } else {
            lru::move_to_head_lck(self);
        }
    }

    pub fn verify_invariants_lck(&self) {
        if cfg!(debug_assertions) {
            let mut cursor = self.head.get();
            let mut last_begin = NEVER_TXN + 1;
            while !cursor.is_null() {
                let rev = unsafe { &*cursor };
                assert!(rev.begin_lck() < last_begin, "revision list out of order");
                last_begin = rev.begin_lck();
                rev.verify_invariants_lck();
                cursor = rev.next.get();
            }
        }
    }
}

/// RAII lock on an invocation (and thereby on its whole revision list).
pub struct InvocationLockGuard<'a> {
    inv: &'a Invocation,
}

impl<'a> InvocationLockGuard<'a> {
    pub fn invocation(&self) -> &Invocation {
        self.inv
    }
}

impl Drop for InvocationLockGuard<'_> {
    fn drop(&mut self) {
        self.inv.mutex.unlock();
        crate::lock::note_unlocked(self.inv.addr());
    }
}

pub fn lock_invocation(inv: &Invocation) -> InvocationLockGuard<'_> {
    inv.mutex.lock();
    crate::lock::note_locked(inv.addr());
    InvocationLockGuard { inv }
}

/// State-change hook driven by the interner for invocation-kind objects.
pub fn invocation_on_state_change(iobj: IObj, change: StateChange) {
    let base = iobj.addr() - iobj.type_().interned_metadata_byte_size();
    match change {
        StateChange::Initialize => unsafe {
            std::ptr::write(
                base as *mut Invocation,
                Invocation {
                    mutex: SpinLock::new(),
                    owning_list: Cell::new(OwningList::None),
                    lru_prev: Cell::new(std::ptr::null_mut()),
                    lru_next: Cell::new(std::ptr::null_mut()),
                    head: Cell::new(std::ptr::null_mut()),
                    tail: Cell::new(std::ptr::null_mut()),
                    self_iobj: Cell::new(iobj.addr()),
                },
            );
        },
        StateChange::Finalize => {
            let inv = unsafe { &*(base as *const Invocation) };
            let owning = {
                let guard = lock_invocation(inv);
                // Attached revisions hold references on the invocation,
                // so a finalizing invocation has none left.
                guard.invocation().detach_revisions_lck();
                let owning = inv.owning_list();
                if owning == OwningList::Lru {
                    lru::remove_lck(inv);
                } else {
                    inv.set_owning_list(OwningList::None);
                }
                owning
            };
            if owning == OwningList::Cleanup {
                cleanup::forget_invocation(iobj.addr());
            }
        }
    }
}

// ----------------------------------------------------------------------
// List maintenance

fn unlink_lck(inv: &Invocation, rev: *mut Revision) {
    let r = unsafe { &*rev };
    let prev = r.prev.get();
    let next = r.next.get();
    if prev.is_null() {
        inv.head.set(next);
    } else {
        unsafe { (*prev).next.set(next) };
    }
    if next.is_null() {
        inv.tail.set(prev);
    } else {
        unsafe { (*next).prev.set(prev) };
    }
    r.prev.set(std::ptr::null_mut());
    r.next.set(std::ptr::null_mut());
}

/// Remove a revision from the list, detaching it from its owner and
/// dropping the list's reference.
pub(super) fn detach_revision_lck(inv: &Invocation, rev: *mut Revision, keep_can_refresh: bool) {
    unlink_lck(inv, rev);
    let r = unsafe { &*rev };
    r.owner_and_flags.detach(keep_can_refresh);
    r.decref();
}

/// Link `rev` (one reference transferred to the list) at its sorted
/// position: begins strictly descending from head to tail.
fn link_sorted_lck(inv: &Invocation, rev: RevisionRef) {
    let rev_ptr = rev.into_raw();
    let begin = unsafe { &*rev_ptr }.begin_lck();

    let mut after: *mut Revision = std::ptr::null_mut(); // newer neighbor
    let mut cursor = inv.head.get();
    while !cursor.is_null() && unsafe { &*cursor }.begin_lck() > begin {
        after = cursor;
        cursor = unsafe { &*cursor }.next.get();
    }

    let r = unsafe { &*rev_ptr };
    r.prev.set(after);
    r.next.set(cursor);
    if after.is_null() {
        inv.head.set(rev_ptr);
    } else {
        unsafe { (*after).next.set(rev_ptr) };
    }
    if cursor.is_null() {
        inv.tail.set(rev_ptr);
    } else {
        unsafe { (*cursor).prev.set(rev_ptr) };
    }
    r.owner_and_flags.mark_attached();
}

/// Link a freshly committed head revision (transaction support; caller
/// holds the invocation's lock).
pub(super) fn link_revision_for_commit(inv: &Invocation, rev: RevisionRef) {
    link_sorted_lck(inv, rev);
}

/// Seed an invocation (a cell, or a deserialized cache entry) with a
/// permanent initial revision `[1, never)`.
pub(super) fn install_initial_revision(inv: &Invocation, value: MemoValue) {
    let guard = lock_invocation(inv);
    let rev = Revision::new(1, NEVER_TXN, value, Some(inv));
    link_sorted_lck(guard.invocation(), rev);
}

/// Insert a computed revision, resolving every touch case against the
/// existing list, and return the revision that finally carries the value
/// (the inserted one, or an equal-valued neighbor it merged into).
pub(super) fn insert_revision_lck(inv: &Invocation, insert: RevisionRef) -> RevisionRef {
    let mut i_begin = insert.begin_lck();
    let mut i_end = insert.end_lck();

    let mut merge_into: Option<RevisionRef> = None;
    let mut cursor = inv.head.get();
    while !cursor.is_null() {
        let rev = unsafe { &*cursor };
        let next = rev.next.get();
        if cursor == insert.as_ptr() {
            cursor = next;
            continue;
        }
        let r_begin = rev.begin_lck();
        let r_end = rev.end_lck();
        let overlaps = r_begin < i_end && i_begin < r_end;
        let touches = r_begin == i_end || r_end == i_begin;

        if rev.is_placeholder_lck() {
            if overlaps {
                if i_begin <= r_begin && r_end <= i_end {
                    // Fully engulfed: its context will install its own
                    // result independently.
                    detach_revision_lck(inv, cursor, true);
                } else if r_begin < i_begin && i_end < r_end {
                    // Straddles us: keep only the older part, which still
                    // covers its original query transaction.
                    rev.set_end_lck(i_begin);
                } else if r_begin < i_begin {
                    rev.set_end_lck(i_begin);
                } else {
                    rev.set_begin_lck(i_end);
                }
            }
        } else if rev.value_lck().is_language_value() {
            if (overlaps || touches) && *rev.value_lck() == *insert.value_lck() {
                merge_into = Some(RevisionRef::acquire(cursor));
            } else if overlaps {
                // Two different values overlapping means the memoized
                // function was not deterministic. Leave the existing
                // entry in place and clip ourselves around it.
                log::warn!(
                    "non-deterministic memoized value: [{}, {}) overlaps [{}, {})",
                    i_begin,
                    i_end,
                    r_begin,
                    r_end
                );
                if r_begin > i_begin {
                    i_end = i_end.min(r_begin);
                } else {
                    i_begin = i_begin.max(r_end);
                }
                insert.set_begin_lck(i_begin.min(i_end - 1));
                insert.set_end_lck(i_end);
            }
        }
        cursor = next;
    }

    if let Some(existing) = merge_into {
        // Merge lifespans into the older, better-traced revision.
        let (keep, discard) = if existing.begin_lck() <= insert.begin_lck() {
            (existing, insert)
        } else {
            (insert, existing)
        };
        let begin = keep.begin_lck().min(discard.begin_lck());
        let end = keep.end_lck().max(discard.end_lck());
        keep.set_begin_lck(begin);
        keep.set_end_lck(end);
        if !keep.has_trace_lck() && discard.has_trace_lck() {
            keep.steal_trace_lck(&discard);
        }
        if discard.is_attached() {
            detach_revision_lck(inv, discard.as_ptr(), false);
        } else {
            let _discard_lock = lock_revision(discard.as_ptr());
            discard.clear_trace_lck();
        }
        drop(discard);
        if !keep.is_attached() {
            link_sorted_lck(inv, keep.clone());
        }
        return keep;
    }

    link_sorted_lck(inv, insert.clone());
    insert
}

// ----------------------------------------------------------------------
// Evaluation

/// Compute the value of `inv_iobj` at `caller`'s query transaction, then
/// call `caller.add_dependency` with the covering revision locked and
/// finally `caller.finish` with no locks held.
pub fn evaluate(inv_iobj: IObj, mut caller: Box<dyn Caller>) {
    let inv = Invocation::from_iobj(inv_iobj);
    let query = caller.query_txn();
    debug_assert!(query > 0 && query < NEVER_TXN);

    let guard = lock_invocation(inv);
    lru::move_to_head_lck(inv);

    let mut cursor = inv.head.get();
    while !cursor.is_null() {
        let rev = unsafe { &*cursor };
        if rev.begin_lck() <= query {
            if query < rev.end_lck() {
                if let Some(ctx) = rev.placeholder_context_lck() {
                    // In flight: suspend on the context.
                    unsafe { &*ctx }.add_caller(caller);
                    return;
                }
                if rev.value_lck().is_language_value() {
                    caller.add_dependency(rev);
                    drop(guard);
                    caller.finish();
                    return;
                }
            } else if cursor == inv.head.get() && rev.can_refresh() && rev.has_trace_lck() {
                // The newest entry ended before the query but may be
                // extendable without re-running the body.
                let rev_ref = RevisionRef::acquire(cursor);
                drop(guard);
                refresher::async_refresh(rev_ref, caller);
                return;
            }
            break;
        }
        cursor = rev.next.get();
    }

    // Miss: insert a placeholder and run the body.
    let entry = inv_iobj
        .vtable()
        .vtable()
        .entry()
        .unwrap_or_else(|| crate::fatal!("evaluating an invocation with no entry point"));

    let mut end_bound = NEVER_TXN;
    let mut cursor = inv.head.get();
    while !cursor.is_null() {
        let rev = unsafe { &*cursor };
        if rev.begin_lck() > query {
            end_bound = rev.begin_lck();
            cursor = rev.next.get();
        } else {
            break;
        }
    }

    inv_iobj.incref();
    let ctx = Box::into_raw(Context::new(Some(inv_iobj), query));
    let placeholder = Revision::new(query, end_bound, MemoValue::Context(ctx), Some(inv));
    unsafe {
        (*ctx).set_placeholder(placeholder.clone());
        (*ctx).add_caller(caller);
    }
    link_sorted_lck(inv, placeholder);
    drop(guard);

    log::trace!("evaluate: miss for {:#x} at txn {}", inv_iobj.addr(), query);
    let _ctx_guard = context::Guard::new(ctx);
    crate::process::with_memo_process(|| entry(inv_iobj));
}

/// Trade a completed context's placeholder for a real revision and
/// notify everyone waiting. Consumes the context.
pub(super) fn replace_placeholder(ctx: Box<Context>, value: MemoValue) {
    let inv_iobj = ctx
        .owner()
        .unwrap_or_else(|| crate::fatal!("completing a context with no owning invocation"));
    let inv = Invocation::from_iobj(inv_iobj);

    let inputs = ctx.linearize_trace();
    let placeholder = ctx.take_placeholder();

    let guard = lock_invocation(inv);

    if let Some(ph) = placeholder.as_ref() {
        // Clear the placeholder's context pointer before the context is
        // freed, whether or not the placeholder is still listed.
        ph.set_value_lck(MemoValue::Undef);
        if ph.is_attached() {
            detach_revision_lck(inv, ph.as_ptr(), false);
        }
    }

    let begin = if inputs.is_empty() { 0 } else { 1 };
    let result = Revision::new(begin, NEVER_TXN, value, Some(inv));
    let inputs = collapse_trace_inputs(inputs);
    result.create_trace_lck(inputs);
    let final_rev = insert_revision_lck(inv, result);

    // Schedule trimming once the oldest finite tail expires. An
    // already-expired tail still registers: its list retires as soon as
    // the tasks pinned at that transaction drain.
    let tail = inv.tail.get();
    if !tail.is_null() {
        let tail_end = unsafe { &*tail }.end_lck();
        if tail_end != NEVER_TXN {
            cleanup::register_cleanup_lck(inv, tail_end);
        }
    }

    let callers = ctx.take_callers();
    drop(guard);
    drop(ctx);
    // The placeholder reference (if any) drops here, after all locks.
    drop(placeholder);

    for mut caller in callers {
        let covered = {
            let rev_guard = lock_revision(final_rev.as_ptr());
            let rev = rev_guard.revision();
            let covered = rev.contains_lck(caller.query_txn())
                && rev.value_lck().is_language_value();
            if covered {
                caller.add_dependency(rev);
            }
            covered
        };
        if covered {
            caller.finish();
        } else {
            caller.retry();
        }
    }
}

/// Collapse an oversized dependency list into a tree of dummy revisions
/// so every trace fits one array.
fn collapse_trace_inputs(mut inputs: Vec<RevisionRef>) -> Vec<RevisionRef> {
    while inputs.len() > MAX_TRACE_SIZE {
        let mut grouped = Vec::with_capacity(inputs.len().div_ceil(MAX_TRACE_SIZE));
        for group in inputs.chunks(MAX_TRACE_SIZE) {
            if group.len() == 1 {
                grouped.push(group[0].clone());
                continue;
            }
            let dummy = Revision::new(1, NEVER_TXN, MemoValue::Undef, None);
            {
                let _dummy_lock = lock_revision(dummy.as_ptr());
                dummy.create_trace_lck(group.to_vec());
            }
            grouped.push(dummy);
        }
        inputs = grouped;
    }
    inputs
}

/// Synchronous front door: evaluate and block for the result.
pub fn evaluate_sync(inv_iobj: IObj, txn: Option<TxnId>) -> Result<MemoValue> {
    let task = cleanup::create_memo_task();
    let query = txn.unwrap_or_else(|| task.query_txn());
    loop {
        let cell = SyncCell::new();
        evaluate(inv_iobj, SyncCaller::new(query, cell.clone()));
        match cell.wait() {
            Err(()) => {
                return Err(RuntimeError::Runtime(
                    "memoized value could not be refreshed or recomputed".into(),
                ))
            }
            Ok(None) => continue,
            Ok(Some(value)) => {
                if value.is_exception() {
                    return Err(RuntimeError::Runtime(
                        "memoized computation threw an exception".into(),
                    ));
                }
                return Ok(value);
            }
        }
    }
}
