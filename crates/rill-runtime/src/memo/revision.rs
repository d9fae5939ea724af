//! Revision - one cached value over a [begin, end) lifespan
//!
//! A revision asserts "the memoized value equals V for every transaction
//! in `[begin, end)`"; `end == NEVER_TXN` means still valid as of the
//! newest commit. Revisions serve two roles: MVCC entries in an
//! invocation's list, and nodes in the dependency graph. A revision can
//! outlive its invocation, surviving as a graph node long after the list
//! forgot it.
//!
//! ## Locking
//!
//! The `OwnerAndFlags` word is the revision's lock. While the revision is
//! attached to an invocation, locking it delegates to the invocation's
//! mutex (locking any revision of a list locks the whole list); once
//! detached it switches to the embedded lock bits. The word also packs a
//! reference counter on the owner pointer itself so a thread that sampled
//! a non-null owner can safely take its mutex: the owner field is only
//! nulled after the counter drains to zero.

use super::context::Context;
use super::edge::{EdgeIndex, UpEdge};
use super::invocation::Invocation;
use super::refresher::Refresher;
use super::subs::SubscriptionSet;
use super::trace::Trace;
use super::value::MemoValue;
use super::{TxnId, NEVER_TXN};
use std::cell::{Cell, UnsafeCell};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

const LOCK_BIT: usize = 0b01;
// The second lock bit doubles as "this word still holds its base count
// on the owner field" (set at construction, dropped by detach).
const OWNER_REF_FLAG: usize = 0b10;
const ATTACHED_FLAG: usize = 0b100;
const CAN_REFRESH_FLAG: usize = 0b1000;
const COUNT_ONE: usize = 1 << 4;
const COUNT_MASK: usize = 0x1fff << 4;
const OWNER_SHIFT: u32 = 17;

/// Packed lock, flags, owner refcount and owner pointer. See module docs.
pub struct OwnerAndFlags {
    bits: AtomicUsize,
}

impl OwnerAndFlags {
    fn new(owner: Option<&Invocation>) -> OwnerAndFlags {
        let bits = match owner {
            Some(inv) => {
                // This object holds one count on the owner field and one
                // refcount on the owning invocation's interned object.
                // The revision is not attached until it is linked into
                // the owner's list.
                inv.as_iobj().incref();
                ((inv.addr()) << OWNER_SHIFT) | OWNER_REF_FLAG | CAN_REFRESH_FLAG | COUNT_ONE
            }
            None => CAN_REFRESH_FLAG,
        };
        OwnerAndFlags {
            bits: AtomicUsize::new(bits),
        }
    }

    #[inline]
    fn load(&self) -> usize {
        self.bits.load(Ordering::Acquire)
    }

    #[inline]
    fn owner_addr(bits: usize) -> usize {
        bits >> OWNER_SHIFT
    }

    pub fn is_attached(&self) -> bool {
        self.load() & ATTACHED_FLAG != 0
    }

    pub fn can_refresh(&self) -> bool {
        self.load() & CAN_REFRESH_FLAG != 0
    }

    pub fn clear_can_refresh(&self) {
        self.bits.fetch_and(!CAN_REFRESH_FLAG, Ordering::AcqRel);
    }

    /// The owning invocation, while the owner field has not been nulled.
    pub fn owner(&self) -> Option<NonNull<Invocation>> {
        NonNull::new(Self::owner_addr(self.load()) as *mut Invocation)
    }

    /// Mark the revision as linked into its owner's list.
    pub fn mark_attached(&self) {
        self.bits.fetch_or(ATTACHED_FLAG, Ordering::AcqRel);
    }

    /// Drop one count on the owner field; the thread that drives it to
    /// zero (only possible once detached) nulls the field and releases
    /// the invocation reference.
    fn release_count_ref(&self) {
        let mut bits = self.load();
        loop {
            debug_assert_ne!(bits & COUNT_MASK, 0, "owner count underflow");
            let mut new = bits - COUNT_ONE;
            let clearing_owner = new & COUNT_MASK == 0 && new & ATTACHED_FLAG == 0;
            if clearing_owner {
                new &= (1 << OWNER_SHIFT) - 1;
            }
            match self
                .bits
                .compare_exchange_weak(bits, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if clearing_owner {
                        let addr = Self::owner_addr(bits);
                        if addr != 0 {
                            let inv = unsafe { &*(addr as *const Invocation) };
                            crate::lock::safe_decref_iobj(inv.as_iobj());
                        }
                    }
                    return;
                }
                Err(observed) => bits = observed,
            }
        }
    }

    /// Sever the revision from its owner: clear the attached flag and
    /// drop the base count this object held on the owner field.
    pub fn detach(&self, keep_can_refresh: bool) {
        let mut clear = ATTACHED_FLAG | OWNER_REF_FLAG;
        if !keep_can_refresh {
            clear |= CAN_REFRESH_FLAG;
        }
        let old = self.bits.fetch_and(!clear, Ordering::AcqRel);
        if old & OWNER_REF_FLAG != 0 {
            self.release_count_ref();
        }
    }
}

/// How a revision lock was taken.
enum LockedVia {
    /// Through the owning invocation's mutex (a count ref is held).
    Owner(usize),
    /// Through the embedded lock bits.
    Embedded,
    /// The needed lock was already held by this thread (delegated locks
    /// can alias); nothing to release.
    AlreadyHeld,
}

/// RAII lock on one revision.
pub struct RevisionLockGuard {
    rev: *mut Revision,
    via: LockedVia,
}

impl RevisionLockGuard {
    pub fn revision(&self) -> &Revision {
        unsafe { &*self.rev }
    }
}

impl Drop for RevisionLockGuard {
    fn drop(&mut self) {
        let rev = unsafe { &*self.rev };
        // The physical unlock happens before the bookkeeping: the
        // zero-locks transition may drain deferred work that takes this
        // very lock again.
        match self.via {
            LockedVia::AlreadyHeld => {}
            LockedVia::Embedded => {
                rev.owner_and_flags
                    .bits
                    .fetch_and(!LOCK_BIT, Ordering::Release);
                crate::lock::note_unlocked(self.rev as usize);
            }
            LockedVia::Owner(addr) => {
                let inv = unsafe { &*(addr as *const Invocation) };
                inv.mutex().unlock();
                crate::lock::note_unlocked(addr);
                rev.owner_and_flags.release_count_ref();
            }
        }
    }
}

/// Lock a revision, delegating to the owning invocation while attached.
pub fn lock_revision(rev: *mut Revision) -> RevisionLockGuard {
    let flags = unsafe { &(*rev).owner_and_flags };
    loop {
        let bits = flags.load();
        let owner_addr = OwnerAndFlags::owner_addr(bits);
        if owner_addr != 0 {
            if crate::lock::is_held(owner_addr) {
                return RevisionLockGuard {
                    rev,
                    via: LockedVia::AlreadyHeld,
                };
            }
            // Pin the owner field with a count ref before dereferencing.
            if flags
                .bits
                .compare_exchange_weak(bits, bits + COUNT_ONE, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let inv = unsafe { &*(owner_addr as *const Invocation) };
            inv.mutex().lock();
            crate::lock::note_locked(owner_addr);
            if OwnerAndFlags::owner_addr(flags.load()) == owner_addr {
                return RevisionLockGuard {
                    rev,
                    via: LockedVia::Owner(owner_addr),
                };
            }
            // The revision was detached while we were acquiring; retry.
            crate::lock::note_unlocked(owner_addr);
            inv.mutex().unlock();
            flags.release_count_ref();
            continue;
        }

        if crate::lock::is_held(rev as usize) {
            return RevisionLockGuard {
                rev,
                via: LockedVia::AlreadyHeld,
            };
        }
        if bits & LOCK_BIT == 0
            && flags
                .bits
                .compare_exchange_weak(
                    bits,
                    bits | LOCK_BIT,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            crate::lock::note_locked(rev as usize);
            return RevisionLockGuard {
                rev,
                via: LockedVia::Embedded,
            };
        }
        std::hint::spin_loop();
    }
}

/// The lock-manager key a revision currently locks under.
pub fn revision_lock_key(rev: *mut Revision) -> usize {
    let flags = unsafe { &(*rev).owner_and_flags };
    match flags.owner() {
        Some(inv) => inv.as_ptr() as usize,
        None => rev as usize,
    }
}

/// One MVCC cache entry and dependency-graph node.
#[repr(C, align(64))]
pub struct Revision {
    pub(super) owner_and_flags: OwnerAndFlags,
    refcount: AtomicU32,

    /// List links; protected by the owning invocation's lock.
    pub(super) prev: Cell<*mut Revision>,
    pub(super) next: Cell<*mut Revision>,

    begin: Cell<TxnId>,
    end: Cell<TxnId>,

    value: UnsafeCell<MemoValue>,

    /// Inverse edges; protected by this revision's lock.
    pub(super) subs: SubscriptionSet,

    /// Input edges; protected by this revision's lock.
    pub(super) trace: UnsafeCell<Trace>,

    /// In-flight refresh state machine, if any.
    pub(super) refresher: Cell<*mut Refresher>,
}

// Revisions are shared across threads under the locking discipline above.
unsafe impl Send for Revision {}
unsafe impl Sync for Revision {}

static_assertions::const_assert!(std::mem::align_of::<Revision>() == 64);

/// Reference-counted handle to a revision.
pub struct RevisionRef {
    ptr: NonNull<Revision>,
}

unsafe impl Send for RevisionRef {}

impl RevisionRef {
    /// Adopt an existing reference (does not incref).
    pub unsafe fn from_raw(ptr: *mut Revision) -> RevisionRef {
        RevisionRef {
            ptr: NonNull::new_unchecked(ptr),
        }
    }

    /// Take a new reference.
    pub fn acquire(ptr: *mut Revision) -> RevisionRef {
        unsafe { &*ptr }.incref();
        unsafe { RevisionRef::from_raw(ptr) }
    }

    pub fn as_ptr(&self) -> *mut Revision {
        self.ptr.as_ptr()
    }

    /// Give up ownership without releasing the reference.
    pub fn into_raw(self) -> *mut Revision {
        let ptr = self.ptr.as_ptr();
        std::mem::forget(self);
        ptr
    }
}

impl Clone for RevisionRef {
    fn clone(&self) -> RevisionRef {
        RevisionRef::acquire(self.ptr.as_ptr())
    }
}

impl Drop for RevisionRef {
    fn drop(&mut self) {
        unsafe { self.ptr.as_ref() }.decref();
    }
}

impl std::ops::Deref for RevisionRef {
    type Target = Revision;
    fn deref(&self) -> &Revision {
        unsafe { self.ptr.as_ref() }
    }
}

impl Revision {
    /// Allocate a new revision with one reference.
    pub fn new(
        begin: TxnId,
        end: TxnId,
        value: MemoValue,
        owner: Option<&Invocation>,
    ) -> RevisionRef {
        debug_assert!(begin < end);
        let rev = Box::into_raw(Box::new(Revision {
            owner_and_flags: OwnerAndFlags::new(owner),
            refcount: AtomicU32::new(1),
            prev: Cell::new(std::ptr::null_mut()),
            next: Cell::new(std::ptr::null_mut()),
            begin: Cell::new(begin),
            end: Cell::new(end),
            value: UnsafeCell::new(value),
            subs: SubscriptionSet::default(),
            trace: UnsafeCell::new(Trace::default()),
            refresher: Cell::new(std::ptr::null_mut()),
        }));
        unsafe { RevisionRef::from_raw(rev) }
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut Revision {
        self as *const Revision as *mut Revision
    }

    pub fn incref(&self) {
        let old = self.refcount.fetch_add(1, Ordering::Relaxed);
        debug_assert_ne!(old, 0, "incref of dead revision");
    }

    /// Deferred decref through the lock manager.
    pub fn decref(&self) {
        crate::lock::safe_decref_revision(self.as_mut_ptr());
    }

    pub fn current_refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }

    // ---- lifespan ----

    /// Requires this revision's lock (or the owning invocation's).
    #[inline]
    pub fn begin_lck(&self) -> TxnId {
        self.begin.get()
    }

    #[inline]
    pub fn set_begin_lck(&self, begin: TxnId) {
        self.begin.set(begin);
    }

    /// Requires this revision's lock (or the owning invocation's).
    #[inline]
    pub fn end_lck(&self) -> TxnId {
        self.end.get()
    }

    #[inline]
    pub fn set_end_lck(&self, end: TxnId) {
        self.end.set(end);
    }

    /// Unlocked read of the lifespan for heuristics; the value may be
    /// stale by the time it is used.
    #[inline]
    pub fn end_relaxed(&self) -> TxnId {
        self.end.get()
    }

    /// Does `[begin, end)` contain `txn`?
    #[inline]
    pub fn contains_lck(&self, txn: TxnId) -> bool {
        self.begin.get() <= txn && txn < self.end.get()
    }

    // ---- value ----

    pub fn value_lck(&self) -> &MemoValue {
        unsafe { &*self.value.get() }
    }

    pub fn value_clone_lck(&self) -> MemoValue {
        self.value_lck().clone()
    }

    pub fn set_value_lck(&self, value: MemoValue) {
        unsafe { *self.value.get() = value };
    }

    /// The in-flight context if this is a placeholder.
    pub fn placeholder_context_lck(&self) -> Option<*mut Context> {
        self.value_lck().as_context()
    }

    pub fn is_placeholder_lck(&self) -> bool {
        self.placeholder_context_lck().is_some()
    }

    // ---- ownership ----

    pub fn is_attached(&self) -> bool {
        self.owner_and_flags.is_attached()
    }

    /// The owning invocation (as its embedded struct), if attached.
    pub fn owner_lck(&self) -> Option<&Invocation> {
        self.owner_and_flags
            .owner()
            .map(|ptr| unsafe { &*ptr.as_ptr() })
    }

    /// Pure values have no inputs and can never become invalid; they are
    /// not graph nodes.
    pub fn is_pure_lck(&self) -> bool {
        self.trace_lck().is_empty() && self.begin.get() == 0
    }

    pub fn can_refresh(&self) -> bool {
        self.owner_and_flags.can_refresh()
    }

    /// Discard the trace and bar future refresh attempts; recovers the
    /// trace memory.
    pub fn prevent_refresh_lck(&self) {
        self.owner_and_flags.clear_can_refresh();
        self.clear_trace_lck();
    }

    // ---- trace ----

    pub fn trace_lck(&self) -> &Trace {
        unsafe { &*self.trace.get() }
    }

    pub fn has_trace_lck(&self) -> bool {
        !self.trace_lck().is_empty()
    }

    /// Unsubscribe from and release every input.
    pub fn clear_trace_lck(&self) {
        let trace = unsafe { &mut *self.trace.get() }.take();
        trace.for_each(|_, edge| {
            if edge.is_null() {
                return;
            }
            let input = edge.target();
            {
                let _input_lock = lock_revision(input);
                unsafe { &(*input).subs }.unsubscribe(edge);
            }
            unsafe { &*input }.decref();
        });
    }

    /// Build this revision's trace from its inputs, subscribing to each
    /// and intersecting their lifespans into ours. Steals the references
    /// held by `inputs`.
    ///
    /// Caller holds this revision's lock; the inputs are locked one at a
    /// time (trace owner before trace target).
    pub fn create_trace_lck(&self, inputs: Vec<RevisionRef>) {
        debug_assert!(self.trace_lck().is_empty());
        let trace = Trace::with_size(inputs.len());
        for (index, input) in inputs.into_iter().enumerate() {
            let slot = index as EdgeIndex;
            let input_ptr = input.into_raw();
            let input_lock = lock_revision(input_ptr);
            let input_rev = input_lock.revision();

            let down = input_rev
                .subs
                .subscribe(input_ptr, UpEdge::new(self.as_mut_ptr(), slot));
            trace.assign(slot, down);

            // Atomically with subscribing, pick up the input's lifespan.
            if input_rev.end_lck() != NEVER_TXN {
                trace.set_inactive(slot);
            }
            self.begin.set(self.begin.get().max(input_rev.begin_lck()));
            self.end.set(self.end.get().min(input_rev.end_lck().max(self.begin.get() + 1)));
        }
        unsafe { *self.trace.get() = trace };
    }

    /// Move `other`'s trace onto this revision, rewiring the inputs'
    /// subscriptions to point back at us. Both revisions are locked.
    pub fn steal_trace_lck(&self, other: &Revision) {
        self.clear_trace_lck();
        let trace = unsafe { &mut *other.trace.get() }.take();
        trace.for_each(|slot, edge| {
            if edge.is_null() {
                return;
            }
            let input = edge.target();
            let _input_lock = lock_revision(input);
            unsafe { &(*input).subs }.reassign(edge, UpEdge::new(self.as_mut_ptr(), slot));
        });
        unsafe { *self.trace.get() = trace };
    }

    // ---- subscriptions ----

    /// Subscribe `subscriber`'s trace slot to this revision. Both
    /// revisions are locked by the caller.
    pub fn subscribe_lck(&self, subscriber: &Revision, slot: EdgeIndex) {
        let down = self
            .subs
            .subscribe(self.as_mut_ptr(), UpEdge::new(subscriber.as_mut_ptr(), slot));
        subscriber.trace_lck().assign(slot, down);
        if self.end_lck() != NEVER_TXN {
            subscriber.trace_lck().set_inactive(slot);
            if subscriber.end_lck() > self.end_lck() {
                subscriber.set_end_lck(self.end_lck().max(subscriber.begin_lck() + 1));
            }
        }
    }

    /// Queue invalidation of every subscriber; runs at the next
    /// zero-locks transition. Caller holds this revision's lock.
    pub fn invalidate_subscribers_lck(&self) {
        self.subs.for_each(crate::lock::push_invalidation);
    }

    /// Number of live subscribers (test support).
    pub fn subscriber_count_lck(&self) -> usize {
        self.subs.len()
    }

    pub fn verify_invariants_lck(&self) {
        if cfg!(debug_assertions) {
            assert!(self.begin.get() < self.end.get());
            let trace = self.trace_lck();
            trace.for_each(|slot, edge| {
                if !edge.is_null() {
                    assert!(!edge.target().is_null());
                    let _ = slot;
                }
            });
        }
    }
}

/// Deliver one queued invalidation: mark the subscriber's trace slot
/// inactive, shrink its lifespan to the producer's, and propagate to its
/// own subscribers if it just became invalid. Runs with no locks held.
pub fn apply_invalidation(edge: UpEdge) {
    let subscriber_ptr = edge.subscriber();
    let guard = lock_revision(subscriber_ptr);
    let subscriber = guard.revision();

    let slot = edge.trace_slot();
    let trace = subscriber.trace_lck();
    if trace.is_empty() || slot as usize >= trace.size() {
        // The trace was discarded while this invalidation was in flight.
        return;
    }
    let down = trace.get(slot);
    if down.is_null() {
        return;
    }
    let producer = down.target();
    let producer_end = unsafe { &*producer }.end_relaxed();

    trace.set_inactive(slot);

    let old_end = subscriber.end_lck();
    let new_end = old_end.min(producer_end.max(subscriber.begin_lck() + 1));
    if new_end < old_end {
        subscriber.set_end_lck(new_end);
        log::trace!(
            "invalidate: revision {:p} end {} -> {}",
            subscriber_ptr,
            old_end,
            new_end
        );
        if old_end == NEVER_TXN {
            // Newly invalid: notify watchers and keep pushing upward.
            if let MemoValue::Watcher(watcher) = subscriber.value_lck() {
                crate::lock::queue_watcher_notification(watcher.clone());
            }
            subscriber.invalidate_subscribers_lck();
        }
    }
}

/// Final decref processing, driven by the lock manager drain.
pub(crate) fn decref_assuming_no_locks(rev: *mut Revision) {
    let revision = unsafe { &*rev };
    let old = revision.refcount.fetch_sub(1, Ordering::AcqRel);
    debug_assert_ne!(old, 0, "decref of dead revision");
    if old != 1 {
        return;
    }

    {
        let guard = lock_revision(rev);
        guard.revision().clear_trace_lck();
        debug_assert_eq!(guard.revision().subs.len(), 0);
    }
    // Detach drops the reference the owner word holds on the invocation.
    revision.owner_and_flags.detach(false);
    unsafe { drop(Box::from_raw(rev)) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_revision_basics() {
        let rev = Revision::new(3, NEVER_TXN, MemoValue::Int64(42), None);
        let guard = lock_revision(rev.as_ptr());
        assert_eq!(guard.revision().begin_lck(), 3);
        assert_eq!(guard.revision().end_lck(), NEVER_TXN);
        assert!(guard.revision().contains_lck(3));
        assert!(guard.revision().contains_lck(1_000_000));
        assert!(!guard.revision().contains_lck(2));
        assert_eq!(guard.revision().value_lck().as_int64(), Some(42));
        drop(guard);
    }

    #[test]
    fn test_detached_lock_uses_embedded_bits() {
        let rev = Revision::new(1, 5, MemoValue::Null, None);
        assert!(!rev.is_attached());
        let guard = lock_revision(rev.as_ptr());
        // The same thread sees the lock as held and tolerates aliasing.
        assert!(crate::lock::is_held(rev.as_ptr() as usize));
        drop(guard);
        assert!(!crate::lock::is_held(rev.as_ptr() as usize));
    }

    #[test]
    fn test_subscribe_marks_inactive_for_finite_producer() {
        let producer = Revision::new(1, 10, MemoValue::Int64(1), None);
        let subscriber = Revision::new(5, NEVER_TXN, MemoValue::Int64(2), None);
        {
            let _sub_lock = lock_revision(subscriber.as_ptr());
            unsafe { *subscriber.trace.get() = Trace::with_size(1) };
            let _prod_lock = lock_revision(producer.as_ptr());
            producer.subscribe_lck(&subscriber, 0);
            assert!(subscriber.trace_lck().is_inactive(0));
            // Lifespan pulled down to the producer's end.
            assert_eq!(subscriber.end_lck(), 10);
            assert_eq!(producer.subscriber_count_lck(), 1);
        }
        // Tear the edge down manually: the trace owns one reference on
        // the producer which it never formally acquired in this test.
        producer.incref();
        {
            let guard = lock_revision(subscriber.as_ptr());
            guard.revision().clear_trace_lck();
        }
        {
            let guard = lock_revision(producer.as_ptr());
            assert_eq!(guard.revision().subscriber_count_lck(), 0);
        }
    }

    #[test]
    fn test_invalidation_propagates_and_shrinks() {
        let producer = Revision::new(1, NEVER_TXN, MemoValue::Int64(1), None);
        let subscriber = Revision::new(2, NEVER_TXN, MemoValue::Int64(2), None);
        {
            let _sub_lock = lock_revision(subscriber.as_ptr());
            unsafe { *subscriber.trace.get() = Trace::with_size(1) };
            let _prod_lock = lock_revision(producer.as_ptr());
            producer.subscribe_lck(&subscriber, 0);
            assert!(!subscriber.trace_lck().is_inactive(0));
            producer.incref(); // the trace edge's reference
        }

        // Simulate a commit truncating the producer.
        {
            let guard = lock_revision(producer.as_ptr());
            guard.revision().set_end_lck(7);
            guard.revision().invalidate_subscribers_lck();
        }
        // The queued invalidation ran at unlock; the subscriber shrank.
        {
            let guard = lock_revision(subscriber.as_ptr());
            assert_eq!(guard.revision().end_lck(), 7);
            assert!(guard.revision().trace_lck().is_inactive(0));
            guard.revision().clear_trace_lck();
        }
    }
}
