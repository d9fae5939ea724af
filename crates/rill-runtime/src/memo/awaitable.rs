//! Awaitable protocol - the completion ABI for compiled code
//!
//! An awaitable is a heap object whose first two words are `continuation`
//! and `next_awaitable`. The continuation word is a state machine:
//!
//! - [`VALUE_MARKER`]: the value is ready; the payload follows.
//! - [`EXCEPTION_MARKER`]: an exception object follows.
//! - any other non-zero value: the head of a linked list of awaitables
//!   waiting on this one.
//!
//! The memoize layer additionally uses a sentinel exception value,
//! [`context_is_awaiting`], inside the exception slot to encode "the
//! owning context wants this result" without allocating.
//!
//! Compiled memoized bodies complete through [`return_value`] /
//! [`throw_value`]; hosts drive memoized calls through [`memoize_call`].

use super::caller::Caller;
use super::context::Context;
use super::invocation;
use super::value::MemoValue;
use super::TxnId;
use crate::object::IObj;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Continuation state: value ready, payload follows.
pub const VALUE_MARKER: usize = 0b01;

/// Continuation state: exception object follows.
pub const EXCEPTION_MARKER: usize = 0b10;

/// The sentinel exception value marking "the owning context is awaiting
/// this result".
pub fn context_is_awaiting() -> MemoValue {
    MemoValue::FakePtr(-3)
}

/// Is `value` the context-is-awaiting sentinel?
pub fn is_context_awaiting(value: &MemoValue) -> bool {
    matches!(value, MemoValue::FakePtr(-3))
}

/// A completion slot driven by task posting. No stack capture: waiters
/// link themselves through `next` and are walked when the value lands.
#[repr(C)]
pub struct Awaitable {
    /// One of the markers above, or the head of the waiter list.
    continuation: AtomicUsize,

    /// Link used while this awaitable waits on another one.
    next: AtomicUsize,

    /// The completed value (or exception).
    value: Mutex<MemoValue>,
}

impl Awaitable {
    pub fn new() -> Awaitable {
        Awaitable {
            continuation: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            value: Mutex::new(MemoValue::Undef),
        }
    }

    /// Is the value (or exception) ready?
    pub fn is_ready(&self) -> bool {
        let state = self.continuation.load(Ordering::Acquire);
        state == VALUE_MARKER || state == EXCEPTION_MARKER
    }

    pub fn is_exception(&self) -> bool {
        self.continuation.load(Ordering::Acquire) == EXCEPTION_MARKER
    }

    /// Append `waiter` to this awaitable's waiter list.
    ///
    /// Returns false (without linking) if the value is already ready, in
    /// which case the caller should resume immediately.
    pub fn suspend(&self, waiter: *mut Awaitable) -> bool {
        let mut head = self.continuation.load(Ordering::Acquire);
        loop {
            if head == VALUE_MARKER || head == EXCEPTION_MARKER {
                return false;
            }
            unsafe { (*waiter).next.store(head, Ordering::Relaxed) };
            match self.continuation.compare_exchange_weak(
                head,
                waiter as usize,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => head = observed,
            }
        }
    }

    /// Install a completed value and return the waiter list head.
    fn complete(&self, value: MemoValue, marker: usize) -> usize {
        *self.value.lock() = value;
        let waiters = self.continuation.swap(marker, Ordering::AcqRel);
        if waiters == VALUE_MARKER || waiters == EXCEPTION_MARKER {
            crate::fatal!("awaitable completed twice");
        }
        waiters
    }

    /// Take the completed value.
    pub fn resume(&self) -> MemoValue {
        debug_assert!(self.is_ready());
        std::mem::take(&mut *self.value.lock())
    }
}

impl Default for Awaitable {
    fn default() -> Awaitable {
        Awaitable::new()
    }
}

/// Publish `value` into `awaitable` and walk its waiter list. Each
/// waiter is completed with the same value (shared completion fan-out).
pub fn notify_waiters_value_is_ready(awaitable: &Awaitable, value: MemoValue, exception: bool) {
    let marker = if exception {
        EXCEPTION_MARKER
    } else {
        VALUE_MARKER
    };
    let mut waiter = awaitable.complete(value.clone(), marker);
    while waiter != 0 && waiter != VALUE_MARKER && waiter != EXCEPTION_MARKER {
        let current = waiter as *mut Awaitable;
        let next = unsafe { (*current).next.swap(0, Ordering::AcqRel) };
        notify_waiters_value_is_ready(unsafe { &*current }, value.clone(), exception);
        waiter = next;
    }
}

/// Caller that completes an awaitable.
struct AwaitableCaller {
    query_txn: TxnId,
    awaitable: *mut Awaitable,
    value: Option<MemoValue>,
}

unsafe impl Send for AwaitableCaller {}

impl Caller for AwaitableCaller {
    fn query_txn(&self) -> TxnId {
        self.query_txn
    }

    fn add_dependency(&mut self, input: &super::revision::Revision) {
        if let Some(ctx) = Context::current() {
            ctx.add_dependency(input);
        }
        self.value = Some(input.value_clone_lck());
    }

    fn retry(self: Box<Self>) {
        // Start over at the same transaction.
        let awaitable = self.awaitable;
        let query_txn = self.query_txn;
        // The invocation is re-read from the awaitable's pending slot by
        // the caller of memoize_call; retries simply re-enter through
        // the stored invocation.
        let pending = PENDING.with(|p| p.borrow().get(&(awaitable as usize)).copied());
        match pending {
            Some(inv_addr) => {
                let inv = unsafe { IObj::from_addr(inv_addr) };
                invocation::evaluate(
                    inv,
                    Box::new(AwaitableCaller {
                        query_txn,
                        awaitable,
                        value: None,
                    }),
                );
            }
            None => crate::fatal!("retry of an unregistered awaitable"),
        }
    }

    fn finish(self: Box<Self>) {
        let value = self.value.unwrap_or_default();
        let exception = value.is_exception();
        PENDING.with(|p| p.borrow_mut().remove(&(self.awaitable as usize)));
        notify_waiters_value_is_ready(unsafe { &*self.awaitable }, value, exception);
    }
}

thread_local! {
    /// Awaitable -> invocation being evaluated, for retries.
    static PENDING: std::cell::RefCell<rustc_hash::FxHashMap<usize, usize>> =
        std::cell::RefCell::new(rustc_hash::FxHashMap::default());
}

/// Begin a memoized call, completing `awaitable` when the value is
/// ready.
pub fn memoize_call(awaitable: &Awaitable, invocation_iobj: IObj, txn: TxnId) {
    let awaitable_ptr = awaitable as *const Awaitable as *mut Awaitable;
    PENDING.with(|p| {
        p.borrow_mut()
            .insert(awaitable_ptr as usize, invocation_iobj.addr())
    });
    invocation::evaluate(
        invocation_iobj,
        Box::new(AwaitableCaller {
            query_txn: txn,
            awaitable: awaitable_ptr,
            value: None,
        }),
    );
}

/// Complete the current memoized computation with a value.
pub fn return_value(value: MemoValue) {
    let ctx = super::context::take_current_for_completion();
    ctx.evaluate_done(value);
}

/// Complete the current memoized computation with a thrown exception.
pub fn throw_value(exception: MemoValue) {
    debug_assert!(exception.is_exception() || exception.is_language_value());
    let ctx = super::context::take_current_for_completion();
    ctx.evaluate_done(exception);
}

// ---- boxing primitives ----

pub fn box_int64(n: i64) -> MemoValue {
    MemoValue::Int64(n)
}

pub fn box_double(d: f64) -> MemoValue {
    MemoValue::Double(d)
}

pub fn box_null() -> MemoValue {
    MemoValue::Null
}

/// Box a string value (short-string bits or an interned long string).
pub fn box_string(value: crate::string::StringValue) -> crate::error::Result<MemoValue> {
    crate::string::to_memo_value(value)
}

/// Box an interned object, taking one reference.
pub fn box_object(obj: IObj) -> MemoValue {
    obj.incref();
    MemoValue::Object(obj)
}
