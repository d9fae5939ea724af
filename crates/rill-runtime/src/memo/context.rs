//! Context - per-in-flight-computation state
//!
//! While a memoized body runs, its context records every dependency it
//! touches (in first-seen order) and collects the callers suspended on
//! the result. The context owns the placeholder revision that marks the
//! computation in the invocation's list; completing the computation
//! trades the placeholder for a real revision whose trace is the
//! linearized dependency set.
//!
//! The current context lives in a thread-local; `Guard` scopes it.

use super::caller::Caller;
use super::revision::{Revision, RevisionRef};
use super::TxnId;
use crate::object::IObj;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::cell::Cell;

/// State of one in-flight memoized computation.
pub struct Context {
    /// The transaction the computation is being evaluated at; also the
    /// original `begin` of the placeholder.
    query_txn: TxnId,

    /// The invocation being computed, if any (one reference held).
    /// Dependency-watching contexts have no owner.
    owner: Option<IObj>,

    /// The placeholder revision in the owner's list (one reference held).
    placeholder: Mutex<Option<RevisionRef>>,

    /// Dependencies in first-seen order; each holds one reference.
    calls: Mutex<IndexMap<usize, RevisionRef>>,

    /// Callers suspended on this computation.
    callers: Mutex<Vec<Box<dyn Caller>>>,
}

thread_local! {
    static CURRENT: Cell<*mut Context> = const { Cell::new(std::ptr::null_mut()) };
}

impl Context {
    /// Create the context for evaluating `owner` at `query_txn`. The
    /// caller transfers one reference on `owner`.
    pub fn new(owner: Option<IObj>, query_txn: TxnId) -> Box<Context> {
        Box::new(Context {
            query_txn,
            owner,
            placeholder: Mutex::new(None),
            calls: Mutex::new(IndexMap::new()),
            callers: Mutex::new(Vec::new()),
        })
    }

    /// The context the current thread is computing under, if any.
    pub fn current() -> Option<&'static Context> {
        let ptr = CURRENT.with(|current| current.get());
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }

    #[inline]
    pub fn query_txn(&self) -> TxnId {
        self.query_txn
    }

    pub fn owner(&self) -> Option<IObj> {
        self.owner
    }

    pub fn set_placeholder(&self, placeholder: RevisionRef) {
        *self.placeholder.lock() = Some(placeholder);
    }

    pub fn take_placeholder(&self) -> Option<RevisionRef> {
        self.placeholder.lock().take()
    }

    /// Record a dependency (at most once). The input is locked by the
    /// caller of this method.
    pub fn add_dependency(&self, input: &Revision) {
        let mut calls = self.calls.lock();
        let key = input.as_mut_ptr() as usize;
        if !calls.contains_key(&key) {
            calls.insert(key, RevisionRef::acquire(input.as_mut_ptr()));
        }
    }

    /// Number of recorded dependencies.
    pub fn dependency_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Hand over the dependencies in first-seen order.
    pub fn linearize_trace(&self) -> Vec<RevisionRef> {
        let mut calls = self.calls.lock();
        let drained: Vec<RevisionRef> = calls.drain(..).map(|(_, rev)| rev).collect();
        drained
    }

    /// Drop the recorded dependencies without building a trace.
    pub fn discard_calls(&self) {
        self.calls.lock().clear();
    }

    /// Suspend `caller` until this computation completes.
    pub fn add_caller(&self, mut caller: Box<dyn Caller>) {
        caller.prepare_for_deferred_result();
        self.callers.lock().push(caller);
    }

    pub fn take_callers(&self) -> Vec<Box<dyn Caller>> {
        std::mem::take(&mut self.callers.lock())
    }

    /// Deliver the computed value: replace the placeholder with a real
    /// revision and notify everyone waiting.
    pub fn evaluate_done(self: Box<Context>, value: super::MemoValue) {
        super::invocation::replace_placeholder(self, value);
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Release the reference held on the owning invocation; the
        // dependency and placeholder references drop with their fields.
        if let Some(owner) = self.owner {
            crate::lock::safe_decref_iobj(owner);
        }
    }
}

/// Take ownership of the thread's current context to complete it.
///
/// # Panics
///
/// Panics if no memoized computation is in flight on this thread.
pub fn take_current_for_completion() -> Box<Context> {
    let ptr = CURRENT.with(|current| current.replace(std::ptr::null_mut()));
    assert!(!ptr.is_null(), "no memoized computation in flight");
    unsafe { Box::from_raw(ptr) }
}

/// RAII guard installing a context as the thread's current one.
pub struct Guard {
    previous: *mut Context,
}

impl Guard {
    pub fn new(ctx: *mut Context) -> Guard {
        let previous = CURRENT.with(|current| current.replace(ctx));
        Guard { previous }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        CURRENT.with(|current| current.set(self.previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memo::{MemoValue, NEVER_TXN};

    #[test]
    fn test_current_context_scoping() {
        assert!(Context::current().is_none());
        let mut ctx = Context::new(None, 5);
        {
            let _guard = Guard::new(&mut *ctx);
            assert_eq!(Context::current().unwrap().query_txn(), 5);
        }
        assert!(Context::current().is_none());
    }

    #[test]
    fn test_dependencies_deduplicate_and_keep_order() {
        let ctx = Context::new(None, 3);
        let a = Revision::new(1, NEVER_TXN, MemoValue::Int64(1), None);
        let b = Revision::new(1, NEVER_TXN, MemoValue::Int64(2), None);

        ctx.add_dependency(&a);
        ctx.add_dependency(&b);
        ctx.add_dependency(&a);
        assert_eq!(ctx.dependency_count(), 2);

        let trace = ctx.linearize_trace();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].as_ptr(), a.as_ptr());
        assert_eq!(trace[1].as_ptr(), b.as_ptr());
    }
}
