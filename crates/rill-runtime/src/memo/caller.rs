//! Callers - continuations for asyncEvaluate results
//!
//! A caller is the explicit continuation object handed to
//! `Invocation::evaluate`. There is no stack capture anywhere in the
//! runtime: suspension means registering a caller on the target's context
//! or refresher and returning to the task loop.
//!
//! Contract: `add_dependency` is invoked exactly once with the covering
//! revision locked (so implementations must stay simple and
//! non-reentrant), then `finish` with no locks held. `retry` replaces
//! `finish` when the placeholder's lifespan turned out not to contain the
//! caller's query transaction.

use super::revision::Revision;
use super::value::MemoValue;
use super::TxnId;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// The continuation interface. See module docs for the call protocol.
pub trait Caller: Send {
    /// The transaction this caller wants a value for.
    fn query_txn(&self) -> TxnId;

    /// Called once, with `input` locked, when the covering revision is
    /// known.
    fn add_dependency(&mut self, input: &Revision);

    /// Called if the result will not be delivered synchronously.
    fn prepare_for_deferred_result(&mut self) {}

    /// Called when a refresh on the caller's behalf failed (the caller
    /// may fall back to recomputing).
    fn refresh_failed(&mut self) {}

    /// The placeholder's lifespan did not contain `query_txn`; start
    /// over.
    fn retry(self: Box<Self>);

    /// The result is ready; no locks are held.
    fn finish(self: Box<Self>);
}

#[derive(Default)]
struct SyncState {
    value: Option<MemoValue>,
    retry: bool,
    failed: bool,
    done: bool,
}

/// Shared completion slot for [`SyncCaller`].
pub struct SyncCell {
    state: Mutex<SyncState>,
    ready: Condvar,
}

impl SyncCell {
    pub fn new() -> Arc<SyncCell> {
        Arc::new(SyncCell {
            state: Mutex::new(SyncState::default()),
            ready: Condvar::new(),
        })
    }

    /// Block until the computation completes; `Ok(None)` means retry.
    ///
    /// A delivered value wins over an earlier refresh failure: the
    /// failure only matters when nothing could be recomputed either.
    pub fn wait(&self) -> Result<Option<MemoValue>, ()> {
        let mut state = self.state.lock();
        while !state.done {
            self.ready.wait(&mut state);
        }
        if state.retry {
            state.done = false;
            state.retry = false;
            return Ok(None);
        }
        match state.value.take() {
            Some(value) => Ok(Some(value)),
            None => Err(()),
        }
    }
}

/// A caller that fulfills a synchronous wait. Used by the blocking
/// front door and by refresh fallbacks.
///
/// While a memoized body is running, its dependencies are recorded into
/// the current context here, at the moment the covering revision is
/// locked.
pub struct SyncCaller {
    query_txn: TxnId,
    cell: Arc<SyncCell>,
    /// Record dependencies into the current context (true for calls made
    /// from inside a memoized body; false for refresh probes).
    record_dependency: bool,
}

impl SyncCaller {
    pub fn new(query_txn: TxnId, cell: Arc<SyncCell>) -> Box<SyncCaller> {
        Box::new(SyncCaller {
            query_txn,
            cell,
            record_dependency: true,
        })
    }

    /// A caller that observes without recording a dependency (refresh
    /// probes re-validating inputs).
    pub fn probe(query_txn: TxnId, cell: Arc<SyncCell>) -> Box<SyncCaller> {
        Box::new(SyncCaller {
            query_txn,
            cell,
            record_dependency: false,
        })
    }
}

impl Caller for SyncCaller {
    fn query_txn(&self) -> TxnId {
        self.query_txn
    }

    fn add_dependency(&mut self, input: &Revision) {
        if self.record_dependency {
            if let Some(ctx) = super::context::Context::current() {
                ctx.add_dependency(input);
            }
        }
        self.cell.state.lock().value = Some(input.value_clone_lck());
    }

    fn refresh_failed(&mut self) {
        self.cell.state.lock().failed = true;
    }

    fn retry(self: Box<Self>) {
        let mut state = self.cell.state.lock();
        state.retry = true;
        state.done = true;
        self.cell.ready.notify_all();
    }

    fn finish(self: Box<Self>) {
        let mut state = self.cell.state.lock();
        state.done = true;
        self.cell.ready.notify_all();
    }
}

/// A caller used while installing deserialized memo-cache entries: it
/// asserts the machinery never suspends or retries on that path.
pub struct FakeCaller {
    query_txn: TxnId,
}

impl FakeCaller {
    pub fn new(query_txn: TxnId) -> Box<FakeCaller> {
        Box::new(FakeCaller { query_txn })
    }
}

impl Caller for FakeCaller {
    fn query_txn(&self) -> TxnId {
        self.query_txn
    }

    fn add_dependency(&mut self, _input: &Revision) {}

    fn prepare_for_deferred_result(&mut self) {
        crate::fatal!("deserialization must not suspend");
    }

    fn retry(self: Box<Self>) {
        crate::fatal!("deserialization must not retry");
    }

    fn finish(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memo::NEVER_TXN;

    #[test]
    fn test_sync_caller_delivers_value() {
        let cell = SyncCell::new();
        let mut caller: Box<dyn Caller> = SyncCaller::new(4, cell.clone());
        let rev = Revision::new(1, NEVER_TXN, MemoValue::Int64(9), None);
        {
            let guard = super::super::revision::lock_revision(rev.as_ptr());
            caller.add_dependency(guard.revision());
        }
        caller.finish();
        assert_eq!(cell.wait().unwrap().unwrap(), MemoValue::Int64(9));
    }

    #[test]
    fn test_sync_caller_retry_resets() {
        let cell = SyncCell::new();
        let caller: Box<dyn Caller> = SyncCaller::new(4, cell.clone());
        caller.retry();
        assert!(cell.wait().unwrap().is_none());
    }

    #[test]
    fn test_refresh_failure_without_value_reports_error() {
        let cell = SyncCell::new();
        let mut caller: Box<dyn Caller> = SyncCaller::new(4, cell.clone());
        caller.refresh_failed();
        caller.finish();
        assert!(cell.wait().is_err());
    }
}
