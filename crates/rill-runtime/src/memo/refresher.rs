//! Refresher - extending a revision's lifespan without recomputing
//!
//! A revision whose `end` was truncated may still hold the right value:
//! if every inactive input can itself be shown valid past the query
//! transaction, the revision's lifespan extends to the minimum of its
//! inputs' new ends and the cached value is served without re-running the
//! body. An input qualifies only if *the same input revision* extends
//! (an equal-valued recompute merges into it); a changed input means the
//! trace is stale, the trace is discarded, and the body re-runs.

use super::caller::{Caller, SyncCaller, SyncCell};
use super::revision::{lock_revision, Revision, RevisionRef};
use super::{newest_visible_txn, TxnId, NEVER_TXN};
use crate::object::IObj;

/// State for one in-flight lifespan extension.
pub struct Refresher {
    refreshee: RevisionRef,
    query_txn: TxnId,
    newest_visible_when_started: TxnId,
}

impl Refresher {
    fn new(refreshee: RevisionRef, query_txn: TxnId) -> Refresher {
        Refresher {
            refreshee,
            query_txn,
            newest_visible_when_started: newest_visible_txn(),
        }
    }

    /// Attempt the extension. Returns true if the refreshee now covers
    /// the query transaction.
    fn run(&self) -> bool {
        self.refreshee
            .refresher
            .set(self as *const Refresher as *mut Refresher);
        // Snapshot the inactive inputs under the lock, then work on them
        // with no locks held.
        let stale: Vec<*mut Revision> = {
            let guard = lock_revision(self.refreshee.as_ptr());
            let rev = guard.revision();
            if !rev.can_refresh() || !rev.has_trace_lck() {
                return false;
            }
            let trace = rev.trace_lck();
            let mut stale = Vec::new();
            trace.for_each(|slot, edge| {
                if trace.is_inactive(slot) && !edge.is_null() {
                    stale.push(edge.target());
                }
            });
            stale
        };

        for input in stale {
            if !extend_input(input, self.query_txn) {
                log::trace!(
                    "refresh: input {:p} would not extend past txn {}",
                    input,
                    self.query_txn
                );
                return false;
            }
        }

        // Every stale input re-validated; pull the lifespan forward to
        // the intersection of the inputs' current ends. Inputs that were
        // truncated while we worked keep the extension honest: the
        // minimum is taken over what the edges say right now.
        let guard = lock_revision(self.refreshee.as_ptr());
        let rev = guard.revision();
        if !rev.can_refresh() || !rev.has_trace_lck() {
            return false;
        }
        let trace = rev.trace_lck();
        let mut min_end = NEVER_TXN;
        trace.for_each(|slot, edge| {
            if edge.is_null() {
                return;
            }
            let input_end = unsafe { &*edge.target() }.end_relaxed();
            min_end = min_end.min(input_end);
            if input_end == NEVER_TXN {
                trace.set_active(slot);
            } else {
                trace.set_inactive(slot);
            }
        });
        if min_end > rev.end_lck() {
            log::trace!(
                "refresh: revision {:p} end {} -> {} (started at txn {})",
                self.refreshee.as_ptr(),
                rev.end_lck(),
                min_end,
                self.newest_visible_when_started
            );
            rev.set_end_lck(min_end);
        }
        rev.end_lck() > self.query_txn
    }
}

impl Drop for Refresher {
    fn drop(&mut self) {
        self.refreshee.refresher.set(std::ptr::null_mut());
    }
}

/// Re-validate one input revision past `query`: extend it in place, or
/// re-run its body hoping the recompute merges into it (equal value).
fn extend_input(input: *mut Revision, query: TxnId) -> bool {
    let input_ref = RevisionRef::acquire(input);
    let (can_extend, owner) = {
        let guard = lock_revision(input);
        let rev = guard.revision();
        if rev.end_lck() > query {
            return true;
        }
        let owner = rev.owner_lck().map(|inv| {
            let iobj = inv.as_iobj();
            iobj.incref();
            iobj
        });
        (rev.can_refresh() && rev.has_trace_lck(), owner)
    };

    if can_extend {
        let refresher = Refresher::new(input_ref.clone(), query);
        if refresher.run() {
            release_owner(owner);
            return true;
        }
    }

    // Fall back: re-run the input's body and check whether the recompute
    // merged into (and thereby extended) this same revision.
    let extended = match owner {
        Some(owner_iobj) => {
            let cell = SyncCell::new();
            super::invocation::evaluate(owner_iobj, SyncCaller::probe(query, cell.clone()));
            let completed = cell.wait();
            crate::lock::safe_decref_iobj(owner_iobj);
            if completed.is_err() {
                return false;
            }
            let guard = lock_revision(input);
            guard.revision().end_lck() > query
        }
        None => false,
    };
    extended
}

fn release_owner(owner: Option<IObj>) {
    if let Some(iobj) = owner {
        crate::lock::safe_decref_iobj(iobj);
    }
}

/// Entry point from evaluation: try to serve `caller` by extending
/// `rev`; fall back to re-running the owning invocation's body.
pub fn async_refresh(rev: RevisionRef, mut caller: Box<dyn Caller>) {
    let query = caller.query_txn();

    {
        let guard = lock_revision(rev.as_ptr());
        let revision = guard.revision();
        if query < revision.end_lck() {
            caller.add_dependency(revision);
            drop(guard);
            caller.finish();
            return;
        }
        if !revision.can_refresh() || !revision.has_trace_lck() {
            drop(guard);
            rerun_or_fail(rev, caller);
            return;
        }
    }

    let refreshed = Refresher::new(rev.clone(), query).run();
    if refreshed {
        let guard = lock_revision(rev.as_ptr());
        let revision = guard.revision();
        if query < revision.end_lck() {
            caller.add_dependency(revision);
            drop(guard);
            caller.finish();
            return;
        }
    }

    // The trace could not be revalidated; it is now worthless.
    {
        let guard = lock_revision(rev.as_ptr());
        guard.revision().prevent_refresh_lck();
    }
    caller.refresh_failed();
    rerun_or_fail(rev, caller);
}

/// Re-run the owning invocation's body for `caller`, or report failure if
/// the revision is detached and has no way back to a body.
fn rerun_or_fail(rev: RevisionRef, mut caller: Box<dyn Caller>) {
    let owner = {
        let guard = lock_revision(rev.as_ptr());
        guard.revision().owner_lck().map(|inv| {
            let iobj = inv.as_iobj();
            iobj.incref();
            iobj
        })
    };
    match owner {
        Some(owner_iobj) => {
            super::invocation::evaluate(owner_iobj, caller);
            crate::lock::safe_decref_iobj(owner_iobj);
        }
        None => {
            caller.refresh_failed();
            caller.finish();
        }
    }
}
