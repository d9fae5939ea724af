//! Invalidation watchers - one-shot "your value changed" notifications
//!
//! A watcher owns a phony revision that exists only as a graph node: it
//! subscribes to a set of dependencies and, when any of them is truncated
//! by a commit, the watcher is notified after that commit fully unlocks
//! (the deferred-work guarantee: no user callback ever runs under a
//! runtime lock).

use super::context::{Context, Guard};
use super::revision::{lock_revision, Revision, RevisionRef};
use super::value::MemoValue;
use super::{newest_visible_txn, NEVER_TXN};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Shared handle to a watcher.
pub type WatcherRef = Arc<InvalidationWatcher>;

struct WatcherState {
    /// The phony graph node, while still subscribed.
    revision: Option<RevisionRef>,
    invalidated: bool,
}

/// A one-shot invalidation notification.
pub struct InvalidationWatcher {
    state: Mutex<WatcherState>,
    fired: Condvar,
}

impl std::fmt::Debug for InvalidationWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationWatcher").finish_non_exhaustive()
    }
}

impl InvalidationWatcher {
    /// Build a watcher subscribed to `trace`. Returns None when the
    /// dependency set is empty (a pure computation can never be
    /// invalidated).
    pub fn make(trace: Vec<RevisionRef>) -> Option<WatcherRef> {
        if trace.is_empty() {
            return None;
        }
        let watcher = Arc::new(InvalidationWatcher {
            state: Mutex::new(WatcherState {
                revision: None,
                invalidated: false,
            }),
            fired: Condvar::new(),
        });

        let phony = Revision::new(1, NEVER_TXN, MemoValue::Watcher(watcher.clone()), None);
        {
            let guard = lock_revision(phony.as_ptr());
            guard.revision().create_trace_lck(trace);
        }

        // A dependency may already have been truncated by the time we
        // subscribed; deliver immediately instead of waiting for a commit
        // that already happened.
        let already_invalid = {
            let guard = lock_revision(phony.as_ptr());
            guard.revision().end_lck() != NEVER_TXN
        };
        watcher.state.lock().revision = Some(phony);
        if already_invalid {
            watcher.invalidate();
        }
        Some(watcher)
    }

    /// Is this still subscribed to invalidation notifications?
    pub fn is_subscribed(&self) -> bool {
        let state = self.state.lock();
        state.revision.is_some() && !state.invalidated
    }

    pub fn is_invalidated(&self) -> bool {
        self.state.lock().invalidated
    }

    /// Stop watching. Returns false if already unsubscribed or already
    /// (being) notified.
    pub fn unsubscribe(&self) -> bool {
        let revision = {
            let mut state = self.state.lock();
            if state.invalidated {
                return false;
            }
            match state.revision.take() {
                Some(revision) => revision,
                None => return false,
            }
        };
        detach_phony(&revision);
        true
    }

    /// Deliver the notification. Called with no runtime locks held,
    /// after the invalidating commit released everything.
    pub fn invalidate(&self) {
        let revision = {
            let mut state = self.state.lock();
            if state.invalidated {
                return;
            }
            state.invalidated = true;
            state.revision.take()
        };
        if let Some(revision) = revision {
            detach_phony(&revision);
        }
        self.fired.notify_all();
    }

    /// Block until the notification fires.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while !state.invalidated {
            self.fired.wait(&mut state);
        }
    }
}

/// Tear the phony revision out of the graph: drop its trace edges and
/// the value's back-reference to the watcher.
fn detach_phony(revision: &RevisionRef) {
    let guard = lock_revision(revision.as_ptr());
    guard.revision().prevent_refresh_lck();
    guard.revision().set_value_lck(MemoValue::Undef);
}

/// Run `func` recording every memoized dependency it touches; if any
/// were observed, return a watcher subscribed to them all.
pub fn watch_dependencies(func: impl FnOnce()) -> Option<WatcherRef> {
    let ctx = Box::into_raw(Context::new(None, newest_visible_txn()));
    {
        let _guard = Guard::new(ctx);
        func();
    }
    let ctx = unsafe { Box::from_raw(ctx) };
    let deps = ctx.linearize_trace();
    InvalidationWatcher::make(deps)
}
