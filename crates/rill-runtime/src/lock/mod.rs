//! Lock manager - per-thread lock bookkeeping and deferred work
//!
//! Tracks how many runtime locks the current thread holds and queues two
//! classes of deferred work: decrefs (on interned objects and revisions)
//! and invalidations (up-edges whose target must be invalidated). The
//! queues drain only when the held-lock count transitions to zero.
//!
//! Two rules make this necessary:
//! - a decref may cascade into finalizers that take arbitrary locks,
//!   which is forbidden while any lock is held;
//! - an invalidation walk reaches into arbitrary subscribers and would
//!   otherwise violate the lock order.
//!
//! The drain treats itself as one pseudo-lock: work enqueued by work
//! being drained joins the same flat loop instead of growing the stack.
//!
//! Held lock keys are tracked so lock delegation can detect re-entry;
//! the self-deadlock assertion on re-entrant locking is debug-only.

use crate::memo::edge::UpEdge;
use crate::memo::revision::Revision;
use crate::memo::watcher::WatcherRef;
use crate::object::IObj;
use std::cell::RefCell;

/// Hook invoked at every transition to zero locks held (test support).
pub type UnlockHook = Box<dyn Fn()>;

#[derive(Default)]
struct LockState {
    locks_held: u32,
    draining: bool,

    iobj_decrefs: Vec<IObj>,
    revision_decrefs: Vec<*mut Revision>,
    invalidations: Vec<UpEdge>,
    watchers_to_notify: Vec<WatcherRef>,

    hook_armed: bool,
    unlock_hook: Option<UnlockHook>,

    /// Keys of held locks. Kept in all builds so lock delegation can
    /// detect re-entry; the self-deadlock assertion is debug-only.
    held_keys: Vec<usize>,
}

thread_local! {
    static STATE: RefCell<LockState> = RefCell::new(LockState::default());
}

/// Remember that the lock identified by `key` was acquired.
pub fn note_locked(key: usize) {
    STATE.with(|state| {
        let mut state = state.borrow_mut();
        #[cfg(debug_assertions)]
        assert!(
            !state.held_keys.contains(&key),
            "lock {:#x} re-entered on the same thread",
            key
        );
        state.held_keys.push(key);
        state.locks_held += 1;
    });
}

/// Forget a held lock; drains deferred work on the last unlock.
pub fn note_unlocked(key: usize) {
    let at_zero = STATE.with(|state| {
        let mut state = state.borrow_mut();
        let index = state
            .held_keys
            .iter()
            .rposition(|&held| held == key)
            .unwrap_or_else(|| panic!("unlock of lock {:#x} that is not held", key));
        state.held_keys.swap_remove(index);
        assert!(state.locks_held > 0, "unlock with no locks held");
        state.locks_held -= 1;
        state.locks_held == 0
    });
    if at_zero {
        run_unlock_hook();
        drain_if_safe();
    }
}

/// Number of locks the current thread holds.
pub fn locks_held() -> u32 {
    STATE.with(|state| state.borrow().locks_held)
}

/// Will work enqueued now be deferred (because locks are held or a drain
/// is already running)?
pub fn defer_work() -> bool {
    STATE.with(|state| {
        let state = state.borrow();
        state.locks_held > 0 || state.draining
    })
}

/// Is the lock identified by `key` held by this thread?
pub fn is_held(key: usize) -> bool {
    STATE.with(|state| state.borrow().held_keys.contains(&key))
}

/// Debug-assert that `key` is held by this thread.
pub fn assert_locked(key: usize) {
    #[cfg(debug_assertions)]
    STATE.with(|state| {
        assert!(
            state.borrow().held_keys.contains(&key),
            "expected lock {:#x} to be held",
            key
        );
    });
    #[cfg(not(debug_assertions))]
    let _ = key;
}

/// Decref an interned object once it is safe to do so.
pub fn safe_decref_iobj(obj: IObj) {
    STATE.with(|state| state.borrow_mut().iobj_decrefs.push(obj));
    drain_if_safe();
}

/// Decref a revision once it is safe to do so.
pub fn safe_decref_revision(rev: *mut Revision) {
    STATE.with(|state| state.borrow_mut().revision_decrefs.push(rev));
    drain_if_safe();
}

/// Queue an invalidation to deliver at the next zero-locks transition.
pub fn push_invalidation(edge: UpEdge) {
    STATE.with(|state| state.borrow_mut().invalidations.push(edge));
    drain_if_safe();
}

/// Queue an invalidation watcher for post-commit notification. Watchers
/// are never drained here; the committing transaction steals the list
/// and notifies after releasing its locks.
pub fn queue_watcher_notification(watcher: WatcherRef) {
    STATE.with(|state| state.borrow_mut().watchers_to_notify.push(watcher));
}

/// Steal the queued watcher notifications (transaction commit).
pub fn take_watcher_notifications() -> Vec<WatcherRef> {
    STATE.with(|state| std::mem::take(&mut state.borrow_mut().watchers_to_notify))
}

/// Install a hook called at every zero-locks transition; returns the
/// previous hook. Used by tests to inject deterministic interleavings.
pub fn set_test_unlock_hook(hook: Option<UnlockHook>) -> Option<UnlockHook> {
    STATE.with(|state| {
        let mut state = state.borrow_mut();
        state.hook_armed = hook.is_some();
        std::mem::replace(&mut state.unlock_hook, hook)
    })
}

fn run_unlock_hook() {
    // Disarm while running so the hook cannot re-enter itself.
    let hook = STATE.with(|state| {
        let mut state = state.borrow_mut();
        if state.hook_armed {
            state.hook_armed = false;
            state.unlock_hook.take()
        } else {
            None
        }
    });
    if let Some(hook) = hook {
        hook();
        STATE.with(|state| {
            let mut state = state.borrow_mut();
            if state.unlock_hook.is_none() {
                state.unlock_hook = Some(hook);
                state.hook_armed = true;
            }
        });
    }
}

enum Work {
    Invalidate(UpEdge),
    DecrefRevision(*mut Revision),
    DecrefIObj(IObj),
}

/// Drain deferred work if no locks are held. Reentrant enqueues made by
/// the drained work are processed by the same loop.
pub fn drain_if_safe() {
    let can_drain = STATE.with(|state| {
        let mut state = state.borrow_mut();
        if state.locks_held > 0 || state.draining {
            return false;
        }
        state.draining = true;
        true
    });
    if !can_drain {
        return;
    }

    loop {
        let work = STATE.with(|state| {
            let mut state = state.borrow_mut();
            if let Some(edge) = state.invalidations.pop() {
                Some(Work::Invalidate(edge))
            } else if let Some(rev) = state.revision_decrefs.pop() {
                Some(Work::DecrefRevision(rev))
            } else if let Some(obj) = state.iobj_decrefs.pop() {
                Some(Work::DecrefIObj(obj))
            } else {
                None
            }
        });

        match work {
            Some(Work::Invalidate(edge)) => crate::memo::revision::apply_invalidation(edge),
            Some(Work::DecrefRevision(rev)) => {
                crate::memo::revision::decref_assuming_no_locks(rev)
            }
            Some(Work::DecrefIObj(obj)) => {
                let delegate = obj.delegate();
                if obj.decref_raw() {
                    crate::intern::finalize(delegate);
                }
            }
            None => break,
        }
    }

    STATE.with(|state| state.borrow_mut().draining = false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_lock_counting() {
        assert_eq!(locks_held(), 0);
        note_locked(0x100);
        note_locked(0x200);
        assert_eq!(locks_held(), 2);
        assert!(defer_work());
        note_unlocked(0x200);
        note_unlocked(0x100);
        assert_eq!(locks_held(), 0);
        assert!(!defer_work());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "re-entered")]
    fn test_reentry_panics() {
        // Each test runs on its own thread, so the state this leaves
        // behind dies with it.
        note_locked(0x300);
        note_locked(0x300);
    }

    #[test]
    fn test_unlock_hook_fires_at_zero() {
        let count = Rc::new(Cell::new(0));
        let count_in_hook = Rc::clone(&count);
        let old = set_test_unlock_hook(Some(Box::new(move || {
            count_in_hook.set(count_in_hook.get() + 1);
        })));
        assert!(old.is_none());

        note_locked(0x400);
        note_locked(0x500);
        note_unlocked(0x500);
        assert_eq!(count.get(), 0, "hook must not fire while locks remain");
        note_unlocked(0x400);
        assert_eq!(count.get(), 1);

        set_test_unlock_hook(None);
    }
}
