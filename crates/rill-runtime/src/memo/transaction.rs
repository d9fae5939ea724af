//! Transactions - batched cell mutation and timeline advance
//!
//! A transaction collects cell assignments and commits them atomically
//! under the global commit mutex: the new transaction id is
//! `newest_visible + 1`, each written cell's head revision is truncated
//! (unless the value is unchanged, which elides the write), subscribers
//! are invalidated, and only then is the new id published. Invalidation
//! propagation completes before the commit lock is released, so any
//! reader observing the new id observes the truncations too. Watcher
//! callbacks run strictly after everything is unlocked.

use super::cell::Cell;
use super::cleanup;
use super::invocation::{link_revision_for_commit, lock_invocation, Invocation};
use super::revision::Revision;
use super::value::MemoValue;
use super::{newest_visible_txn, publish_newest_visible, NEVER_TXN};
use crate::object::IObj;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

lazy_static::lazy_static! {
    static ref TXN_MUTEX: Mutex<()> = Mutex::new(());
}

/// A batch of pending cell assignments. Commits on drop; `abort`
/// discards.
#[derive(Default)]
pub struct Transaction {
    /// (invocation, value) pairs in assignment order; the last write to
    /// a cell wins.
    commits: Vec<(IObj, MemoValue)>,
    aborted: bool,
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction::default()
    }

    /// Enqueue an assignment, replacing any earlier one to the same cell
    /// at commit time.
    pub fn assign(&mut self, cell: &Cell, value: MemoValue) {
        let inv = cell.invocation();
        inv.incref();
        self.commits.push((inv, value));
    }

    /// Abandon all proposed changes with no side effects.
    pub fn abort(mut self) {
        self.aborted = true;
        self.release_pending();
    }

    /// Commit now instead of at drop.
    pub fn commit(mut self) {
        self.do_commit();
    }

    fn release_pending(&mut self) {
        for (inv, _value) in self.commits.drain(..) {
            crate::lock::safe_decref_iobj(inv);
        }
    }

    fn do_commit(&mut self) {
        if self.commits.is_empty() {
            return;
        }

        let commit_guard = TXN_MUTEX.lock();
        let begin = newest_visible_txn() + 1;
        let mut changed = false;
        let mut elided: FxHashSet<usize> = FxHashSet::default();

        // Walk backward so the last assignment to a cell wins, including
        // a last assignment that turned out to be a no-op.
        let commits = std::mem::take(&mut self.commits);
        for (inv_iobj, value) in commits.iter().rev() {
            let inv = Invocation::from_iobj(*inv_iobj);
            if elided.contains(&inv.addr()) {
                continue;
            }
            elided.insert(inv.addr());

            let guard = lock_invocation(inv);
            let head_ptr = guard.invocation().head_lck();

            if !head_ptr.is_null() {
                let head = unsafe { &*head_ptr };
                // Only a still-open head can change; a closed one was
                // already truncated by an earlier commit.
                if head.end_lck() == NEVER_TXN {
                    if head.value_lck() == value {
                        // Unchanged value: elide the write entirely.
                        continue;
                    }
                    head.set_end_lck(begin);
                    head.prevent_refresh_lck();
                    head.invalidate_subscribers_lck();
                    changed = true;
                    log::trace!(
                        "commit: cell {:#x} truncated at txn {}",
                        inv_iobj.addr(),
                        begin
                    );
                }
            }

            if value.is_language_value() {
                let rev = Revision::new(begin, NEVER_TXN, value.clone(), Some(inv));
                link_revision_for_commit(guard.invocation(), rev);
                changed = true;
            }

            cleanup::register_cleanup_lck(guard.invocation(), begin);
            // Dropping the guard reaches zero locks, so the queued
            // subscriber invalidations for this cell drain here, before
            // the commit lock is released.
        }

        if changed {
            publish_newest_visible(begin);
        }
        drop(commit_guard);

        // User-visible notification strictly after everything unlocked.
        for watcher in crate::lock::take_watcher_notifications() {
            watcher.invalidate();
        }
        cleanup::run_ready_cleanups();

        for (inv, _value) in commits {
            crate::lock::safe_decref_iobj(inv);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.aborted {
            self.do_commit();
        }
        self.release_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memo::oldest_visible_txn;

    #[test]
    fn test_commit_advances_timeline() {
        let cell = Cell::new(MemoValue::Int64(1)).unwrap();
        let before = newest_visible_txn();

        let mut txn = Transaction::new();
        txn.assign(&cell, MemoValue::Int64(2));
        txn.commit();

        assert!(newest_visible_txn() > before);
        assert_eq!(cell.read(None).unwrap(), MemoValue::Int64(2));
    }

    #[test]
    fn test_unchanged_value_elides() {
        let cell = Cell::new(MemoValue::Int64(7)).unwrap();
        let before = newest_visible_txn();

        let mut txn = Transaction::new();
        txn.assign(&cell, MemoValue::Int64(7));
        txn.commit();

        assert_eq!(newest_visible_txn(), before, "no-op commit must not advance");
    }

    #[test]
    fn test_last_write_wins() {
        let cell = Cell::new(MemoValue::Int64(0)).unwrap();
        let mut txn = Transaction::new();
        txn.assign(&cell, MemoValue::Int64(1));
        txn.assign(&cell, MemoValue::Int64(2));
        txn.commit();
        assert_eq!(cell.read(None).unwrap(), MemoValue::Int64(2));
    }

    #[test]
    fn test_abort_changes_nothing() {
        let cell = Cell::new(MemoValue::Int64(3)).unwrap();
        let before = newest_visible_txn();
        let mut txn = Transaction::new();
        txn.assign(&cell, MemoValue::Int64(4));
        txn.abort();
        assert_eq!(newest_visible_txn(), before);
        assert_eq!(cell.read(None).unwrap(), MemoValue::Int64(3));
    }

    #[test]
    fn test_mvcc_reads_old_and_new() {
        let cell = Cell::new(MemoValue::Int64(10)).unwrap();
        let old_txn = newest_visible_txn();
        // Pin the old transaction so cleanup cannot trim it while we
        // read below.
        let _task = cleanup::create_memo_task();

        let mut txn = Transaction::new();
        txn.assign(&cell, MemoValue::Int64(20));
        txn.commit();
        let new_txn = newest_visible_txn();

        assert_eq!(cell.read(Some(old_txn)).unwrap(), MemoValue::Int64(10));
        assert_eq!(cell.read(Some(new_txn)).unwrap(), MemoValue::Int64(20));
        assert!(oldest_visible_txn() <= old_txn);
    }
}
