//! Cleanup lists - trimming revisions no task can query anymore
//!
//! Each `CleanupList` is keyed by a transaction and collects invocations
//! whose `cleanup()` should run once that transaction is no longer
//! queryable. A list also counts the memo tasks still reading at its
//! transaction; [`MemoTask`] is the RAII guard that pins one.
//!
//! `oldest_visible` is derived here: it advances to the oldest
//! transaction that still has a registered list, or to `newest_visible`
//! when none remain.

use super::invocation::{Invocation, OwningList};
use super::{newest_visible_txn, publish_oldest_visible, TxnId};
use crate::object::IObj;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Invocations to trim once a transaction stops being queryable.
pub struct CleanupList {
    txn: TxnId,

    /// Memo tasks still reading at this transaction.
    active_tasks: AtomicU32,

    /// Registered invocations (addresses of their interned objects). The
    /// list holds no references; a finalizing invocation removes itself.
    members: Mutex<Vec<usize>>,
}

impl CleanupList {
    pub fn txn(&self) -> TxnId {
        self.txn
    }
}

lazy_static::lazy_static! {
    static ref LISTS: Mutex<BTreeMap<TxnId, Arc<CleanupList>>> = Mutex::new(BTreeMap::new());
}

/// RAII guard keeping revisions for `query_txn` alive while a task reads
/// them.
pub struct MemoTask {
    query_txn: TxnId,
    list: Arc<CleanupList>,
}

impl MemoTask {
    pub fn query_txn(&self) -> TxnId {
        self.query_txn
    }
}

impl Drop for MemoTask {
    fn drop(&mut self) {
        if self.list.active_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Whether this list can run yet depends on older lists too;
            // let the scan figure it out.
            run_ready_cleanups();
        }
    }
}

/// Create one task pinned at the newest visible transaction.
pub fn create_memo_task() -> MemoTask {
    create_memo_tasks(1).pop().expect("one task requested")
}

/// Create `count` tasks, all pinned at the same newest visible
/// transaction. The registry lock is held across the whole batch so a
/// concurrent commit can neither advance the timeline between the tasks
/// nor retire the list before the pins land.
pub fn create_memo_tasks(count: usize) -> Vec<MemoTask> {
    let mut lists = LISTS.lock();
    let txn = newest_visible_txn();
    let list = list_at_locked(&mut lists, txn);
    let mut tasks = Vec::with_capacity(count);
    for _ in 0..count {
        list.active_tasks.fetch_add(1, Ordering::AcqRel);
        tasks.push(MemoTask {
            query_txn: txn,
            list: Arc::clone(&list),
        });
    }
    tasks
}

fn list_at_locked(
    lists: &mut BTreeMap<TxnId, Arc<CleanupList>>,
    txn: TxnId,
) -> Arc<CleanupList> {
    lists
        .entry(txn)
        .or_insert_with(|| {
            Arc::new(CleanupList {
                txn,
                active_tasks: AtomicU32::new(0),
                members: Mutex::new(Vec::new()),
            })
        })
        .clone()
}

/// Register `inv` for cleanup at `txn`. Caller holds the invocation's
/// lock; an invocation already sitting in a cleanup list stays where it
/// is (its cleanup will re-register at the right transaction).
pub fn register_cleanup_lck(inv: &Invocation, txn: TxnId) {
    match inv.owning_list() {
        OwningList::Cleanup => return,
        OwningList::Lru => super::lru::remove_lck(inv),
        OwningList::None => {}
    }
    let mut lists = LISTS.lock();
    let list = list_at_locked(&mut lists, txn);
    inv.set_owning_list(OwningList::Cleanup);
    list.members.lock().push(inv.as_iobj().addr());
}

/// Remove a finalizing invocation from whatever cleanup list holds it.
pub fn forget_invocation(inv_addr: usize) {
    let lists = LISTS.lock();
    for list in lists.values() {
        list.members.lock().retain(|&member| member != inv_addr);
    }
}

/// Run every front cleanup list whose tasks have all finished, and
/// advance `oldest_visible`. Called after commits and when memo tasks
/// drain.
///
/// Retirement is gated only on the task counter: a list keyed at the
/// current newest transaction still drains once its last task finishes,
/// whether or not any further commit ever happens. A later task pinned
/// at the same transaction simply re-creates the list.
pub fn run_ready_cleanups() {
    let mut ready = Vec::new();
    {
        let mut lists = LISTS.lock();
        let newest = newest_visible_txn();
        loop {
            let front = lists
                .iter()
                .next()
                .map(|(&txn, list)| (txn, list.active_tasks.load(Ordering::Acquire)));
            match front {
                Some((txn, 0)) => {
                    ready.push(lists.remove(&txn).expect("first key exists"));
                }
                _ => break,
            }
        }
        let oldest = lists.keys().next().copied().unwrap_or(newest);
        publish_oldest_visible(oldest);
    }

    for list in ready {
        let members = std::mem::take(&mut *list.members.lock());
        log::trace!(
            "cleanup: txn {} with {} invocations",
            list.txn,
            members.len()
        );
        for addr in members {
            let iobj = unsafe { IObj::from_addr(addr) };
            if !iobj.try_incref() {
                continue;
            }
            let inv = Invocation::from_iobj(iobj);
            {
                let guard = super::invocation::lock_invocation(inv);
                guard.invocation().set_owning_list(OwningList::None);
                guard.invocation().cleanup_lck();
            }
            crate::lock::safe_decref_iobj(iobj);
        }
    }
}

/// Are any cleanup lists still registered? (test support)
pub fn any_cleanups_pending() -> bool {
    !LISTS.lock().is_empty()
}

/// For tests: verify no cleanups remain once all tasks have drained.
pub fn assert_no_cleanups() {
    let lists = LISTS.lock();
    assert!(
        lists.values().all(|l| l.members.lock().is_empty()),
        "cleanup lists still hold invocations"
    );
}
