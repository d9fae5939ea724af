//! Memoization graph - multi-version cached computation
//!
//! Every memoized call is an [`Invocation`] (the interned identity of
//! entrypoint + arguments) carrying an MVCC list of [`Revision`]s, each
//! asserting "the value equals V for every transaction in `[begin, end)`".
//! Revisions form a bidirectional dependency graph: a [`trace::Trace`] of
//! down-edges records the inputs one evaluation consumed, and each
//! input's [`subs::SubscriptionSet`] holds the inverse up-edges used to
//! push invalidations when the input changes.
//!
//! [`Transaction`]s batch cell writes and advance the global timeline;
//! [`cleanup::CleanupList`]s trim revisions no task can query anymore;
//! the LRU list bounds the cache. Refreshing (extending a revision's
//! lifespan by re-validating its inputs instead of re-running the body)
//! is the mechanism that makes incremental recomputation cheap.

pub mod awaitable;
pub mod caller;
pub mod cell;
pub mod cleanup;
pub mod context;
pub mod edge;
pub mod invocation;
pub mod lru;
pub mod refresher;
pub mod revision;
pub mod serde;
pub mod subs;
pub mod trace;
pub mod transaction;
pub mod value;
pub mod watcher;

pub use caller::Caller;
pub use cell::Cell;
pub use cleanup::{create_memo_task, create_memo_tasks, MemoTask};
pub use context::Context;
pub use invocation::Invocation;
pub use revision::Revision;
pub use transaction::Transaction;
pub use value::MemoValue;
pub use watcher::{watch_dependencies, InvalidationWatcher};

use std::sync::atomic::{AtomicU64, Ordering};

/// A 48-bit transaction ID.
pub type TxnId = u64;

/// Number of bytes a TxnId occupies when packed.
pub const TXN_ID_BYTES: usize = 6;

/// An "infinity" TxnId: the end of a lifespan that is, as far as we know
/// now, valid forever. If the matching `begin` is zero the guarantee is
/// permanent; otherwise a later commit may truncate it back to a finite
/// value.
pub const NEVER_TXN: TxnId = (1 << (TXN_ID_BYTES * 8)) - 1;

// The timeline starts at 2 so that 0 stays reserved for
// permanently-active values and 1 for the initial revision of cells.
static NEWEST_VISIBLE: AtomicU64 = AtomicU64::new(2);
static OLDEST_VISIBLE: AtomicU64 = AtomicU64::new(2);

/// The last committed transaction.
#[inline]
pub fn newest_visible_txn() -> TxnId {
    NEWEST_VISIBLE.load(Ordering::Relaxed)
}

/// The oldest transaction any task may still query.
#[inline]
pub fn oldest_visible_txn() -> TxnId {
    OLDEST_VISIBLE.load(Ordering::Relaxed)
}

pub(crate) fn publish_newest_visible(txn: TxnId) {
    debug_assert!(txn >= newest_visible_txn(), "timeline must be monotonic");
    NEWEST_VISIBLE.store(txn, Ordering::Release);
}

pub(crate) fn publish_oldest_visible(txn: TxnId) {
    OLDEST_VISIBLE.store(txn, Ordering::Release);
}

/// Evaluate `invocation` at `txn` (or the newest visible transaction),
/// blocking until the value is available.
///
/// This is the synchronous front door used by hosts and tests; compiled
/// code drives the same machinery through the awaitable ABI.
pub fn evaluate(
    invocation: crate::object::IObj,
    txn: Option<TxnId>,
) -> crate::error::Result<MemoValue> {
    invocation::evaluate_sync(invocation, txn)
}

/// Call a memoized invocation from inside a running memoized body,
/// recording the dependency in the current context. The call happens at
/// the calling computation's query transaction.
pub fn call_memoized(invocation: crate::object::IObj) -> crate::error::Result<MemoValue> {
    let txn = context::Context::current()
        .map(|ctx| ctx.query_txn())
        .unwrap_or_else(newest_visible_txn);
    loop {
        let cell = caller::SyncCell::new();
        invocation::evaluate(invocation, caller::SyncCaller::new(txn, cell.clone()));
        match cell.wait() {
            Err(()) => {
                return Err(crate::error::RuntimeError::Runtime(
                    "memoized dependency could not be computed".into(),
                ))
            }
            Ok(None) => continue,
            Ok(Some(value)) => return Ok(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_txn_is_48_bits() {
        assert_eq!(NEVER_TXN, 0xffff_ffff_ffff);
        assert!(NEVER_TXN > newest_visible_txn());
    }

    #[test]
    fn test_timeline_starts_past_reserved_values() {
        assert!(newest_visible_txn() >= 2);
        assert!(oldest_visible_txn() >= 2);
    }
}
