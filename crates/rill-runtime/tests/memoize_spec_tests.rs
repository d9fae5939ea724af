//! Specification-Based Memoization Tests
//!
//! End-to-end scenarios over the public memoization surface: caching,
//! invalidation, refresh without recompute, MVCC reads, cyclic intern
//! collapse, invalidation watchers, LRU discard and cache persistence.

use rill_runtime::memo::awaitable;
use rill_runtime::memo::invocation::{invocation_extra_bytes, Invocation};
use rill_runtime::memo::{self, Cell, MemoValue, Transaction};
use rill_runtime::object::{IObj, RObj, Type, TypeHints};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

/// Every test here shares the global timeline, cleanup registry and LRU
/// list; serialize them so pinned tasks and evictions from one test
/// cannot stall another's assertions.
fn exclusive() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------
// Test function plumbing

/// Build and intern an argument tuple `[dependency, x]` for an
/// invocation type whose slot 0 is a reference.
fn make_invocation(type_: &'static Type, dependency: IObj, x: i64) -> IObj {
    let mut buffer = [0usize; 3];
    let payload = unsafe { buffer.as_mut_ptr().add(1) };
    let robj = unsafe { RObj::from_addr(payload as usize) };
    robj.set_vtable(type_.vtable());
    unsafe {
        *payload = dependency.addr();
        *(payload.add(1) as *mut i64) = x;
    }
    rill_runtime::intern::intern(robj).unwrap()
}

fn arg_dependency(args: IObj) -> IObj {
    unsafe { IObj::from_addr(*(args.addr() as *const usize)) }
}

fn arg_x(args: IObj) -> i64 {
    unsafe { *((args.addr() + 8) as *const i64) }
}

static ADD_RUNS: AtomicU64 = AtomicU64::new(0);

/// f(x) = dependency + x
fn add_entry(args: IObj) {
    let dep = memo::call_memoized(arg_dependency(args)).unwrap();
    ADD_RUNS.fetch_add(1, Ordering::Relaxed);
    let result = dep.as_int64().unwrap() + arg_x(args);
    awaitable::return_value(MemoValue::Int64(result));
}

fn add_type() -> &'static Type {
    static TYPE: OnceLock<&'static Type> = OnceLock::new();
    TYPE.get_or_init(|| {
        Type::invocation_factory(
            "SpecAdd",
            16,
            &[0],
            invocation_extra_bytes(),
            TypeHints::default(),
            None,
            Some(add_entry),
        )
    })
}

static SIGN_RUNS: AtomicU64 = AtomicU64::new(0);

/// g() = (dependency > 0) as int — a lossy function, so recomputing it
/// after an input change often produces the same value.
fn sign_entry(args: IObj) {
    let dep = memo::call_memoized(arg_dependency(args)).unwrap();
    SIGN_RUNS.fetch_add(1, Ordering::Relaxed);
    let result = (dep.as_int64().unwrap() > 0) as i64;
    awaitable::return_value(MemoValue::Int64(result));
}

fn sign_type() -> &'static Type {
    static TYPE: OnceLock<&'static Type> = OnceLock::new();
    TYPE.get_or_init(|| {
        Type::invocation_factory(
            "SpecSign",
            16,
            &[0],
            invocation_extra_bytes(),
            TypeHints::default(),
            None,
            Some(sign_entry),
        )
    })
}

static PICK_RUNS: AtomicU64 = AtomicU64::new(0);

/// h() = if dependency != 0 { 10 } else { 20 }
fn pick_entry(args: IObj) {
    let dep = memo::call_memoized(arg_dependency(args)).unwrap();
    PICK_RUNS.fetch_add(1, Ordering::Relaxed);
    let result = if dep.as_int64().unwrap() != 0 { 10 } else { 20 };
    awaitable::return_value(MemoValue::Int64(result));
}

fn pick_type() -> &'static Type {
    static TYPE: OnceLock<&'static Type> = OnceLock::new();
    TYPE.get_or_init(|| {
        Type::invocation_factory(
            "SpecPick",
            16,
            &[0],
            invocation_extra_bytes(),
            TypeHints::default(),
            None,
            Some(pick_entry),
        )
    })
}

static PURE_RUNS: AtomicU64 = AtomicU64::new(0);

/// p(x) = x * 2, no dependencies.
fn pure_entry(args: IObj) {
    PURE_RUNS.fetch_add(1, Ordering::Relaxed);
    awaitable::return_value(MemoValue::Int64(arg_x(args) * 2));
}

fn pure_type() -> &'static Type {
    static TYPE: OnceLock<&'static Type> = OnceLock::new();
    TYPE.get_or_init(|| {
        Type::invocation_factory(
            "SpecPure",
            16,
            &[0],
            invocation_extra_bytes(),
            TypeHints::default(),
            None,
            Some(pure_entry),
        )
    })
}

fn int(value: &MemoValue) -> i64 {
    value.as_int64().expect("integer result")
}

// ============================================================================
// S3: simple memoization and invalidation
// ============================================================================

#[test]
fn spec_s3_memoize_and_invalidate() {
    let _exclusive = exclusive();
    let cell = Cell::new(MemoValue::Int64(100)).unwrap();
    let f = make_invocation(add_type(), cell.invocation(), 1);

    let before = ADD_RUNS.load(Ordering::Relaxed);
    assert_eq!(int(&memo::evaluate(f, None).unwrap()), 101);
    assert_eq!(ADD_RUNS.load(Ordering::Relaxed), before + 1);

    // A second query is served from cache.
    assert_eq!(int(&memo::evaluate(f, None).unwrap()), 101);
    assert_eq!(ADD_RUNS.load(Ordering::Relaxed), before + 1);

    // Changing the input invalidates and forces a recompute.
    let mut txn = Transaction::new();
    txn.assign(&cell, MemoValue::Int64(200));
    txn.commit();

    assert_eq!(int(&memo::evaluate(f, None).unwrap()), 201);
    assert_eq!(ADD_RUNS.load(Ordering::Relaxed), before + 2);
}

#[test]
fn spec_mvcc_pure_function_runs_once() {
    let _exclusive = exclusive();
    let dummy = Cell::new(MemoValue::Null).unwrap();
    let p = make_invocation(pure_type(), dummy.invocation(), 21);

    let before = PURE_RUNS.load(Ordering::Relaxed);
    assert_eq!(int(&memo::evaluate(p, None).unwrap()), 42);
    assert_eq!(PURE_RUNS.load(Ordering::Relaxed), before + 1);

    // Later transactions do not disturb a pure value.
    let unrelated = Cell::new(MemoValue::Int64(0)).unwrap();
    let mut txn = Transaction::new();
    txn.assign(&unrelated, MemoValue::Int64(1));
    txn.commit();

    assert_eq!(int(&memo::evaluate(p, None).unwrap()), 42);
    assert_eq!(PURE_RUNS.load(Ordering::Relaxed), before + 1);
}

// ============================================================================
// S4 (adapted): refresh without recompute
// ============================================================================

#[test]
fn spec_s4_refresh_skips_unaffected_ancestor() {
    let _exclusive = exclusive();
    // h depends on g depends on cell; changing the cell in a way that
    // keeps g's value must not re-run h.
    let cell = Cell::new(MemoValue::Int64(1)).unwrap();
    let g = make_invocation(sign_type(), cell.invocation(), 0);
    let h = make_invocation(pick_type(), g, 0);

    let sign_before = SIGN_RUNS.load(Ordering::Relaxed);
    let pick_before = PICK_RUNS.load(Ordering::Relaxed);
    assert_eq!(int(&memo::evaluate(h, None).unwrap()), 10);
    assert_eq!(SIGN_RUNS.load(Ordering::Relaxed), sign_before + 1);
    assert_eq!(PICK_RUNS.load(Ordering::Relaxed), pick_before + 1);

    // 1 -> 2: g recomputes to the same value, so h only refreshes.
    let mut txn = Transaction::new();
    txn.assign(&cell, MemoValue::Int64(2));
    txn.commit();

    assert_eq!(int(&memo::evaluate(h, None).unwrap()), 10);
    assert_eq!(SIGN_RUNS.load(Ordering::Relaxed), sign_before + 2);
    assert_eq!(
        PICK_RUNS.load(Ordering::Relaxed),
        pick_before + 1,
        "h's body must not re-run when its input refreshed to the same value"
    );

    // 2 -> -5: g's value flips, so h must recompute.
    let mut txn = Transaction::new();
    txn.assign(&cell, MemoValue::Int64(-5));
    txn.commit();

    assert_eq!(int(&memo::evaluate(h, None).unwrap()), 20);
    assert_eq!(PICK_RUNS.load(Ordering::Relaxed), pick_before + 2);
}

// ============================================================================
// Invalidation reach across a chain
// ============================================================================

#[test]
fn spec_invalidation_reaches_through_chain() {
    let _exclusive = exclusive();
    // c -> b -> a(cell): a change to the cell must be reflected by c.
    let cell = Cell::new(MemoValue::Int64(5)).unwrap();
    let b = make_invocation(add_type(), cell.invocation(), 100);
    let c = make_invocation(add_type(), b, 1000);

    assert_eq!(int(&memo::evaluate(c, None).unwrap()), 1105);

    let mut txn = Transaction::new();
    txn.assign(&cell, MemoValue::Int64(6));
    txn.commit();

    assert_eq!(int(&memo::evaluate(c, None).unwrap()), 1106);
}

// ============================================================================
// Cell monotonicity (MVCC reads)
// ============================================================================

#[test]
fn spec_cell_monotonicity() {
    let _exclusive = exclusive();
    let cell = Cell::new(MemoValue::Int64(10)).unwrap();
    // Pin the pre-commit transaction so its revision stays queryable.
    let task = memo::create_memo_task();
    let old_txn = task.query_txn();

    let mut txn = Transaction::new();
    txn.assign(&cell, MemoValue::Int64(20));
    txn.commit();
    let new_txn = memo::newest_visible_txn();
    assert!(new_txn > old_txn);

    assert_eq!(int(&cell.read(Some(old_txn)).unwrap()), 10);
    assert_eq!(int(&cell.read(Some(new_txn)).unwrap()), 20);
}

// ============================================================================
// S5: cyclic intern collapse
// ============================================================================

#[test]
fn spec_s5_cycle_collapse_and_finalize() {
    let _exclusive = exclusive();
    use rill_runtime::object::RObjOrFake;
    use rill_runtime::obstack::Obstack;

    static PAIR: OnceLock<&'static Type> = OnceLock::new();
    let pair = PAIR.get_or_init(|| Type::class_factory("SpecCyclePair", 16, &[0]));

    let mut ob = Obstack::new().unwrap();
    let note = ob.note();
    let a = ob.alloc_object(pair).unwrap();
    let b = ob.alloc_object(pair).unwrap();
    unsafe {
        *(a.addr() as *mut usize) = b.addr();
        *((a.addr() + 8) as *mut u64) = 1;
        *(b.addr() as *mut usize) = a.addr();
        *((b.addr() + 8) as *mut u64) = 2;
    }

    let ia = ob.intern(RObjOrFake::from_obj(a)).unwrap().ptr().unwrap();
    let delegate = ia.delegate();
    assert_eq!(rill_runtime::intern::cycle::group_size(delegate), 2);
    // One external reference (the obstack's), held by the delegate.
    assert_eq!(delegate.local_refcount(), 1);

    // Collecting the obstack registration drops the last reference and
    // finalizes the whole component.
    ob.collect(note);
    assert_eq!(rill_runtime::intern::cycle::group_size(delegate), 0);
}

// ============================================================================
// Invalidation watchers
// ============================================================================

#[test]
fn spec_watcher_fires_after_commit() {
    let _exclusive = exclusive();
    let cell = Cell::new(MemoValue::Int64(1)).unwrap();

    let watcher = memo::watch_dependencies(|| {
        let _ = cell.read(None).unwrap();
    })
    .expect("reading a cell records a dependency");
    assert!(watcher.is_subscribed());

    let mut txn = Transaction::new();
    txn.assign(&cell, MemoValue::Int64(2));
    txn.commit();

    assert!(watcher.is_invalidated());
}

#[test]
fn spec_watcher_unsubscribe_prevents_delivery() {
    let _exclusive = exclusive();
    let cell = Cell::new(MemoValue::Int64(1)).unwrap();
    let watcher = memo::watch_dependencies(|| {
        let _ = cell.read(None).unwrap();
    })
    .unwrap();

    assert!(watcher.unsubscribe());

    let mut txn = Transaction::new();
    txn.assign(&cell, MemoValue::Int64(3));
    txn.commit();
    assert!(!watcher.is_invalidated());
}

// ============================================================================
// Cleanup lists
// ============================================================================

#[test]
fn spec_cleanup_trims_without_further_commit() {
    let _exclusive = exclusive();
    let cell = Cell::new(MemoValue::Int64(1)).unwrap();
    let f = make_invocation(add_type(), cell.invocation(), 7);
    assert_eq!(int(&memo::evaluate(f, None).unwrap()), 8);
    let inv = Invocation::from_iobj(f);
    assert_eq!(inv.revision_count(), 1);

    let mut txn = Transaction::new();
    txn.assign(&cell, MemoValue::Int64(2));
    txn.commit();

    // Recomputing leaves the expired revision behind as the list tail;
    // it must be trimmed when the evaluation's own memo task drains,
    // with no further commit ever advancing the timeline.
    assert_eq!(int(&memo::evaluate(f, None).unwrap()), 9);
    assert_eq!(
        inv.revision_count(),
        1,
        "the expired revision must be trimmed once the last task at its end transaction drains"
    );
}

// ============================================================================
// LRU
// ============================================================================

#[test]
fn spec_lru_discard_detaches_cold_invocations() {
    let _exclusive = exclusive();
    let dummy = Cell::new(MemoValue::Null).unwrap();
    let p = make_invocation(pure_type(), dummy.invocation(), 333);
    assert_eq!(int(&memo::evaluate(p, None).unwrap()), 666);

    let inv = Invocation::from_iobj(p);
    assert!(inv.revision_count() >= 1);
    assert!(rill_runtime::memo::lru::len() >= 1);

    // Evict until the list is empty; our invocation loses its cache.
    while rill_runtime::memo::lru::discard_least_recently_used() {}
    assert_eq!(inv.revision_count(), 0);

    // The next query recomputes.
    let before = PURE_RUNS.load(Ordering::Relaxed);
    assert_eq!(int(&memo::evaluate(p, None).unwrap()), 666);
    assert_eq!(PURE_RUNS.load(Ordering::Relaxed), before + 1);
}

#[test]
fn spec_lru_discard_survives_concurrent_release() {
    // Evictions race against threads releasing their last reference to
    // the same invocations; the discard loop must never touch a freed
    // tail.
    let _exclusive = exclusive();
    let dummy = Cell::new(MemoValue::Null).unwrap();
    let dummy_inv = dummy.invocation();

    std::thread::scope(|scope| {
        for worker in 0..3i64 {
            scope.spawn(move || {
                for index in 0..50i64 {
                    let x = 1_000_000 + worker * 10_000 + index;
                    let p = make_invocation(pure_type(), dummy_inv, x);
                    assert_eq!(int(&memo::evaluate(p, None).unwrap()), x * 2);
                    // Drop our reference while the eviction loop runs.
                    rill_runtime::lock::safe_decref_iobj(p);
                }
            });
        }
        scope.spawn(|| {
            for _ in 0..600 {
                if !rill_runtime::memo::lru::discard_least_recently_used() {
                    std::thread::yield_now();
                }
            }
        });
    });

    while rill_runtime::memo::lru::discard_least_recently_used() {}
}

// ============================================================================
// Memo-cache persistence
// ============================================================================

#[test]
fn spec_memo_cache_roundtrip() {
    let _exclusive = exclusive();
    use std::io::{Seek, SeekFrom};

    let dummy = Cell::new(MemoValue::Null).unwrap();
    let p = make_invocation(pure_type(), dummy.invocation(), 4000);
    assert_eq!(int(&memo::evaluate(p, None).unwrap()), 8000);

    let mut file = tempfile::tempfile().unwrap();
    memo::serde::serialize_memo_cache(&mut file, memo::newest_visible_txn()).unwrap();

    file.seek(SeekFrom::Start(0)).unwrap();
    let installed = memo::serde::deserialize_memo_cache(&mut file).unwrap();
    assert!(
        installed >= 1,
        "at least the evaluated invocation must restore a value"
    );
}

#[test]
fn spec_memo_cache_rejects_garbage() {
    let _exclusive = exclusive();
    let mut garbage: &[u8] = &[0x13, 0x37, 0x00, 0x42];
    let err = memo::serde::deserialize_memo_cache(&mut garbage).unwrap_err();
    assert!(matches!(
        err,
        rill_runtime::RuntimeError::Deserialization { .. }
    ));
}
