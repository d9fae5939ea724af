//! Runtime micro-benchmarks: allocation throughput, note/collect churn,
//! and memoized-call hit latency.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rill_runtime::memo::awaitable;
use rill_runtime::memo::invocation::invocation_extra_bytes;
use rill_runtime::memo::{self, Cell, MemoValue};
use rill_runtime::object::{IObj, RObj, Type, TypeHints};
use rill_runtime::Obstack;

fn bench_alloc(c: &mut Criterion) {
    let mut ob = Obstack::new().unwrap();
    let note = ob.note();
    c.bench_function("obstack_alloc_64", |b| {
        b.iter(|| {
            let mem = ob.alloc(black_box(64)).unwrap();
            black_box(mem);
        })
    });
    ob.collect(note);
}

fn bench_note_collect(c: &mut Criterion) {
    let mut ob = Obstack::new().unwrap();
    c.bench_function("note_alloc_collect", |b| {
        b.iter(|| {
            let note = ob.note();
            for _ in 0..16 {
                ob.alloc(black_box(64)).unwrap();
            }
            ob.collect(note);
        })
    });
}

fn bench_entry(args: IObj) {
    let x = unsafe { *((args.addr() + 8) as *const i64) };
    awaitable::return_value(MemoValue::Int64(x + 1));
}

fn bench_memo_hit(c: &mut Criterion) {
    let type_ = Type::invocation_factory(
        "BenchAdd",
        16,
        &[0],
        invocation_extra_bytes(),
        TypeHints::default(),
        None,
        Some(bench_entry),
    );
    let cell = Cell::new(MemoValue::Int64(0)).unwrap();

    let mut buffer = [0usize; 3];
    let payload = unsafe { buffer.as_mut_ptr().add(1) };
    let robj = unsafe { RObj::from_addr(payload as usize) };
    robj.set_vtable(type_.vtable());
    unsafe {
        *payload = cell.invocation().addr();
        *(payload.add(1) as *mut i64) = 41;
    }
    let invocation = rill_runtime::intern::intern(robj).unwrap();

    // Warm the cache once.
    assert_eq!(
        memo::evaluate(invocation, None).unwrap(),
        MemoValue::Int64(42)
    );

    c.bench_function("memo_hit", |b| {
        b.iter(|| {
            let value = memo::evaluate(black_box(invocation), None).unwrap();
            black_box(value);
        })
    });
}

criterion_group!(benches, bench_alloc, bench_note_collect, bench_memo_hit);
criterion_main!(benches);
