//! Specification-Based Process, Parallel and String Tests
//!
//! Cross-thread task delivery, child-process joining with handle
//! handover, parallel tabulate, and the string round-trip property.

use rill_runtime::memo::MemoValue;
use rill_runtime::object::RObjOrFake;
use rill_runtime::parallel;
use rill_runtime::process::{self, Process, UnownedProcess};
use rill_runtime::string;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// No lost task
// ============================================================================

#[test]
fn spec_no_task_lost_across_threads() {
    // SPEC: every task posted from any thread runs exactly once before
    // the process is joined.
    const POSTERS: usize = 4;
    const TASKS_PER_POSTER: usize = 500;

    let process = Process::make().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let posters: Vec<_> = (0..POSTERS)
        .map(|_| {
            let process = Arc::clone(&process);
            let counter = Arc::clone(&counter);
            std::thread::spawn(move || {
                for _ in 0..TASKS_PER_POSTER {
                    let captured = Arc::clone(&counter);
                    process
                        .schedule(move || {
                            captured.fetch_add(1, Ordering::Relaxed);
                        })
                        .unwrap();
                }
            })
        })
        .collect();

    // The owner drains while posts keep arriving.
    while counter.load(Ordering::Relaxed) < POSTERS * TASKS_PER_POSTER {
        process.run_exactly_one_task_sleeping_if_necessary();
    }
    process.run_ready_tasks();
    for poster in posters {
        poster.join().unwrap();
    }

    assert_eq!(counter.load(Ordering::Relaxed), POSTERS * TASKS_PER_POSTER);
    assert!(process.queue_is_empty());
}

// ============================================================================
// Ownership handover
// ============================================================================

#[test]
fn spec_join_child_hands_over_handles_and_tasks() {
    // SPEC: after join_child, every handle is owned by the parent and
    // every task posted to the child before the join runs at most once,
    // on the parent.
    let parent = Process::make().unwrap();
    let previous = Process::context_switch_to(Some(parent.clone()));

    let parent_note = rill_runtime::Obstack::with_cur(|ob| ob.note());
    let child = Process::make_child(
        UnownedProcess::new(Some(parent.clone())),
        parent_note,
    )
    .unwrap();

    // Spawn handles inside the child.
    let handles: Vec<_> = {
        let parent_active = Process::context_switch_to(Some(child.clone()));
        let handles = (0..8)
            .map(|index| {
                rill_runtime::Obstack::with_cur(|ob| {
                    ob.make_handle(RObjOrFake::from_fake_bits(-(index as i64) - 1))
                })
            })
            .collect();
        Process::context_switch_to(parent_active);
        handles
    };

    // Cross-thread posts through the handles land on the child.
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let captured = Arc::clone(&counter);
        let ok = handles[0].schedule_task(process::task::LambdaTask::new(move || {
            captured.fetch_add(1, Ordering::Relaxed);
        }));
        assert!(ok);
    }

    process::join_child(&parent, &child);
    parent.run_ready_tasks();

    assert!(child.is_dead());
    assert_eq!(counter.load(Ordering::Relaxed), 1);
    for handle in handles.iter() {
        assert!(handle.is_owned_by_current_process());
    }
    // Posting to the dead child now fails; posting through a handle
    // reaches the parent instead.
    assert!(child.schedule(|| {}).is_err());
    {
        let captured = Arc::clone(&counter);
        assert!(handles[1].schedule_task(process::task::LambdaTask::new(move || {
            captured.fetch_add(1, Ordering::Relaxed);
        })));
    }
    parent.run_ready_tasks();
    assert_eq!(counter.load(Ordering::Relaxed), 2);

    drop(handles);
    Process::context_switch_to(previous);
}

// ============================================================================
// S6: parallel tabulate
// ============================================================================

#[test]
fn spec_s6_parallel_tabulate_squares() {
    let results = parallel::parallel_tabulate(1000, |i| Ok(MemoValue::Int64(i * i))).unwrap();
    assert_eq!(results.len(), 1000);
    for (i, value) in results.iter().enumerate() {
        assert_eq!(value.as_int64(), Some((i as i64) * (i as i64)));
    }
}

#[test]
fn spec_parallel_tabulate_uses_worker_heaps() {
    // Workers may allocate on their own obstacks; the results must
    // survive the workers' heaps being torn down (interned/boxed).
    let results = parallel::parallel_tabulate(64, |i| {
        rill_runtime::Obstack::with_cur(|ob| {
            let text = format!("worker value {}", i);
            let value = string::from_utf8(ob, &text)?;
            string::to_memo_value(value)
        })
    })
    .unwrap();

    for (i, value) in results.iter().enumerate() {
        let recovered = string::from_memo_value(value).unwrap();
        assert_eq!(string::to_string(recovered), format!("worker value {}", i));
    }
}

// ============================================================================
// String round trip (property 5)
// ============================================================================

#[test]
fn spec_string_roundtrip_randomized() {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    let mut ob = rill_runtime::Obstack::new().unwrap();

    for _ in 0..200 {
        let len = rng.gen_range(0..4096usize);
        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let value = string::from_bytes(&mut ob, &data).unwrap();
        assert_eq!(string::to_bytes(value), data);
        assert_eq!(string::byte_size(value), data.len());

        // Hash is deterministic for equal content.
        let again = string::from_bytes(&mut ob, &data).unwrap();
        assert_eq!(string::hash(value), string::hash(again));
        assert!(string::equal(value, again));
    }
}

#[test]
fn spec_string_compare_is_total_order() {
    let mut ob = rill_runtime::Obstack::new().unwrap();
    let mut values = Vec::new();
    for text in ["", "a", "aa", "ab", "b", "ba", "a much longer string"] {
        values.push((text, string::from_utf8(&mut ob, text).unwrap()));
    }
    for &(a_text, a) in values.iter() {
        for &(b_text, b) in values.iter() {
            assert_eq!(
                string::compare(a, b),
                a_text.as_bytes().cmp(b_text.as_bytes()),
                "compare({:?}, {:?})",
                a_text,
                b_text
            );
        }
    }
}
