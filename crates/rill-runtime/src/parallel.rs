//! Parallel tabulate - split a pure computation across worker processes
//!
//! `parallel_tabulate(count, f)` evaluates `f(0..count)` on a pool of
//! worker threads, each running its own process (and therefore its own
//! obstack), and collects the results in index order. Work distribution
//! is a shared atomic index, so uneven elements balance themselves.
//!
//! Exceptions are compared by index: the lowest-index failure wins and is
//! reported on the master thread after all workers join. Every worker
//! process is joined or dropped before this returns, so no worker heap
//! outlives the call.

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::memo::MemoValue;
use crate::process::Process;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of worker threads the runtime will use.
pub fn num_threads() -> usize {
    RuntimeConfig::default().effective_worker_threads()
}

/// Evaluate `f` at every index in `0..count` in parallel.
pub fn parallel_tabulate<F>(count: usize, f: F) -> Result<Vec<MemoValue>>
where
    F: Fn(i64) -> Result<MemoValue> + Sync,
{
    let workers = num_threads().min(count.max(1));
    if count == 0 {
        return Ok(Vec::new());
    }
    if workers <= 1 {
        let mut results = Vec::with_capacity(count);
        for index in 0..count {
            results.push(f(index as i64)?);
        }
        return Ok(results);
    }

    let next_index = AtomicUsize::new(0);
    let results: Vec<Mutex<Option<MemoValue>>> = (0..count).map(|_| Mutex::new(None)).collect();
    // Lowest-index failure wins.
    let first_error: Mutex<Option<(usize, RuntimeError)>> = Mutex::new(None);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                let process = match Process::make() {
                    Ok(process) => process,
                    Err(err) => {
                        let mut slot = first_error.lock();
                        if slot.is_none() {
                            *slot = Some((0, err));
                        }
                        return;
                    }
                };
                let previous = Process::context_switch_to(Some(process.clone()));

                loop {
                    let index = next_index.fetch_add(1, Ordering::Relaxed);
                    if index >= count {
                        break;
                    }
                    // Past the first failure, later indices are wasted
                    // work; drain cheaply.
                    if first_error
                        .lock()
                        .as_ref()
                        .map(|(error_index, _)| index > *error_index)
                        .unwrap_or(false)
                    {
                        continue;
                    }
                    match f(index as i64) {
                        Ok(value) => *results[index].lock() = Some(value),
                        Err(err) => {
                            let mut slot = first_error.lock();
                            if slot
                                .as_ref()
                                .map(|(error_index, _)| index < *error_index)
                                .unwrap_or(true)
                            {
                                *slot = Some((index, err));
                            }
                        }
                    }
                }

                process.run_ready_tasks();
                Process::context_switch_to(previous);
                // Dropping the last reference frees the worker's heap.
            });
        }
    });

    if let Some((_, err)) = first_error.into_inner() {
        return Err(err);
    }
    let mut collected = Vec::with_capacity(count);
    for slot in results {
        match slot.into_inner() {
            Some(value) => collected.push(value),
            None => {
                return Err(RuntimeError::InvariantViolation(
                    "parallel_tabulate lost a result".into(),
                ))
            }
        }
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_squares() {
        let results = parallel_tabulate(100, |i| Ok(MemoValue::Int64(i * i))).unwrap();
        assert_eq!(results.len(), 100);
        for (i, value) in results.iter().enumerate() {
            assert_eq!(value.as_int64(), Some((i * i) as i64));
        }
    }

    #[test]
    fn test_empty() {
        let results = parallel_tabulate(0, |_| Ok(MemoValue::Null)).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_lowest_index_error_wins() {
        let result = parallel_tabulate(64, |i| {
            if i % 10 == 7 {
                Err(RuntimeError::Runtime(format!("boom at {}", i)))
            } else {
                Ok(MemoValue::Int64(i))
            }
        });
        match result {
            Err(RuntimeError::Runtime(message)) => assert_eq!(message, "boom at 7"),
            other => panic!("expected lowest-index error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_num_threads_positive() {
        assert!(num_threads() >= 1);
    }
}
