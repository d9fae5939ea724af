//! Process - the unit of ownership for an obstack and a task queue
//!
//! A process is analogous to an OS process: it contains an address space
//! (the obstack) and a queue of pending work, and is run by at most one
//! thread at a time. Context switching installs the process's obstack in
//! thread-local storage so hot allocation paths need no indirection.
//!
//! The task-list head doubles as the ownership state. The four smallest
//! pointer values are sentinels (task nodes are heap-aligned, so they can
//! never collide):
//!
//! | value | state | meaning |
//! |---|---|---|
//! | 0 | orphaned | no owner; the next poster must find someone to run it |
//! | 1 | sleeping | the owner is blocked on the baton |
//! | 2 | dead | joined; posting fails |
//! | 3 | owned | some thread will run everything posted |
//!
//! Any larger value heads a singly linked LIFO of pending tasks, pushed
//! by CAS from any thread and popped only by the owner. The sentinel at
//! the tail of the chain preserves the state the list had when the first
//! push happened.

pub mod task;

use crate::error::{Result, RuntimeError};
use crate::obstack::{Obstack, Pos};
use parking_lot::{Condvar, Mutex};
use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use task::{Arbiter, LambdaTask, OneShotTask, Task, TaskNode};

const ORPHANED: usize = 0;
const SLEEPING: usize = 1;
const DEAD: usize = 2;
const OWNED: usize = 3;
const MAX_SENTINEL: usize = OWNED;

#[inline]
fn is_sentinel(head: usize) -> bool {
    head <= MAX_SENTINEL
}

/// Shared handle to a process.
pub type ProcessRef = Arc<Process>;

/// A process that the holder does not own the right to run; it can only
/// ask for asynchronous work to be done (like posting to an event loop).
#[derive(Clone, Default)]
pub struct UnownedProcess(Option<ProcessRef>);

impl UnownedProcess {
    pub fn new(process: Option<ProcessRef>) -> UnownedProcess {
        UnownedProcess(process)
    }

    pub fn is_some(&self) -> bool {
        self.0.is_some()
    }

    /// Post a task; returns false if there is no process or it is dead.
    pub fn schedule_task(&self, task: Box<dyn Task>) -> bool {
        match &self.0 {
            Some(process) => process.schedule_task(task).is_ok(),
            None => false,
        }
    }

    pub fn schedule(&self, func: impl FnOnce() + Send + 'static) -> bool {
        self.schedule_task(LambdaTask::new(func))
    }
}

/// The container of one obstack, one memo context, and one task queue.
pub struct Process {
    /// Task-list head; see the module docs for the encoding.
    tasks: AtomicUsize,

    /// Baton the owner sleeps on while waiting for a task.
    baton_lock: Mutex<bool>,
    baton_signal: Condvar,

    /// The process's heap. Touched only by the owning thread; while the
    /// process is context-switched in, thread-local storage points here.
    obstack: UnsafeCell<Obstack>,

    /// The parent that spawned us; asked for help when an orphaned
    /// process receives work.
    parent: UnownedProcess,

    /// Back-reference to the owning Arc, for arbiters that must capture
    /// an owning handle to this process.
    weak_self: std::sync::Weak<Process>,
}

unsafe impl Send for Process {}
unsafe impl Sync for Process {}

thread_local! {
    static CURRENT: RefCell<Option<ProcessRef>> = const { RefCell::new(None) };
}

impl Process {
    /// Create a new, owned process with a fresh obstack.
    pub fn make() -> Result<ProcessRef> {
        let obstack = Obstack::new()?;
        Ok(Process::build(obstack, UnownedProcess::default()))
    }

    /// Create a worker process whose obstack positions continue after
    /// `parent_note`, for later joining into the parent.
    pub fn make_child(parent: UnownedProcess, parent_note: Pos) -> Result<ProcessRef> {
        let obstack = Obstack::new_worker(parent_note)?;
        Ok(Process::build(obstack, parent))
    }

    fn build(obstack: Obstack, parent: UnownedProcess) -> ProcessRef {
        Arc::new_cyclic(|weak_self| Process {
            tasks: AtomicUsize::new(OWNED),
            baton_lock: Mutex::new(false),
            baton_signal: Condvar::new(),
            obstack: UnsafeCell::new(obstack),
            parent,
            weak_self: weak_self.clone(),
        })
    }

    /// The process currently running on this thread.
    pub fn current() -> Option<ProcessRef> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Convenience for handle creation.
    pub fn current_ref() -> Option<ProcessRef> {
        Process::current()
    }

    /// Make `process` current on this thread, returning the previous
    /// one. The incoming process's obstack lands in thread-local storage;
    /// the outgoing process gets its obstack back.
    pub fn context_switch_to(process: Option<ProcessRef>) -> Option<ProcessRef> {
        let obstack_ptr = process
            .as_ref()
            .map(|p| p.obstack.get())
            .unwrap_or(std::ptr::null_mut());
        Obstack::swap_cur(obstack_ptr);
        CURRENT.with(|current| current.replace(process))
    }

    /// The process's obstack. Only legal while the process is suspended
    /// or owned by the calling thread.
    #[allow(clippy::mut_from_ref)]
    pub fn obstack_assuming_suspended(&self) -> &mut Obstack {
        unsafe { &mut *self.obstack.get() }
    }

    // ------------------------------------------------------------------
    // Posting

    /// Post a task. Fails only if the process is dead.
    pub fn schedule_task(&self, task: Box<dyn Task>) -> Result<()> {
        let node = Box::into_raw(Box::new(TaskNode {
            next: 0,
            task: Some(task),
        }));

        let mut head = self.tasks.load(Ordering::Acquire);
        loop {
            if head == DEAD {
                unsafe { drop(Box::from_raw(node)) };
                return Err(RuntimeError::DeadProcess);
            }
            unsafe { (*node).next = head };
            match self.tasks.compare_exchange_weak(
                head,
                node as usize,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        match head {
            ORPHANED => self.ask_someone_to_run(),
            SLEEPING => self.signal_baton(),
            _ => {}
        }
        Ok(())
    }

    pub fn schedule(&self, func: impl FnOnce() + Send + 'static) -> Result<()> {
        self.schedule_task(LambdaTask::new(func))
    }

    /// An orphaned process just received work: arrange for someone
    /// (anyone) to run it exactly once, via an arbiter posted to the
    /// parent. Many concurrent posters may all observe the orphaned
    /// state; the arbiter guarantees a single run.
    fn ask_someone_to_run(&self) {
        if !self.parent.is_some() {
            return;
        }
        let Some(process) = self.weak_self.upgrade() else {
            return;
        };
        let arbiter = Arbiter::make(LambdaTask::new(move || {
            let previous = Process::context_switch_to(Some(process.clone()));
            process.run_ready_tasks_then_disown();
            Process::context_switch_to(previous);
        }));
        self.parent.schedule_task(OneShotTask::new(arbiter));
    }

    fn signal_baton(&self) {
        let mut posted = self.baton_lock.lock();
        *posted = true;
        self.baton_signal.notify_one();
    }

    // ------------------------------------------------------------------
    // Running (owner only)

    /// Pop one task if any is queued.
    fn maybe_pop_task(&self) -> Option<Box<dyn Task>> {
        let mut head = self.tasks.load(Ordering::Acquire);
        loop {
            if is_sentinel(head) {
                return None;
            }
            let node = head as *mut TaskNode;
            let next = unsafe { (*node).next };
            match self.tasks.compare_exchange_weak(
                head,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let mut node = unsafe { Box::from_raw(node) };
                    return node.task.take();
                }
                Err(observed) => head = observed,
            }
        }
    }

    /// Run tasks until the queue is empty.
    pub fn run_ready_tasks(&self) {
        while let Some(task) = self.maybe_pop_task() {
            task.run();
        }
        // Normalize a stale sleep marker left at the tail of a drained
        // chain.
        let _ = self
            .tasks
            .compare_exchange(SLEEPING, OWNED, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Run everything, then hand the process to whoever posts next.
    pub fn run_ready_tasks_then_disown(&self) {
        loop {
            self.run_ready_tasks();
            if self
                .tasks
                .compare_exchange(OWNED, ORPHANED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            // A push raced in between; process it too.
        }
    }

    /// Run one task, sleeping on the baton until one arrives.
    pub fn run_exactly_one_task_sleeping_if_necessary(&self) {
        loop {
            if let Some(task) = self.maybe_pop_task() {
                task.run();
                return;
            }
            let _ = self
                .tasks
                .compare_exchange(SLEEPING, OWNED, Ordering::AcqRel, Ordering::Acquire);
            if self
                .tasks
                .compare_exchange(OWNED, SLEEPING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let mut posted = self.baton_lock.lock();
                while !*posted {
                    self.baton_signal.wait(&mut posted);
                }
                *posted = false;
            }
        }
    }

    /// Run until the queue is empty and no valid handles remain on the
    /// obstack. Must be context-switched in on the calling thread.
    pub fn drain_everything_sleeping_if_necessary(&self) {
        loop {
            self.run_ready_tasks();
            let queue_empty = is_sentinel(self.tasks.load(Ordering::Acquire));
            let handles = Obstack::with_cur(|ob| ob.any_valid_handles());
            if queue_empty && !handles {
                return;
            }
            self.run_exactly_one_task_sleeping_if_necessary();
        }
    }

    // ------------------------------------------------------------------
    // Joining

    /// Is the queue empty (head is a bare sentinel)?
    pub fn queue_is_empty(&self) -> bool {
        is_sentinel(self.tasks.load(Ordering::Acquire))
    }

    /// Has this process been joined?
    pub fn is_dead(&self) -> bool {
        self.tasks.load(Ordering::Acquire) == DEAD
    }

    pub(crate) fn is_sleeping(&self) -> bool {
        self.tasks.load(Ordering::Acquire) == SLEEPING
    }
}

/// Transfer everything from a finished child into `parent`: heap
/// contents, handles (ownership reassigned atomically with the flip to
/// dead), and any tasks the child still has queued, order-preserving.
///
/// The parent must be context-switched in on the calling thread.
pub fn join_child(parent: &ProcessRef, child: &ProcessRef) {
    // Flip the child dead, acquiring its remaining tasks.
    let head = child.tasks.swap(DEAD, Ordering::AcqRel);

    // Steal the heap and the handles.
    let child_obstack = child.obstack_assuming_suspended();
    Obstack::with_cur(|parent_obstack| parent_obstack.absorb(child_obstack, parent));

    // Prepend the child's pending tasks to the parent, oldest-first so
    // relative order is preserved.
    if !is_sentinel(head) {
        let mut tasks = Vec::new();
        let mut cursor = head;
        while !is_sentinel(cursor) {
            let mut node = unsafe { Box::from_raw(cursor as *mut TaskNode) };
            cursor = node.next;
            if let Some(task) = node.task.take() {
                tasks.push(task);
            }
        }
        for task in tasks.into_iter().rev() {
            let _ = parent.schedule_task(task);
        }
    }

    log::trace!("join_child: child joined into parent");
}

/// If the child has no valid handles (and the caller asserts no pointers
/// into its heap), skip the copy entirely: the child's memory is simply
/// freed when the reference drops.
pub fn sweep_child(_parent: &ProcessRef, child: &ProcessRef) -> bool {
    if child.obstack_assuming_suspended().any_valid_handles() || !child.queue_is_empty() {
        return false;
    }
    child.tasks.swap(DEAD, Ordering::AcqRel);
    true
}

/// Run a memoized body on a child memo process, joining it back
/// afterwards. Falls back to running inline when no process is installed
/// (host threads without a scheduler) or the child heap cannot be
/// reserved.
pub fn with_memo_process<R>(f: impl FnOnce() -> R) -> R {
    let Some(parent) = Process::current() else {
        return f();
    };
    let parent_note = Obstack::with_cur(|ob| ob.note());
    let child = match Process::make_child(
        UnownedProcess::new(Some(parent.clone())),
        parent_note,
    ) {
        Ok(child) => child,
        Err(_) => return f(),
    };

    let previous = Process::context_switch_to(Some(child.clone()));
    let result = f();
    child.run_ready_tasks();
    Process::context_switch_to(previous);

    if !sweep_child(&parent, &child) {
        join_child(&parent, &child);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;

    #[test]
    fn test_post_and_run() {
        let process = Process::make().unwrap();
        let counter = Arc::new(Counter::new(0));
        for _ in 0..5 {
            let captured = Arc::clone(&counter);
            process
                .schedule(move || {
                    captured.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
        }
        process.run_ready_tasks();
        assert_eq!(counter.load(Ordering::Relaxed), 5);
        assert!(process.queue_is_empty());
    }

    #[test]
    fn test_lifo_order() {
        let process = Process::make().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for index in 0..3 {
            let captured = Arc::clone(&order);
            process
                .schedule(move || captured.lock().push(index))
                .unwrap();
        }
        process.run_ready_tasks();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }

    #[test]
    fn test_dead_process_rejects_posts() {
        let parent = Process::make().unwrap();
        let child = Process::make().unwrap();
        let previous = Process::context_switch_to(Some(parent.clone()));
        join_child(&parent, &child);
        Process::context_switch_to(previous);

        assert!(child.is_dead());
        assert!(child.schedule(|| {}).is_err());
    }

    #[test]
    fn test_sleeping_wakes_on_post() {
        let process = Process::make().unwrap();
        let counter = Arc::new(Counter::new(0));

        let poster = {
            let process = Arc::clone(&process);
            let captured = Arc::clone(&counter);
            std::thread::spawn(move || {
                // Wait for the main thread to actually sleep.
                while !process.is_sleeping() {
                    std::thread::yield_now();
                }
                process
                    .schedule(move || {
                        captured.fetch_add(1, Ordering::Relaxed);
                    })
                    .unwrap();
            })
        };

        process.run_exactly_one_task_sleeping_if_necessary();
        poster.join().unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_join_transfers_pending_tasks() {
        let parent = Process::make().unwrap();
        let child = Process::make_child(
            UnownedProcess::new(Some(parent.clone())),
            parent.obstack_assuming_suspended().note(),
        )
        .unwrap();

        let counter = Arc::new(Counter::new(0));
        // Pretend the child has an unserviced handle so the join takes
        // the full path.
        let handle = {
            let previous = Process::context_switch_to(Some(child.clone()));
            let handle = Obstack::with_cur(|ob| {
                ob.make_handle(crate::object::RObjOrFake::from_fake_bits(-11))
            });
            Process::context_switch_to(previous);
            handle
        };
        for _ in 0..3 {
            let captured = Arc::clone(&counter);
            child
                .schedule(move || {
                    captured.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
        }

        let previous = Process::context_switch_to(Some(parent.clone()));
        join_child(&parent, &child);
        parent.run_ready_tasks();
        Process::context_switch_to(previous);

        assert_eq!(counter.load(Ordering::Relaxed), 3);
        assert!(child.is_dead());
        assert_eq!(handle.get().sbits(), -11);
        drop(handle);
    }
}
