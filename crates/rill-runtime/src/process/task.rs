//! Tasks - units of work a process can be asked to run
//!
//! Tasks are plain heap nodes pushed onto a process's atomic task list.
//! There is no open inheritance: a task is anything with a `run`, and the
//! one-shot arbiter gives many processes the chance to run one underlying
//! task exactly once.

use parking_lot::Mutex;
use std::sync::Arc;

/// Work a process can be asked to do.
pub trait Task: Send {
    fn run(self: Box<Self>);
}

/// A task that runs a closure.
pub struct LambdaTask<F: FnOnce() + Send> {
    func: F,
}

impl<F: FnOnce() + Send> LambdaTask<F> {
    pub fn new(func: F) -> Box<LambdaTask<F>> {
        Box::new(LambdaTask { func })
    }
}

impl<F: FnOnce() + Send> Task for LambdaTask<F> {
    fn run(self: Box<Self>) {
        (self.func)()
    }
}

/// Intrusive node in a process's task list.
pub(super) struct TaskNode {
    pub(super) next: usize,
    pub(super) task: Option<Box<dyn Task>>,
}

/// First come, first served guard around one underlying task. Many
/// one-shot tasks can point at the same arbiter; whoever runs first takes
/// the task, the rest see it is gone and do nothing.
pub struct Arbiter {
    task: Mutex<Option<Box<dyn Task>>>,
}

impl Arbiter {
    pub fn make(task: Box<dyn Task>) -> Arc<Arbiter> {
        Arc::new(Arbiter {
            task: Mutex::new(Some(task)),
        })
    }

    /// Run the underlying task if this is the first call.
    pub fn run_if_first(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.run();
        }
    }

    /// Has the underlying task already been taken? Once true, stays true.
    pub fn done(&self) -> bool {
        self.task.lock().is_none()
    }
}

/// A task giving one arbiter a chance to run.
pub struct OneShotTask {
    arbiter: Arc<Arbiter>,
}

impl OneShotTask {
    pub fn new(arbiter: Arc<Arbiter>) -> Box<OneShotTask> {
        Box::new(OneShotTask { arbiter })
    }
}

impl Task for OneShotTask {
    fn run(self: Box<Self>) {
        self.arbiter.run_if_first();
    }
}
