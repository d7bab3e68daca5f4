//! Worker-based executors. A worker is single-threaded with FIFO
//! ordering; schedulers hand out workers backed by the caller's thread,
//! one shared thread, or a fixed pool.
mod computation;
mod immediate;
mod single;
mod timed;

pub use computation::ComputationScheduler;
pub use immediate::ImmediateScheduler;
pub use single::SingleScheduler;
pub(crate) use timed::{ThreadWorker, TimedThread};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A unit of work handed to a worker.
pub type Task = Box<dyn FnOnce() + Send>;

/// Handle to a scheduled task or a disposable resource. Cancelling keeps
/// a pending task from running; a task already in flight finishes.
#[derive(Clone, Debug)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Cancellation {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// An already-cancelled handle.
    pub fn cancelled() -> Self {
        let c = Cancellation::new();
        c.cancel();
        c
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Cancellation::new()
    }
}

/// A single-threaded FIFO task executor obtained from a [Scheduler].
pub trait Worker: Send + Sync {
    /// Run `task` as soon as the worker gets to it.
    fn schedule(&self, task: Task) -> Cancellation;

    /// Run `task` once after `delay`.
    fn schedule_delayed(&self, task: Task, delay: Duration) -> Cancellation;

    /// Run `task` after `initial`, then every `period` until cancelled.
    fn schedule_periodic(
        &self,
        task: Box<dyn FnMut() + Send>,
        initial: Duration,
        period: Duration,
    ) -> Cancellation;

    /// Drop all of this worker's pending tasks; in-flight tasks finish.
    fn dispose(&self);
}

/// Source of workers.
pub trait Scheduler: Send + Sync {
    fn worker(&self) -> Arc<dyn Worker>;

    /// One-shot convenience without managing a worker.
    fn schedule(&self, task: Task) -> Cancellation {
        self.worker().schedule(task)
    }

    fn schedule_delayed(&self, task: Task, delay: Duration) -> Cancellation {
        self.worker().schedule_delayed(task, delay)
    }

    fn schedule_periodic(
        &self,
        task: Box<dyn FnMut() + Send>,
        initial: Duration,
        period: Duration,
    ) -> Cancellation {
        self.worker().schedule_periodic(task, initial, period)
    }
}
