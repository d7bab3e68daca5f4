use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::error;

use super::{Cancellation, Scheduler, Task, Worker};

/// Runs every task on the calling thread. Delays sleep the caller, and
/// periodic work is not supported (it would never return the thread).
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn worker(&self) -> Arc<dyn Worker> {
        Arc::new(ImmediateWorker {
            alive: Cancellation::new(),
        })
    }
}

struct ImmediateWorker {
    alive: Cancellation,
}

impl Worker for ImmediateWorker {
    fn schedule(&self, task: Task) -> Cancellation {
        if !self.alive.is_cancelled() {
            task();
        }
        Cancellation::cancelled()
    }

    fn schedule_delayed(&self, task: Task, delay: Duration) -> Cancellation {
        if !self.alive.is_cancelled() {
            thread::sleep(delay);
            if !self.alive.is_cancelled() {
                task();
            }
        }
        Cancellation::cancelled()
    }

    fn schedule_periodic(
        &self,
        _task: Box<dyn FnMut() + Send>,
        _initial: Duration,
        _period: Duration,
    ) -> Cancellation {
        error!("periodic work is not supported on the immediate scheduler");
        Cancellation::cancelled()
    }

    fn dispose(&self) {
        self.alive.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn runs_on_the_calling_thread() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let caller = thread::current().id();
        ImmediateScheduler.schedule(Box::new(move || {
            assert_eq!(thread::current().id(), caller);
            flag.store(true, Ordering::SeqCst);
        }));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn disposed_worker_skips_tasks() {
        let worker = ImmediateScheduler.worker();
        worker.dispose();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        worker.schedule(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(!ran.load(Ordering::SeqCst));
    }
}
