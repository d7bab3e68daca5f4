use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::scheduler::{Cancellation, Scheduler, Task, Worker};

enum VirtualJob {
    Once(Task),
    Periodic {
        task: Box<dyn FnMut() + Send>,
        period: Duration,
    },
}

struct VirtualEntry {
    at: Duration,
    seq: u64,
    cancel: Cancellation,
    worker: Cancellation,
    job: VirtualJob,
}

impl PartialEq for VirtualEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for VirtualEntry {}

impl PartialOrd for VirtualEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for VirtualEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

struct VirtualState {
    now: Duration,
    seq: u64,
    queue: BinaryHeap<VirtualEntry>,
}

/// A scheduler over virtual time: nothing runs until the test advances
/// the clock, so timed operators are tested without wall-clock sleeps.
#[derive(Clone)]
pub struct TestScheduler {
    state: Arc<Mutex<VirtualState>>,
}

impl TestScheduler {
    pub fn new() -> Self {
        TestScheduler {
            state: Arc::new(Mutex::new(VirtualState {
                now: Duration::ZERO,
                seq: 0,
                queue: BinaryHeap::new(),
            })),
        }
    }

    /// The current virtual time.
    pub fn now(&self) -> Duration {
        self.state.lock().unwrap().now
    }

    /// Advance the clock, running every task that becomes due, in
    /// deadline order. Tasks may schedule further tasks; those run too
    /// if they fall within the advanced window.
    pub fn advance_by(&self, delta: Duration) {
        let target = {
            let state = self.state.lock().unwrap();
            state.now + delta
        };
        loop {
            let mut state = self.state.lock().unwrap();
            let due = state
                .queue
                .peek()
                .map(|entry| entry.at <= target)
                .unwrap_or(false);
            if !due {
                state.now = target;
                return;
            }
            let Some(mut entry) = state.queue.pop() else {
                continue;
            };
            state.now = entry.at;
            drop(state);
            if entry.cancel.is_cancelled() || entry.worker.is_cancelled() {
                continue;
            }
            match entry.job {
                VirtualJob::Once(task) => task(),
                VirtualJob::Periodic {
                    ref mut task,
                    period,
                } => {
                    task();
                    if !entry.cancel.is_cancelled() && !entry.worker.is_cancelled() {
                        entry.at += period;
                        let mut state = self.state.lock().unwrap();
                        let seq = state.seq;
                        state.seq += 1;
                        entry.seq = seq;
                        state.queue.push(entry);
                    }
                }
            }
        }
    }

    fn submit(&self, delay: Duration, worker: Cancellation, job: VirtualJob) -> Cancellation {
        let cancel = Cancellation::new();
        let mut state = self.state.lock().unwrap();
        let at = state.now + delay;
        let seq = state.seq;
        state.seq += 1;
        state.queue.push(VirtualEntry {
            at,
            seq,
            cancel: cancel.clone(),
            worker,
            job,
        });
        cancel
    }
}

impl Default for TestScheduler {
    fn default() -> Self {
        TestScheduler::new()
    }
}

impl Scheduler for TestScheduler {
    fn worker(&self) -> Arc<dyn Worker> {
        Arc::new(VirtualWorker {
            scheduler: self.clone(),
            alive: Cancellation::new(),
        })
    }
}

struct VirtualWorker {
    scheduler: TestScheduler,
    alive: Cancellation,
}

impl Worker for VirtualWorker {
    fn schedule(&self, task: Task) -> Cancellation {
        self.scheduler
            .submit(Duration::ZERO, self.alive.clone(), VirtualJob::Once(task))
    }

    fn schedule_delayed(&self, task: Task, delay: Duration) -> Cancellation {
        self.scheduler
            .submit(delay, self.alive.clone(), VirtualJob::Once(task))
    }

    fn schedule_periodic(
        &self,
        task: Box<dyn FnMut() + Send>,
        initial: Duration,
        period: Duration,
    ) -> Cancellation {
        self.scheduler
            .submit(initial, self.alive.clone(), VirtualJob::Periodic { task, period })
    }

    fn dispose(&self) {
        self.alive.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn nothing_runs_before_the_clock_moves() {
        let scheduler = TestScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        scheduler.schedule_delayed(
            Box::new(move || {
                flag.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(10),
        );
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        scheduler.advance_by(Duration::from_millis(9));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        scheduler.advance_by(Duration::from_millis(1));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn periodic_tasks_tick_with_the_clock() {
        let scheduler = TestScheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = scheduler.schedule_periodic(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        scheduler.advance_by(Duration::from_millis(35));
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        handle.cancel();
        scheduler.advance_by(Duration::from_millis(100));
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
