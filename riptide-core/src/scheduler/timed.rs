//! The timed loop behind the single and computation schedulers: one OS
//! thread draining a deadline heap, with insertion order breaking ties so
//! each worker keeps FIFO semantics.
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use super::{Cancellation, Task, Worker};

enum Job {
    Once(Task),
    Periodic {
        task: Box<dyn FnMut() + Send>,
        period: Duration,
    },
}

struct Entry {
    at: Instant,
    seq: u64,
    cancel: Cancellation,
    /// dispose() flag of the worker that scheduled this entry
    worker: Cancellation,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the earliest deadline (and
        // lowest sequence number) surfaces first
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

struct ThreadState {
    queue: BinaryHeap<Entry>,
    seq: u64,
    shutdown: bool,
}

/// One deadline-driven executor thread, shared by any number of worker
/// facades.
pub(crate) struct TimedThread {
    state: Mutex<ThreadState>,
    available: Condvar,
}

impl TimedThread {
    pub(crate) fn spawn(name: &str) -> Arc<TimedThread> {
        let core = Arc::new(TimedThread {
            state: Mutex::new(ThreadState {
                queue: BinaryHeap::new(),
                seq: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
        });
        let runner = Arc::clone(&core);
        let builder = thread::Builder::new().name(name.to_string());
        let spawned = builder.spawn(move || runner.run());
        if let Err(error) = spawned {
            debug!(%error, "failed to spawn scheduler thread");
        }
        core
    }

    fn submit(
        &self,
        job_at: Instant,
        worker: Cancellation,
        job: Job,
    ) -> Cancellation {
        let cancel = Cancellation::new();
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return Cancellation::cancelled();
        }
        let seq = state.seq;
        state.seq += 1;
        state.queue.push(Entry {
            at: job_at,
            seq,
            cancel: cancel.clone(),
            worker,
            job,
        });
        drop(state);
        self.available.notify_one();
        cancel
    }

    pub(crate) fn submit_once(
        &self,
        task: Task,
        delay: Duration,
        worker: Cancellation,
    ) -> Cancellation {
        self.submit(Instant::now() + delay, worker, Job::Once(task))
    }

    pub(crate) fn submit_periodic(
        &self,
        task: Box<dyn FnMut() + Send>,
        initial: Duration,
        period: Duration,
        worker: Cancellation,
    ) -> Cancellation {
        self.submit(
            Instant::now() + initial,
            worker,
            Job::Periodic { task, period },
        )
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        state.queue.clear();
        drop(state);
        self.available.notify_all();
    }

    fn run(self: Arc<Self>) {
        debug!("scheduler thread started");
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutdown {
                debug!("scheduler thread stopping");
                return;
            }
            let now = Instant::now();
            let due = state.queue.peek().map(|entry| entry.at);
            match due {
                None => {
                    state = self.available.wait(state).unwrap();
                }
                Some(at) if at <= now => {
                    let Some(mut entry) = state.queue.pop() else {
                        continue;
                    };
                    drop(state);
                    if !entry.cancel.is_cancelled() && !entry.worker.is_cancelled() {
                        match entry.job {
                            Job::Once(task) => task(),
                            Job::Periodic {
                                ref mut task,
                                period,
                            } => {
                                task();
                                if !entry.cancel.is_cancelled() && !entry.worker.is_cancelled() {
                                    // fixed-rate: the next deadline is
                                    // relative to the scheduled one
                                    entry.at += period;
                                    let mut relock = self.state.lock().unwrap();
                                    if !relock.shutdown {
                                        let seq = relock.seq;
                                        relock.seq += 1;
                                        entry.seq = seq;
                                        relock.queue.push(entry);
                                    }
                                    state = relock;
                                    continue;
                                }
                            }
                        }
                    }
                    state = self.state.lock().unwrap();
                }
                Some(at) => {
                    let wait = at - now;
                    let (relock, _timeout) = self.available.wait_timeout(state, wait).unwrap();
                    state = relock;
                }
            }
        }
    }
}

/// Worker facade over a [TimedThread]. Disposing flips its own flag, so
/// tasks from other workers on the same thread keep running.
pub(crate) struct ThreadWorker {
    thread: Arc<TimedThread>,
    alive: Cancellation,
}

impl ThreadWorker {
    pub(crate) fn new(thread: Arc<TimedThread>) -> Self {
        ThreadWorker {
            thread,
            alive: Cancellation::new(),
        }
    }
}

impl Worker for ThreadWorker {
    fn schedule(&self, task: Task) -> Cancellation {
        self.thread
            .submit_once(task, Duration::ZERO, self.alive.clone())
    }

    fn schedule_delayed(&self, task: Task, delay: Duration) -> Cancellation {
        self.thread.submit_once(task, delay, self.alive.clone())
    }

    fn schedule_periodic(
        &self,
        task: Box<dyn FnMut() + Send>,
        initial: Duration,
        period: Duration,
    ) -> Cancellation {
        self.thread
            .submit_periodic(task, initial, period, self.alive.clone())
    }

    fn dispose(&self) {
        self.alive.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn runs_tasks_in_submission_order() {
        let thread = TimedThread::spawn("riptide-test");
        let worker = ThreadWorker::new(Arc::clone(&thread));
        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            worker.schedule(Box::new(move || {
                tx.send(i).unwrap();
            }));
        }
        let seen: Vec<i32> = rx.iter().take(5).collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        thread.shutdown();
    }

    #[test]
    fn delayed_task_respects_deadline_order() {
        let thread = TimedThread::spawn("riptide-test");
        let worker = ThreadWorker::new(Arc::clone(&thread));
        let (tx, rx) = mpsc::channel();
        let late = tx.clone();
        worker.schedule_delayed(
            Box::new(move || late.send("late").unwrap()),
            Duration::from_millis(50),
        );
        worker.schedule(Box::new(move || tx.send("now").unwrap()));
        assert_eq!(rx.recv().unwrap(), "now");
        assert_eq!(rx.recv().unwrap(), "late");
        thread.shutdown();
    }

    #[test]
    fn cancelled_task_never_runs() {
        let thread = TimedThread::spawn("riptide-test");
        let worker = ThreadWorker::new(Arc::clone(&thread));
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        let handle = worker.schedule_delayed(
            Box::new(move || {
                flag.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(30),
        );
        handle.cancel();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        thread.shutdown();
    }

    #[test]
    fn disposed_worker_drops_pending_tasks() {
        let thread = TimedThread::spawn("riptide-test");
        let worker = ThreadWorker::new(Arc::clone(&thread));
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        worker.schedule_delayed(
            Box::new(move || {
                flag.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(30),
        );
        worker.dispose();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        thread.shutdown();
    }

    #[test]
    fn periodic_task_repeats_until_cancelled() {
        let thread = TimedThread::spawn("riptide-test");
        let worker = ThreadWorker::new(Arc::clone(&thread));
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = worker.schedule_periodic(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(5),
            Duration::from_millis(5),
        );
        while ticks.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(5));
        }
        handle.cancel();
        let settled = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(40));
        assert!(ticks.load(Ordering::SeqCst) <= settled + 1);
        thread.shutdown();
    }
}
