use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use super::{Scheduler, ThreadWorker, TimedThread, Worker};

/// Fixed pool of timed threads; workers are pinned to pool threads
/// round-robin. Meant for the computational stages of a pipeline, with
/// one thread per core by default.
pub struct ComputationScheduler {
    threads: Vec<Arc<TimedThread>>,
    next: AtomicUsize,
}

impl ComputationScheduler {
    pub fn new() -> Self {
        let parallelism = thread::available_parallelism().map(usize::from).unwrap_or(1);
        ComputationScheduler::with_threads(parallelism)
    }

    /// # Panics
    ///
    /// Panics if `threads` is 0.
    pub fn with_threads(threads: usize) -> Self {
        assert!(threads > 0, "thread count must be > 0");
        ComputationScheduler {
            threads: (0..threads)
                .map(|i| TimedThread::spawn(&format!("riptide-computation-{i}")))
                .collect(),
            next: AtomicUsize::new(0),
        }
    }
}

impl Default for ComputationScheduler {
    fn default() -> Self {
        ComputationScheduler::new()
    }
}

impl Scheduler for ComputationScheduler {
    fn worker(&self) -> Arc<dyn Worker> {
        let at = self.next.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        Arc::new(ThreadWorker::new(Arc::clone(&self.threads[at])))
    }
}

impl Drop for ComputationScheduler {
    fn drop(&mut self) {
        for thread in &self.threads {
            thread.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn distributes_workers_over_the_pool() {
        let scheduler = ComputationScheduler::with_threads(2);
        let (tx, rx) = mpsc::channel();
        for _ in 0..4 {
            let tx = tx.clone();
            scheduler.schedule(Box::new(move || {
                tx.send(std::thread::current().id()).unwrap();
            }));
        }
        drop(tx);
        let ids: std::collections::HashSet<_> = rx.iter().collect();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn delayed_work_fires_once() {
        let scheduler = ComputationScheduler::with_threads(1);
        let (tx, rx) = mpsc::channel();
        scheduler.schedule_delayed(
            Box::new(move || {
                tx.send(()).unwrap();
            }),
            Duration::from_millis(10),
        );
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }
}
