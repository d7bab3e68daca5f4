use std::sync::Arc;

use super::{Scheduler, ThreadWorker, TimedThread, Worker};

/// One shared timed thread; every worker handed out multiplexes onto it.
pub struct SingleScheduler {
    thread: Arc<TimedThread>,
}

impl SingleScheduler {
    pub fn new() -> Self {
        SingleScheduler {
            thread: TimedThread::spawn("riptide-single"),
        }
    }
}

impl Default for SingleScheduler {
    fn default() -> Self {
        SingleScheduler::new()
    }
}

impl Scheduler for SingleScheduler {
    fn worker(&self) -> Arc<dyn Worker> {
        Arc::new(ThreadWorker::new(Arc::clone(&self.thread)))
    }
}

impl Drop for SingleScheduler {
    fn drop(&mut self) {
        self.thread.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn workers_share_one_thread() {
        let scheduler = SingleScheduler::new();
        let (tx, rx) = mpsc::channel();
        let a = scheduler.worker();
        let b = scheduler.worker();
        let tx_a = tx.clone();
        a.schedule(Box::new(move || {
            tx_a.send(std::thread::current().id()).unwrap();
        }));
        b.schedule(Box::new(move || {
            tx.send(std::thread::current().id()).unwrap();
        }));
        let first = rx.recv().unwrap();
        let second = rx.recv().unwrap();
        assert_eq!(first, second);
    }
}
