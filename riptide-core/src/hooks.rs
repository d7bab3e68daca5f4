//! Process-wide defaults: the prefetch buffer size, the late-error hook
//! and the shared schedulers. All setters are race-safe but meant for
//! early-process configuration.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use tracing::error;

use crate::error::FlowError;
use crate::scheduler::{ComputationScheduler, Scheduler, SingleScheduler};

static BUFFER_SIZE: AtomicUsize = AtomicUsize::new(128);

/// Default prefetch and queue capacity of asynchronous-boundary
/// operators.
pub fn buffer_size() -> usize {
    BUFFER_SIZE.load(Ordering::Relaxed)
}

/// # Panics
///
/// Panics if `size` is 0.
pub fn set_buffer_size(size: usize) {
    assert!(size > 0, "buffer size must be > 0");
    BUFFER_SIZE.store(size, Ordering::Relaxed);
}

type ErrorHook = dyn Fn(&FlowError) + Send + Sync;

static ERROR_HOOK: RwLock<Option<Arc<ErrorHook>>> = RwLock::new(None);

/// Install (or with `None`, reset) the hook receiving errors that arrive
/// after their chain already terminated. The default hook logs them.
pub fn set_error_hook(hook: Option<Arc<ErrorHook>>) {
    *ERROR_HOOK.write().unwrap() = hook;
}

/// Route an error that can no longer be delivered downstream. Errors are
/// never silently dropped.
pub fn late_error(error: &FlowError) {
    let hook = ERROR_HOOK.read().unwrap().clone();
    match hook {
        Some(hook) => hook(error),
        None => error!(%error, "terminal error arrived after the chain ended"),
    }
}

/// The shared computation scheduler (fixed pool, one thread per core).
pub fn computation() -> Arc<dyn Scheduler> {
    static SCHEDULER: OnceLock<Arc<ComputationScheduler>> = OnceLock::new();
    SCHEDULER
        .get_or_init(|| Arc::new(ComputationScheduler::new()))
        .clone()
}

/// The shared single-thread scheduler.
pub fn single() -> Arc<dyn Scheduler> {
    static SCHEDULER: OnceLock<Arc<SingleScheduler>> = OnceLock::new();
    SCHEDULER
        .get_or_init(|| Arc::new(SingleScheduler::new()))
        .clone()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[test]
    fn buffer_size_has_a_sane_default() {
        assert!(buffer_size() >= 16);
    }

    #[test]
    fn late_errors_reach_the_installed_hook() {
        let seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        set_error_hook(Some(Arc::new(move |_| {
            flag.store(true, Ordering::SeqCst);
        })));
        late_error(&FlowError::MissingBackpressure);
        set_error_hook(None);
        assert!(seen.load(Ordering::SeqCst));
    }
}
