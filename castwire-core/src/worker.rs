//! Worker bookkeeping shared by every pipeline stage

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::runtime::{Handle, RuntimeFlavor};

/// Counts live worker tasks
#[derive(Debug, Clone, Default)]
pub struct WorkerCount(Arc<AtomicUsize>);

impl WorkerCount {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker; it counts as alive until the guard drops
    pub fn enter(&self) -> WorkerGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        WorkerGuard(self.0.clone())
    }

    /// Number of workers still alive
    pub fn active(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Held by a worker task for its whole lifetime
///
/// Dropping happens on normal return, on panic unwinding and when the task is
/// aborted, so the count never leaks.
#[derive(Debug)]
pub struct WorkerGuard(Arc<AtomicUsize>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Run a CPU-bound call from inside a worker task
///
/// On a multi-threaded runtime the call goes through `block_in_place` so other
/// workers keep running. On a current-thread runtime (tests) it runs inline.
pub fn run_blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_tracks_liveness() {
        let count = WorkerCount::new();
        let a = count.enter();
        let b = count.enter();
        assert_eq!(count.active(), 2);
        drop(a);
        assert_eq!(count.active(), 1);
        drop(b);
        assert_eq!(count.active(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_blocking_on_multi_thread() {
        assert_eq!(run_blocking(|| 2 + 2), 4);
    }

    #[tokio::test]
    async fn test_run_blocking_inline() {
        assert_eq!(run_blocking(|| "inline"), "inline");
    }
}
