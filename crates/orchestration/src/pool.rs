//! Bounded worker pool for parallel fan-out.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::config::OrchestrationConfig;
use crate::error::{ExecutionError, Result};

/// A fixed-size pool of named worker threads.
///
/// Backed by a dedicated tokio runtime whose blocking pool is capped at
/// `size` threads; tasks submitted beyond that queue until a thread frees
/// up. The runtime's timer also drives every bounded wait of the engine.
///
/// Must not be dropped from within an asynchronous context.
#[derive(Debug)]
pub struct WorkerPool {
    runtime: Runtime,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize, thread_name: impl Into<String>) -> Result<Self> {
        let size = size.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(size)
            .thread_name(thread_name)
            .enable_time()
            .build()
            .map_err(|e| ExecutionError::CannotExecute(format!("worker pool failed to start: {e}")))?;
        Ok(Self { runtime, size })
    }

    pub fn from_config(config: &OrchestrationConfig) -> Result<Self> {
        Self::new(config.pool_size, config.thread_name.clone())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }

    /// Queues `task` for a worker thread.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Completion is reported by the task itself; the join handle is not needed.
        drop(self.runtime.spawn_blocking(task));
    }
}

/// Blocks the calling thread on `future`, giving up after `timeout`.
///
/// The calling thread must not be a runtime worker; plain threads and
/// blocking-pool threads are fine.
pub(crate) fn block_on_bounded<F: Future>(
    handle: &Handle,
    timeout: Option<Duration>,
    waiting_for: &'static str,
    future: F,
) -> Result<F::Output> {
    match timeout {
        None => Ok(handle.block_on(future)),
        Some(limit) => handle
            .block_on(async { tokio::time::timeout(limit, future).await })
            .map_err(|_| ExecutionError::Timeout {
                waiting_for,
                elapsed: limit,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_tasks_run_on_named_threads() {
        let pool = WorkerPool::new(2, "pool-test").unwrap();
        let (tx, rx) = mpsc::channel();
        pool.submit(move || {
            let name = std::thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("pool-test"));
    }

    #[test]
    fn test_zero_size_is_clamped() {
        let pool = WorkerPool::new(0, "pool-test").unwrap();
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_bounded_wait_times_out() {
        let pool = WorkerPool::new(1, "pool-test").unwrap();
        let err = block_on_bounded(
            pool.handle(),
            Some(Duration::from_millis(20)),
            "nothing",
            std::future::pending::<()>(),
        )
        .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout { waiting_for: "nothing", .. }));
    }

    #[test]
    fn test_bounded_wait_returns_value() {
        let pool = WorkerPool::new(1, "pool-test").unwrap();
        let value = block_on_bounded(pool.handle(), None, "ready", async { 42 }).unwrap();
        assert_eq!(value, 42);
    }
}
