//! Bounded worker pool
//!
//! Runs each submitted task on its own thread from a tokio runtime's
//! blocking pool, capped at the pool capacity. Tasks that arrive while every
//! thread is busy wait in the runtime's queue. Stopping is cooperative: the
//! pool raises a flag that tasks check between units of work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info};

/// A unit of work for the pool
pub trait Task: Send + Sync + 'static {
    /// Run until done, or until `stop` is raised
    fn work(&self, stop: &AtomicBool);
}

pub struct WorkerPool {
    runtime: Runtime,
    stop: Arc<AtomicBool>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(capacity.max(1))
            .thread_name("relay-worker")
            .build()?;
        debug!(capacity, "worker pool started");
        Ok(Self {
            runtime,
            stop: Arc::new(AtomicBool::new(false)),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue `task` to run on a pool thread
    pub fn submit(&self, task: Arc<dyn Task>) {
        let stop = self.stop.clone();
        self.runtime.spawn_blocking(move || task.work(&stop));
    }

    /// Raise the cooperative stop flag
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Stop and wait up to `timeout` for running tasks to return
    pub fn shutdown(self, timeout: Duration) {
        self.stop();
        self.runtime.shutdown_timeout(timeout);
        info!("worker pool stopped");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
