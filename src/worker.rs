//! Job posting for deferred pool construction.
//!
//! The pipeline's job scheduler is an external collaborator; the pool only
//! needs "run this closure somewhere else". If posting fails the pool falls
//! back to initializing on the calling thread.

use std::thread;

use tokio::runtime::Handle;

use crate::error::{PoolError, PoolResult};

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs off the calling thread.
pub trait Worker: Send + Sync {
    /// Schedule `job`. An error means the job was not scheduled and will not
    /// run.
    fn post_job(&self, name: &str, job: Job) -> PoolResult<()>;
}

/// Runs each job on its own named OS thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadWorker {
    prefix: String,
}

impl ThreadWorker {
    /// Create a worker whose threads are named `"{prefix}-{job name}"`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Worker for ThreadWorker {
    fn post_job(&self, name: &str, job: Job) -> PoolResult<()> {
        let thread_name = if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}-{}", self.prefix, name)
        };
        thread::Builder::new()
            .name(thread_name)
            .spawn(job)
            .map(|_| ())
            .map_err(|e| PoolError::NoMemory(format!("failed to spawn job thread: {}", e)))
    }
}

/// Runs jobs on a Tokio runtime's blocking pool.
#[derive(Debug, Clone)]
pub struct RuntimeWorker {
    handle: Handle,
}

impl RuntimeWorker {
    /// Post jobs onto the runtime behind `handle`.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Worker for RuntimeWorker {
    fn post_job(&self, name: &str, job: Job) -> PoolResult<()> {
        log::trace!("[RuntimeWorker] posting job {}", name);
        drop(self.handle.spawn_blocking(job));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_thread_worker_runs_job_on_named_thread() {
        let (tx, rx) = mpsc::channel();
        ThreadWorker::new("metapool")
            .post_job(
                "init",
                Box::new(move || {
                    let name = thread::current().name().map(str::to_string);
                    tx.send(name).unwrap();
                }),
            )
            .unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("metapool-init"));
    }

    #[test]
    fn test_runtime_worker_runs_job() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap();
        let (tx, rx) = mpsc::channel();
        RuntimeWorker::new(runtime.handle().clone())
            .post_job("init", Box::new(move || tx.send(7u32).unwrap()))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }
}
