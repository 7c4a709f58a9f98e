//! Acceptor and worker thread groups.
//!
//! Each bootstrap owns two dedicated multi-thread runtimes. The acceptor group
//! runs bind and accept loops; the worker group drives every accepted
//! connection for its whole lifetime.

use std::thread;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::error::TransportError;

/// Default sizes: one acceptor thread per CPU, two worker threads per CPU.
pub fn default_sizes() -> (usize, usize) {
    let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    (cpus, cpus * 2)
}

pub struct ThreadGroups {
    acceptor: Option<Runtime>,
    worker: Option<Runtime>,
    acceptor_handle: Handle,
    worker_handle: Handle,
    acceptor_threads: usize,
    worker_threads: usize,
}

impl ThreadGroups {
    pub fn new(name: &str, acceptor_threads: usize, worker_threads: usize) -> Result<Self, TransportError> {
        if acceptor_threads == 0 || worker_threads == 0 {
            return Err(TransportError::InvalidConfig(format!(
                "thread groups need at least one thread (acceptor={}, worker={})",
                acceptor_threads, worker_threads
            )));
        }

        let acceptor = build_runtime(&format!("{}-acceptor", name), acceptor_threads)?;
        let worker = build_runtime(&format!("{}-worker", name), worker_threads)?;

        tracing::debug!(name, acceptor_threads, worker_threads, "Thread groups created");

        Ok(Self {
            acceptor_handle: acceptor.handle().clone(),
            worker_handle: worker.handle().clone(),
            acceptor: Some(acceptor),
            worker: Some(worker),
            acceptor_threads,
            worker_threads,
        })
    }

    pub fn acceptor(&self) -> &Handle {
        &self.acceptor_handle
    }

    pub fn worker(&self) -> &Handle {
        &self.worker_handle
    }

    pub fn sizes(&self) -> (usize, usize) {
        (self.acceptor_threads, self.worker_threads)
    }
}

fn build_runtime(name: &str, threads: usize) -> Result<Runtime, TransportError> {
    Builder::new_multi_thread()
        .worker_threads(threads)
        .thread_name(name)
        .enable_all()
        .build()
        .map_err(TransportError::Io)
}

impl std::fmt::Debug for ThreadGroups {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadGroups")
            .field("acceptor_threads", &self.acceptor_threads)
            .field("worker_threads", &self.worker_threads)
            .finish()
    }
}

impl Drop for ThreadGroups {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which panics inside another runtime.
        if let Some(rt) = self.acceptor.take() {
            rt.shutdown_background();
        }
        if let Some(rt) = self.worker.take() {
            rt.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_groups() {
        assert!(matches!(
            ThreadGroups::new("t", 0, 2),
            Err(TransportError::InvalidConfig(_))
        ));
    }

    #[test]
    fn default_worker_group_is_twice_acceptor() {
        let (acceptor, worker) = default_sizes();
        assert!(acceptor >= 1);
        assert_eq!(worker, acceptor * 2);
    }

    #[tokio::test]
    async fn groups_run_tasks_and_drop_inside_a_runtime() {
        let groups = ThreadGroups::new("test", 1, 2).unwrap();
        assert_eq!(groups.sizes(), (1, 2));

        let name = groups
            .worker()
            .spawn(async { thread::current().name().map(str::to_string) })
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some("test-worker"));

        drop(groups);
    }
}
