use std::future::Future;
use std::num::NonZeroUsize;

use anyhow::Context;
use log::debug;
use tokio::runtime::{Builder, Handle, Runtime};

use crate::runtime::executor::{Executor, Task};
use crate::runtime::job::Job;

/// A fixed size pool of worker threads for blocking work (decoding, parsing, loading from disk).
///
/// Backed by the blocking pool of a dedicated tokio runtime; every submitted task occupies one
/// thread until it returns.
pub struct ThreadPool {
    name: String,
    num_threads: usize,
    runtime: Option<Runtime>,
}

impl ThreadPool {
    pub fn new(num_threads: usize, name: &str) -> anyhow::Result<Self> {
        let num_threads = num_threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(num_threads)
            .thread_name(name)
            .build()
            .with_context(|| format!("Building the {name} runtime"))?;

        debug!("Started thread pool \"{name}\" with {num_threads} threads");
        Ok(Self {
            name: name.to_string(),
            num_threads,
            runtime: Some(runtime),
        })
    }

    pub fn default_thread_count() -> usize {
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(4)
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `func` on the pool and returns a job that becomes ready with its result.
    pub fn emplace<F, T>(&self, func: F) -> Job<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.runtime().spawn_blocking(func);
        Job::new(async move { handle.await? })
    }

    /// Spawns an async task on the pool's own runtime, for the odd piece of real async IO.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime().spawn(future)
    }

    fn runtime(&self) -> &Runtime {
        self.runtime
            .as_ref()
            .expect("Thread pool runtime is only taken on drop")
    }
}

impl Executor for ThreadPool {
    fn submit(&self, task: Task) {
        self.runtime().spawn_blocking(task);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };

        // Waiting for our own threads from one of them would never finish.
        if Handle::try_current().is_ok() {
            runtime.shutdown_background();
        } else {
            drop(runtime);
        }
        debug!("Stopped thread pool \"{}\"", self.name);
    }
}
