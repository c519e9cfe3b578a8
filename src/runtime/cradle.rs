use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use log::{error, info, warn};

use crate::runtime::completion::{CompletionContext, DEFAULT_SLEEP_BUDGET};
use crate::runtime::local::LocalContext;
use crate::runtime::offscreen::OffscreenContext;
use crate::runtime::thread_pool::ThreadPool;
use crate::util::task_counter::TaskCounterGuard;

#[derive(Clone, Debug)]
pub struct CradleConfig {
    /// Threads for general purpose work.
    pub task_pool_size: usize,
    /// Threads that loaders reschedule onto for decoding and disk access.
    pub loading_pool_size: usize,
    /// Initial sleep budget of the completion context.
    pub sleep_budget: Duration,
}

impl Default for CradleConfig {
    fn default() -> Self {
        let threads = ThreadPool::default_thread_count();
        Self {
            task_pool_size: threads,
            loading_pool_size: threads,
            sleep_budget: DEFAULT_SLEEP_BUDGET,
        }
    }
}

/// All the places asynchronous work can run, bundled. Loaders and unpackers get their executors
/// from here.
///
/// The thread that creates the cradle owns its local context. Dropping the cradle there drains
/// the local context first; dropping it anywhere else discards whatever is still queued.
pub struct AsyncCradle {
    pub local_context: Arc<LocalContext>,
    pub completion_context: Arc<CompletionContext>,
    pub offscreen_context: Arc<OffscreenContext>,
    pub loading_pool: Arc<ThreadPool>,
    pub task_pool: Arc<ThreadPool>,
    pub task_counter: Arc<TaskCounterGuard>,
    owner: ThreadId,
}

impl AsyncCradle {
    pub fn new(config: &CradleConfig) -> anyhow::Result<Self> {
        let task_counter = Arc::new(TaskCounterGuard::new());
        let cradle = Self {
            local_context: Arc::new(LocalContext::new(task_counter.clone())),
            completion_context: Arc::new(CompletionContext::with_sleep_budget(config.sleep_budget)?),
            offscreen_context: Arc::new(OffscreenContext::new()?),
            loading_pool: Arc::new(ThreadPool::new(config.loading_pool_size, "loading pool")?),
            task_pool: Arc::new(ThreadPool::new(config.task_pool_size, "task pool")?),
            task_counter,
            owner: std::thread::current().id(),
        };

        info!(
            "Async cradle up: {} task threads, {} loading threads, {:?} completion sleep budget",
            cradle.task_pool.num_threads(),
            cradle.loading_pool.num_threads(),
            config.sleep_budget
        );
        Ok(cradle)
    }
}

impl Drop for AsyncCradle {
    fn drop(&mut self) {
        if std::thread::current().id() != self.owner {
            let queued = self.local_context.hint_num_queued();
            if queued > 0 {
                warn!("Async cradle dropped off its owning thread, discarding {queued} local tasks");
            }
            info!("Async cradle shutting down");
            return;
        }

        // Tasks in flight may still want to continue on the local context.
        let drained = catch_unwind(AssertUnwindSafe(|| {
            self.local_context
                .drain_all_tasks(Duration::from_millis(1))
        }));
        if drained.is_err() {
            error!("A local task panicked while shutting down the async cradle");
        }
        info!("Async cradle shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::executor::reschedule_to;
    use crate::runtime::job::Job;

    #[test]
    pub fn default_config_uses_every_core() {
        let config = CradleConfig::default();
        assert_eq!(config.task_pool_size, ThreadPool::default_thread_count());
        assert_eq!(config.sleep_budget, DEFAULT_SLEEP_BUDGET);
    }

    #[test]
    pub fn hops_through_every_executor() {
        let cradle = Arc::new(
            AsyncCradle::new(&CradleConfig {
                task_pool_size: 1,
                loading_pool_size: 1,
                sleep_budget: Duration::from_micros(50),
            })
            .unwrap(),
        );

        let job = Job::new({
            let cradle = cradle.clone();
            let guard = cradle.task_counter.obtain_task_guard();
            async move {
                let _guard = guard;
                let mut visited = Vec::new();
                reschedule_to(&cradle.loading_pool).await;
                visited.push(std::thread::current().name().map(str::to_string));
                reschedule_to(&cradle.offscreen_context).await;
                visited.push(std::thread::current().name().map(str::to_string));
                reschedule_to(&cradle.completion_context).await;
                visited.push(std::thread::current().name().map(str::to_string));
                reschedule_to(&cradle.task_pool).await;
                visited.push(std::thread::current().name().map(str::to_string));
                reschedule_to(&cradle.local_context).await;
                visited.push(std::thread::current().name().map(str::to_string));
                Ok(visited)
            }
        });

        cradle
            .local_context
            .drain_all_tasks(Duration::from_millis(1));
        let visited = job.extract_result().unwrap();
        let main_name = std::thread::current().name().map(str::to_string);
        assert_eq!(
            visited,
            vec![
                Some("loading pool".to_string()),
                Some("offscreen ctx".to_string()),
                Some("completion ctx".to_string()),
                Some("task pool".to_string()),
                main_name,
            ]
        );
    }
}
