use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::trace;

use crate::runtime::executor::{Executor, Task};
use crate::runtime::readyable::Readyable;
use crate::util::task_counter::TaskCounterGuard;

/// A task queue that is only ever run by the thread that flushes it, usually the main thread.
///
/// Whatever has to touch main thread state (the scene, the entity world) reschedules onto the
/// local context and waits for the next flush. Tasks run in submission order.
pub struct LocalContext {
    tasks: Mutex<VecDeque<Task>>,
    task_counter: Arc<TaskCounterGuard>,
}

impl LocalContext {
    pub fn new(task_counter: Arc<TaskCounterGuard>) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            task_counter,
        }
    }

    /// Runs every task that was queued when the call started. Tasks queued by those tasks run on
    /// the next flush. Returns the number of tasks run.
    pub fn flush_strong(&self) -> usize {
        let batch = std::mem::take(&mut *self.tasks.lock().expect("Local Tasks Lock"));
        Self::run_batch(batch)
    }

    /// Like [`Self::flush_strong`], but does nothing if the queue is locked at the moment.
    pub fn flush_nonblocking(&self) -> usize {
        let batch = match self.tasks.try_lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return 0,
        };
        Self::run_batch(batch)
    }

    fn run_batch(batch: VecDeque<Task>) -> usize {
        let num_tasks = batch.len();
        if num_tasks > 0 {
            trace!("Running {num_tasks} local tasks");
        }
        for task in batch {
            task();
        }
        num_tasks
    }

    pub fn hint_num_queued(&self) -> usize {
        self.tasks.lock().expect("Local Tasks Lock").len()
    }

    /// Keeps flushing until `readyable` is ready, sleeping `sleep` between flushes that ran
    /// nothing.
    pub fn flush_until_ready<R: Readyable + ?Sized>(&self, readyable: &R, sleep: Duration) {
        while !readyable.is_ready() {
            if self.flush_strong() == 0 && !readyable.is_ready() {
                std::thread::sleep(sleep);
            }
        }
    }

    /// Flushes until the queue is empty and no counted task is in flight anymore.
    ///
    /// Tasks that are in flight may still reschedule onto this context, so they have to be waited
    /// for here and not just on the task counter.
    pub fn drain_all_tasks(&self, sleep: Duration) {
        loop {
            let ran = self.flush_strong();
            if ran == 0 && self.hint_num_queued() == 0 && !self.task_counter.any_tasks_in_flight() {
                return;
            }
            if ran == 0 {
                std::thread::sleep(sleep);
            }
        }
    }
}

impl Executor for LocalContext {
    fn submit(&self, task: Task) {
        self.tasks
            .lock()
            .expect("Local Tasks Lock")
            .push_back(task);
    }
}
