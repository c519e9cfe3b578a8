use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

struct TaskCount {
    in_flight: AtomicUsize,
    lock: Mutex<()>,
    reached_zero: Condvar,
}

/// Counts tasks that are in flight and waits for all of them to finish when dropped.
///
/// Every loader or unpacker context carries a [`SingleTaskGuard`], which is what lets shutdown
/// wait for loads that are still suspended somewhere.
pub struct TaskCounterGuard {
    count: Arc<TaskCount>,
}

impl TaskCounterGuard {
    pub fn new() -> Self {
        Self {
            count: Arc::new(TaskCount {
                in_flight: AtomicUsize::new(0),
                lock: Mutex::new(()),
                reached_zero: Condvar::new(),
            }),
        }
    }

    pub fn obtain_task_guard(&self) -> SingleTaskGuard {
        self.count
            .in_flight
            .fetch_add(1, Ordering::AcqRel);
        SingleTaskGuard {
            count: self.count.clone(),
        }
    }

    pub fn any_tasks_in_flight(&self) -> bool {
        self.hint_num_tasks_in_flight() != 0
    }

    pub fn hint_num_tasks_in_flight(&self) -> usize {
        self.count.in_flight.load(Ordering::Acquire)
    }

    /// Blocks until no task guard is alive anymore.
    pub fn wait_until_idle(&self) {
        let mut lock = self.count.lock.lock().expect("Task Counter Lock");
        while self.any_tasks_in_flight() {
            // The timeout covers a guard that dropped between the check and the wait.
            lock = self
                .count
                .reached_zero
                .wait_timeout(lock, Duration::from_millis(10))
                .expect("Task Counter Lock")
                .0;
        }
    }
}

impl Default for TaskCounterGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskCounterGuard {
    fn drop(&mut self) {
        self.wait_until_idle();
    }
}

/// Keeps one task counted for as long as it is alive.
pub struct SingleTaskGuard {
    count: Arc<TaskCount>,
}

impl Drop for SingleTaskGuard {
    fn drop(&mut self) {
        if self
            .count
            .in_flight
            .fetch_sub(1, Ordering::AcqRel)
            == 1
        {
            let _lock = self.count.lock.lock().expect("Task Counter Lock");
            self.count.reached_zero.notify_all();
        }
    }
}
