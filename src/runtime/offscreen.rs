use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;

use anyhow::Context;
use log::{debug, error, warn};

use crate::error::JobError;
use crate::runtime::executor::{Executor, Task};

/// A dedicated thread that runs submitted tasks one after another, in submission order.
///
/// Meant for work that must not share a thread with anything else, e.g. uploads through a
/// graphics context that is current on that thread only.
pub struct OffscreenContext {
    sender: Mutex<Option<Sender<Task>>>,
    thread: Option<JoinHandle<()>>,
}

impl OffscreenContext {
    pub fn new() -> anyhow::Result<Self> {
        let (sender, receiver) = channel::<Task>();
        let thread = std::thread::Builder::new()
            .name("offscreen ctx".into())
            .spawn(move || Self::run(receiver))
            .context("Spawning the Offscreen Context Thread")?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            thread: Some(thread),
        })
    }

    fn run(receiver: Receiver<Task>) {
        debug!("Offscreen context started");
        while let Ok(task) = receiver.recv() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                error!("Offscreen task panicked: {}", JobError::from_panic(payload));
            }
        }
        debug!("Offscreen context stopped");
    }
}

impl Executor for OffscreenContext {
    fn submit(&self, task: Task) {
        let sender = self.sender.lock().expect("Offscreen Sender Lock");
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(task).is_err() {
                    warn!("Offscreen context thread is gone, dropping a task");
                }
            }
            None => warn!("Submitted a task to a stopped offscreen context"),
        }
    }
}

impl Drop for OffscreenContext {
    fn drop(&mut self) {
        // Closing the channel lets the thread finish the queued tasks and return.
        self.sender
            .lock()
            .expect("Offscreen Sender Lock")
            .take();

        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("Offscreen context thread terminated abnormally");
            }
        }
    }
}
