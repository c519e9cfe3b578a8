use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::runtime::job::after_suspend;

/// A callback that runs once on whatever executor it was submitted to.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere a zero-argument callback can be sent to run later.
pub trait Executor: Send + Sync {
    fn submit(&self, task: Task);
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn submit(&self, task: Task) {
        (**self).submit(task)
    }
}

impl<E: Executor + ?Sized> Executor for &E {
    fn submit(&self, task: Task) {
        (**self).submit(task)
    }
}

enum HandoffState<V> {
    Empty,
    Waiting(Waker),
    Fulfilled(V),
    Taken,
}

/// A one-shot slot that moves a value from the thread that produces it to the suspended task that
/// waits for it, waking the task on the producing thread.
pub(crate) struct Handoff<V> {
    state: Mutex<HandoffState<V>>,
}

impl<V> Handoff<V> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(HandoffState::Empty),
        }
    }

    pub(crate) fn fulfil(&self, value: V) {
        let waker = {
            let mut state = self.state.lock().expect("Handoff Lock");
            match std::mem::replace(&mut *state, HandoffState::Fulfilled(value)) {
                HandoffState::Empty => None,
                HandoffState::Waiting(waker) => Some(waker),
                HandoffState::Fulfilled(_) | HandoffState::Taken => unreachable!("Handoff fulfilled twice"),
            }
        };

        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub(crate) fn poll_take(&self, cx: &mut Context<'_>) -> Poll<V> {
        let mut state = self.state.lock().expect("Handoff Lock");
        match std::mem::replace(&mut *state, HandoffState::Taken) {
            HandoffState::Fulfilled(value) => Poll::Ready(value),
            HandoffState::Empty | HandoffState::Waiting(_) => {
                *state = HandoffState::Waiting(cx.waker().clone());
                Poll::Pending
            }
            HandoffState::Taken => unreachable!("Handoff value taken twice"),
        }
    }
}

/// Suspends the current job and resumes it from a callback submitted to `executor`.
///
/// The callback is only submitted once the job has fully suspended, so the rest of the body runs
/// on the executor and nowhere else.
///
/// ```ignore
/// reschedule_to(&cradle.loading_pool).await;
/// // now running on a loading pool thread
/// ```
pub fn reschedule_to<E: Executor + Clone + 'static>(executor: &E) -> Reschedule<E> {
    Reschedule {
        executor: Some(executor.clone()),
        handoff: None,
    }
}

pub struct Reschedule<E> {
    executor: Option<E>,
    handoff: Option<Arc<Handoff<()>>>,
}

impl<E> Unpin for Reschedule<E> {}

impl<E: Executor + Clone + 'static> Future for Reschedule<E> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(handoff) = &self.handoff {
            return handoff.poll_take(cx);
        }

        let Some(executor) = self.executor.take() else {
            unreachable!("Rescheduled without an executor");
        };
        let handoff = Arc::new(Handoff::new());
        let _ = handoff.poll_take(cx);
        self.handoff = Some(handoff.clone());

        after_suspend(Box::new(move || {
            executor.submit(Box::new(move || handoff.fulfil(())));
        }));
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::job::Job;
    use std::sync::mpsc::{Sender, channel};
    use std::thread::ThreadId;

    struct OneThread {
        sender: Mutex<Sender<Task>>,
        thread: ThreadId,
    }

    impl OneThread {
        fn spawn() -> Arc<Self> {
            let (sender, receiver) = channel::<Task>();
            let handle = std::thread::Builder::new()
                .name("test executor".into())
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        task();
                    }
                })
                .unwrap();
            Arc::new(Self {
                sender: Mutex::new(sender),
                thread: handle.thread().id(),
            })
        }
    }

    impl Executor for OneThread {
        fn submit(&self, task: Task) {
            self.sender.lock().unwrap().send(task).unwrap();
        }
    }

    #[test]
    pub fn reschedule_moves_the_job_to_the_executor() {
        let executor = OneThread::spawn();
        let target = executor.thread;

        let job = Job::new({
            let executor = executor.clone();
            async move {
                let before = std::thread::current().id();
                reschedule_to(&executor).await;
                Ok((before, std::thread::current().id()))
            }
        });

        let (before, after) = job.wait().unwrap();
        assert_ne!(before, target);
        assert_eq!(after, target);
    }

    #[test]
    pub fn handoff_delivers_values_fulfilled_before_polling() {
        let handoff = Arc::new(Handoff::new());
        handoff.fulfil(3);
        let job = Job::new({
            let handoff = handoff.clone();
            async move { Ok(std::future::poll_fn(|cx| handoff.poll_take(cx)).await) }
        });
        assert_eq!(job.wait().unwrap(), 3);
    }
}
