//! The task primitive of the runtime.
//!
//! A [`Job`] starts running its body on the calling thread the moment it is created and keeps
//! running it until the body suspends or completes. From there on the body is resumed by whoever
//! wakes it: a worker pool callback, the completion context or another job that completed. There
//! is no central executor that owns jobs.
//!
//! Awaiting a `Job` from inside another job registers the awaiting job as the continuation.
//! Only one continuation can be registered per job.
use std::cell::RefCell;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use crate::error::JobError;
use crate::runtime::executor::Task;

type Body<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>>;

enum Continuation {
    Empty,
    Waiting(Waker),
    Ready,
}

/// The combined "is ready" flag and continuation slot of a job frame.
///
/// Registering a continuation and becoming ready contend on the same lock, so exactly one of two
/// things happens to a continuation: it is rejected because the job is already ready, or it is
/// woken exactly once when the job becomes ready.
pub struct ReadyAndContinuation {
    ready: AtomicBool,
    state: Mutex<Continuation>,
    became_ready: Condvar,
}

impl ReadyAndContinuation {
    fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            state: Mutex::new(Continuation::Empty),
            became_ready: Condvar::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Records `waker` to be woken once the job becomes ready. Returns `false` if the job is
    /// already ready, in which case the result can be read directly.
    ///
    /// Registering again before the job is ready replaces the previous waker.
    pub fn try_set_continuation(&self, waker: &Waker) -> bool {
        let mut state = self.state.lock().expect("Continuation Lock");
        match &mut *state {
            Continuation::Ready => false,
            Continuation::Waiting(existing) => {
                if !existing.will_wake(waker) {
                    *existing = waker.clone();
                }
                true
            }
            Continuation::Empty => {
                *state = Continuation::Waiting(waker.clone());
                true
            }
        }
    }

    /// Flips to ready and hands out the registered continuation, which the caller has to wake
    /// outside of any lock.
    fn set_ready(&self) -> Option<Waker> {
        let mut state = self.state.lock().expect("Continuation Lock");
        let previous = std::mem::replace(&mut *state, Continuation::Ready);
        self.ready.store(true, Ordering::Release);
        self.became_ready.notify_all();

        match previous {
            Continuation::Empty => None,
            Continuation::Waiting(waker) => Some(waker),
            Continuation::Ready => unreachable!("A job became ready twice"),
        }
    }

    fn wait_until_ready(&self) {
        let mut state = self.state.lock().expect("Continuation Lock");
        while !matches!(*state, Continuation::Ready) {
            state = self
                .became_ready
                .wait(state)
                .expect("Continuation Lock");
        }
    }
}

enum JobResult<T> {
    Pending,
    Value(T),
    Failed(JobError),
    Extracted,
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const NOTIFIED: u8 = 2;
const COMPLETE: u8 = 3;

/// The shared state of one job. Kept alive by the `Job` handle and by every waker that points to
/// it, so the frame outlives the handle while something can still resume it.
struct Frame<T> {
    run_state: AtomicU8,
    body: Mutex<Option<Body<T>>>,
    result: Mutex<JobResult<T>>,
    continuation: ReadyAndContinuation,
}

impl<T: Send + 'static> Frame<T> {
    fn new(body: Body<T>) -> Self {
        Self {
            run_state: AtomicU8::new(IDLE),
            body: Mutex::new(Some(body)),
            result: Mutex::new(JobResult::Pending),
            continuation: ReadyAndContinuation::new(),
        }
    }

    fn completed(result: JobResult<T>) -> Self {
        let frame = Self {
            run_state: AtomicU8::new(COMPLETE),
            body: Mutex::new(None),
            result: Mutex::new(result),
            continuation: ReadyAndContinuation::new(),
        };
        let _ = frame.continuation.set_ready();
        frame
    }

    /// Runs the body on the current thread until it suspends or completes.
    ///
    /// Resuming a job that is currently running on another thread marks it as notified, which
    /// makes that thread poll once more instead of losing the wakeup.
    fn resume(self: &Arc<Self>) {
        let mut current = self.run_state.load(Ordering::Acquire);
        loop {
            let next = match current {
                IDLE => RUNNING,
                RUNNING => NOTIFIED,
                NOTIFIED | COMPLETE => return,
                _ => unreachable!("Invalid job run state {current}"),
            };

            match self
                .run_state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) if next == RUNNING => break,
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }

        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        let mut suspend_actions = Vec::new();

        loop {
            let outer_actions = SUSPEND_ACTIONS.with(|actions| actions.replace(Some(Vec::new())));
            let outcome = {
                let mut body = self.body.lock().expect("Job Body Lock");
                let Some(future) = body.as_mut() else {
                    unreachable!("Resumed a job that has no body left");
                };

                match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
                    Ok(Poll::Pending) => None,
                    Ok(Poll::Ready(output)) => {
                        *body = None;
                        Some(output.map_err(JobError::from))
                    }
                    Err(payload) => {
                        *body = None;
                        Some(Err(JobError::from_panic(payload)))
                    }
                }
            };
            let new_actions = SUSPEND_ACTIONS.with(|actions| actions.replace(outer_actions));
            suspend_actions.extend(new_actions.into_iter().flatten());

            if let Some(outcome) = outcome {
                self.complete(outcome);
                break;
            }

            match self
                .run_state
                .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(NOTIFIED) => self.run_state.store(RUNNING, Ordering::Release),
                Err(other) => unreachable!("Invalid job run state {other} after polling"),
            }
        }

        for action in suspend_actions {
            action();
        }
    }

    fn complete(&self, outcome: Result<T, JobError>) {
        {
            let mut result = self.result.lock().expect("Job Result Lock");
            *result = match outcome {
                Ok(value) => JobResult::Value(value),
                Err(error) => JobResult::Failed(error),
            };
        }

        self.run_state.store(COMPLETE, Ordering::Release);
        if let Some(continuation) = self.continuation.set_ready() {
            continuation.wake();
        }
    }

    fn take_result(&self) -> Result<T, JobError> {
        let mut result = self.result.lock().expect("Job Result Lock");
        match std::mem::replace(&mut *result, JobResult::Extracted) {
            JobResult::Value(value) => Ok(value),
            JobResult::Failed(error) => Err(error),
            JobResult::Pending => panic!("Extracted the result of a job that is not ready"),
            JobResult::Extracted => panic!("Extracted the result of a job twice"),
        }
    }
}

impl<T: Send + 'static> Wake for Frame<T> {
    fn wake(self: Arc<Self>) {
        self.resume();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.resume();
    }
}

/// The type-erased side of a frame that the completion context drives.
trait ErasedFrame: Send + Sync {
    fn resume_erased(self: Arc<Self>);
    fn is_ready(&self) -> bool;
}

impl<T: Send + 'static> ErasedFrame for Frame<T> {
    fn resume_erased(self: Arc<Self>) {
        self.resume();
    }

    fn is_ready(&self) -> bool {
        self.continuation.is_ready()
    }
}

/// A handle that can resume a job without knowing its result type.
#[derive(Clone)]
pub(crate) struct JobHandle(Arc<dyn ErasedFrame>);

impl JobHandle {
    pub(crate) fn resume(&self) {
        self.0.clone().resume_erased();
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.0.is_ready()
    }
}

/// An eagerly started task producing a `T`.
///
/// Dropping a `Job` does not cancel it; the body keeps running for as long as something holds a
/// waker to it.
pub struct Job<T> {
    frame: Arc<Frame<T>>,
}

impl<T: Send + 'static> Job<T> {
    /// Creates the job and immediately runs `body` up to its first suspension point.
    pub fn new<F>(body: F) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let frame = Arc::new(Frame::new(Box::pin(body)));
        frame.resume();
        Self { frame }
    }

    /// A job that is ready from the start.
    pub fn ready(value: T) -> Self {
        Self {
            frame: Arc::new(Frame::completed(JobResult::Value(value))),
        }
    }

    /// A job that failed from the start.
    pub fn failed(error: impl Into<JobError>) -> Self {
        Self {
            frame: Arc::new(Frame::completed(JobResult::Failed(error.into()))),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.frame.continuation.is_ready()
    }

    /// Blocks the calling thread until the job is ready. Never call this from a job body.
    pub fn wait_until_ready(&self) {
        self.frame.continuation.wait_until_ready();
    }

    /// See [`ReadyAndContinuation::try_set_continuation`].
    pub fn try_set_continuation(&self, waker: &Waker) -> bool {
        self.frame.continuation.try_set_continuation(waker)
    }

    /// Returns a copy of the value or the captured failure.
    ///
    /// # Panics
    /// If the job is not ready or the result has been extracted before.
    pub fn get_result(&self) -> Result<T, JobError>
    where
        T: Clone,
    {
        let result = self.frame.result.lock().expect("Job Result Lock");
        match &*result {
            JobResult::Value(value) => Ok(value.clone()),
            JobResult::Failed(error) => Err(error.clone()),
            JobResult::Pending => panic!("Queried the result of a job that is not ready"),
            JobResult::Extracted => panic!("Queried the result of a job that has been extracted"),
        }
    }

    /// Moves the value out or returns the captured failure.
    ///
    /// # Panics
    /// If the job is not ready.
    pub fn extract_result(self) -> Result<T, JobError> {
        self.frame.take_result()
    }

    /// Blocks until the job is ready and extracts its result.
    pub fn wait(self) -> Result<T, JobError> {
        self.wait_until_ready();
        self.extract_result()
    }

    pub(crate) fn handle(&self) -> JobHandle {
        JobHandle(self.frame.clone())
    }
}

impl<T: Send + 'static> Future for Job<T> {
    type Output = Result<T, JobError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.frame.continuation.is_ready() || !self.frame.continuation.try_set_continuation(cx.waker()) {
            return Poll::Ready(self.frame.take_result());
        }
        Poll::Pending
    }
}

impl<T> std::fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("ready", &self.frame.continuation.is_ready())
            .finish()
    }
}

thread_local! {
    static SUSPEND_ACTIONS: RefCell<Option<Vec<Task>>> = const { RefCell::new(None) };
}

/// Runs `action` once the job that is being polled on this thread has suspended, or right away
/// when nothing is being polled.
///
/// Submitting a resumption callback from here guarantees the job is resumed by the thread that
/// runs the callback and not by the thread that is still busy suspending it.
pub(crate) fn after_suspend(action: Task) {
    let rejected = SUSPEND_ACTIONS.with(|actions| match actions.borrow_mut().as_mut() {
        Some(list) => {
            list.push(action);
            None
        }
        None => Some(action),
    });

    if let Some(action) = rejected {
        action();
    }
}

/// Suspends the current job once without arranging to be woken. Only meaningful for bodies that
/// are resumed by something that polls them regularly, like the drivers of the completion context.
pub(crate) fn suspend() -> Suspend {
    Suspend { suspended: false }
}

pub(crate) struct Suspend {
    suspended: bool,
}

impl Future for Suspend {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.suspended {
            Poll::Ready(())
        } else {
            self.suspended = true;
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    pub fn synchronous_body_is_ready_on_creation() {
        let job = Job::new(async { Ok(21 * 2) });
        assert!(job.is_ready());
        assert_eq!(job.get_result().unwrap(), 42);
        assert_eq!(job.extract_result().unwrap(), 42);
    }

    #[test]
    pub fn body_runs_on_the_creating_thread() {
        let creator = std::thread::current().id();
        let job = Job::new(async move { Ok(std::thread::current().id()) });
        assert_eq!(job.extract_result().unwrap(), creator);
    }

    #[test]
    pub fn errors_and_panics_are_captured() {
        let failing: Job<()> = Job::new(async { Err(anyhow::anyhow!("no such file")) });
        assert!(failing.is_ready());
        assert!(matches!(failing.get_result(), Err(JobError::Failed(_))));

        let panicking: Job<()> = Job::new(async { panic!("corrupt header") });
        match panicking.extract_result() {
            Err(JobError::Panicked(message)) => assert_eq!(message, "corrupt header"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "twice")]
    pub fn double_extraction_is_fatal() {
        let job = Job::new(async { Ok(1) });
        let _ = job.frame.take_result();
        let _ = job.extract_result();
    }

    #[test]
    #[should_panic(expected = "not ready")]
    pub fn extraction_before_ready_is_fatal() {
        let job: Job<()> = Job::new(async {
            suspend().await;
            Ok(())
        });
        let _ = job.extract_result();
    }

    #[test]
    pub fn awaiting_a_ready_job_does_not_suspend() {
        let inner = Job::ready(5);
        let outer = Job::new(async move { Ok(inner.await? + 1) });
        assert!(outer.is_ready());
        assert_eq!(outer.extract_result().unwrap(), 6);
    }

    #[test]
    pub fn continuation_is_resumed_by_the_completing_thread() {
        let (sender, receiver) = std::sync::mpsc::channel::<u32>();
        let (inner_sender, inner_receiver) = std::sync::mpsc::channel::<()>();

        // The inner job suspends until a foreign thread wakes it.
        let inner = Job::new(async move {
            std::future::poll_fn(|cx| {
                let _ = inner_sender.send(());
                let waker = cx.waker().clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(10));
                    waker.wake();
                });
                Poll::Ready(())
            })
            .await;
            suspend().await;
            Ok(7u32)
        });
        inner_receiver.recv().unwrap();

        let outer = Job::new(async move {
            let value = inner.await?;
            let _ = sender.send(value);
            Ok(value)
        });

        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        outer.wait_until_ready();
        assert_eq!(outer.extract_result().unwrap(), 7);
    }

    #[test]
    pub fn exactly_one_of_ready_or_woken() {
        struct CountingWaker(AtomicUsize);
        impl Wake for CountingWaker {
            fn wake(self: Arc<Self>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        for _ in 0..200 {
            let state = Arc::new(ReadyAndContinuation::new());
            let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
            let waker = Waker::from(counter.clone());

            let publisher = {
                let state = state.clone();
                std::thread::spawn(move || {
                    if let Some(continuation) = state.set_ready() {
                        continuation.wake();
                    }
                })
            };
            let registered = state.try_set_continuation(&waker);
            publisher.join().unwrap();

            let woken = counter.0.load(Ordering::SeqCst);
            if registered {
                assert_eq!(woken, 1);
            } else {
                assert_eq!(woken, 0);
                assert!(state.is_ready());
            }
        }
    }

    #[test]
    pub fn dropping_the_handle_does_not_cancel() {
        let (sender, receiver) = std::sync::mpsc::channel::<Waker>();
        let (done_sender, done_receiver) = std::sync::mpsc::channel::<()>();

        let job: Job<()> = Job::new(async move {
            std::future::poll_fn(|cx| {
                let _ = sender.send(cx.waker().clone());
                Poll::Ready(())
            })
            .await;
            suspend().await;
            let _ = done_sender.send(());
            Ok(())
        });
        drop(job);

        receiver.recv().unwrap().wake();
        done_receiver
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
    }
}
