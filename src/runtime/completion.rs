//! A single dedicated thread that lets any number of jobs wait for things to become ready.
//!
//! Waiting on a [`Readyable`] from a job never blocks the thread the job runs on. Instead a small
//! driver job is created that checks readiness once and suspends. If it is not ready right away,
//! the driver is handed to the completion thread, which resumes every outstanding driver once per
//! pass and resumes the waiting job as soon as its driver finishes. The waiting job then continues
//! on the completion thread, so anything heavy should reschedule somewhere else first.
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll, Waker};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use itertools::Itertools;
use log::{debug, error, trace};

use crate::error::JobError;
use crate::runtime::executor::{Executor, Handoff, Task};
use crate::runtime::job::{Job, JobHandle, after_suspend, suspend};
use crate::runtime::readyable::Readyable;

pub const DEFAULT_SLEEP_BUDGET: Duration = Duration::from_micros(100);
const DRAIN_SLEEP_BUDGET: Duration = Duration::from_micros(100);

/// A suspended waiter and the driver that decides when it may continue.
struct PendingRequest {
    waiting_party: Arc<Mutex<Waker>>,
    driver: JobHandle,
}

impl PendingRequest {
    fn wake_waiting_party(&self) {
        let waker = self
            .waiting_party
            .lock()
            .expect("Waiting Party Lock")
            .clone();
        waker.wake();
    }
}

enum Request {
    NotReady(PendingRequest),
    Task(Task),
}

struct Shared {
    sleep_budget_ns: AtomicU64,
    stop_requested: AtomicBool,
    queued: AtomicUsize,
    outstanding: AtomicUsize,
}

#[derive(Clone)]
struct RequestQueue {
    sender: Sender<Request>,
    shared: Arc<Shared>,
}

impl RequestQueue {
    fn push(&self, request: Request) {
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(request).is_err() {
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
            error!("Completion context is gone, a waiting job will never be resumed");
        }
    }
}

struct Completer {
    receiver: Receiver<Request>,
    shared: Arc<Shared>,
    completables: Vec<PendingRequest>,
    tasks: Vec<Task>,
}

impl Completer {
    fn run(mut self) {
        debug!("Completion context started");
        while !self.shared.stop_requested.load(Ordering::Acquire) {
            let budget = Duration::from_nanos(self.shared.sleep_budget_ns.load(Ordering::Relaxed));
            self.pass(budget);
        }

        // Nothing that was ever enqueued is abandoned: keep going until everyone is resumed.
        while !self.is_idle() {
            self.pass(DRAIN_SLEEP_BUDGET);
        }
        debug!("Completion context stopped");
    }

    fn pass(&mut self, sleep_budget: Duration) {
        let wake_up_point = Instant::now() + sleep_budget;

        while let Ok(request) = self.receiver.try_recv() {
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
            match request {
                Request::NotReady(request) => self.completables.push(request),
                Request::Task(task) => self.tasks.push(task),
            }
        }

        self.completables.retain(|request| {
            request.driver.resume();
            if request.driver.is_ready() {
                trace!("Driver finished, resuming the waiting party");
                request.wake_waiting_party();
                false
            } else {
                true
            }
        });

        for task in std::mem::take(&mut self.tasks) {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                error!("Completion context task panicked: {}", JobError::from_panic(payload));
            }
        }

        self.shared
            .outstanding
            .store(self.completables.len(), Ordering::Release);

        match wake_up_point.checked_duration_since(Instant::now()) {
            // Unparked early when the budget changes or a stop is requested.
            Some(remaining) if !remaining.is_zero() => std::thread::park_timeout(remaining),
            _ => std::thread::yield_now(),
        }
    }

    fn is_idle(&self) -> bool {
        self.completables.is_empty() && self.tasks.is_empty() && self.shared.queued.load(Ordering::Acquire) == 0
    }
}

pub struct CompletionContext {
    queue: RequestQueue,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl CompletionContext {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_sleep_budget(DEFAULT_SLEEP_BUDGET)
    }

    pub fn with_sleep_budget(sleep_budget: Duration) -> anyhow::Result<Self> {
        let shared = Arc::new(Shared {
            sleep_budget_ns: AtomicU64::new(sleep_budget.as_nanos() as u64),
            stop_requested: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
        });

        let (sender, receiver) = channel();
        let completer = Completer {
            receiver,
            shared: shared.clone(),
            completables: Vec::new(),
            tasks: Vec::new(),
        };
        let thread = std::thread::Builder::new()
            .name("completion ctx".into())
            .spawn(move || completer.run())
            .context("Spawning the Completion Context Thread")?;

        Ok(Self {
            queue: RequestQueue {
                sender,
                shared: shared.clone(),
            },
            shared,
            thread: Some(thread),
        })
    }

    /// How long one pass over the outstanding requests may take, including the sleep at its end.
    /// Zero makes the completion thread spin, yielding between passes.
    pub fn set_sleep_budget(&self, sleep_budget: Duration) {
        self.shared
            .sleep_budget_ns
            .store(sleep_budget.as_nanos() as u64, Ordering::Relaxed);
        self.wake_completer();
    }

    fn wake_completer(&self) {
        if let Some(thread) = &self.thread {
            thread.thread().unpark();
        }
    }

    pub fn sleep_budget(&self) -> Duration {
        Duration::from_nanos(self.shared.sleep_budget_ns.load(Ordering::Relaxed))
    }

    /// The number of waiters that were still unresolved at the end of the last pass.
    pub fn hint_num_outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Suspends until `readyable` is ready and hands it back. Continues inline if it already is.
    pub fn until_ready<R>(&self, readyable: R) -> UntilReady<'_, R>
    where
        R: Readyable + Send + 'static,
    {
        UntilReady::new(
            self,
            Box::pin(async move {
                while !readyable.is_ready() {
                    suspend().await;
                }
                Ok(readyable)
            }),
        )
    }

    /// Suspends until every element is ready and hands them back. Never fails, the elements
    /// have to be inspected individually.
    pub fn until_all_ready<R>(&self, readyables: Vec<R>) -> UntilReady<'_, Vec<R>>
    where
        R: Readyable + Send + 'static,
    {
        UntilReady::new(
            self,
            Box::pin(async move {
                for index in 0..readyables.len() {
                    while !readyables[index].is_ready() {
                        suspend().await;
                    }
                }
                Ok(readyables)
            }),
        )
    }

    /// Waits for all `jobs` and returns their values, or the failure that was captured first.
    /// Failures of the other jobs are dropped.
    pub async fn until_all_succeed<T>(&self, jobs: Vec<Job<T>>) -> Result<Vec<T>, JobError>
    where
        T: Send + 'static,
    {
        let first_failure = Arc::new(OnceLock::new());
        let watchers = jobs
            .into_iter()
            .map(|job| {
                let first_failure = first_failure.clone();
                Job::new(async move {
                    match job.await {
                        Ok(value) => Ok(Some(value)),
                        Err(error) => {
                            let _ = first_failure.set(error);
                            Ok(None)
                        }
                    }
                })
            })
            .collect_vec();

        let watchers = self.until_all_ready(watchers).await;
        if let Some(error) = first_failure.get() {
            return Err(error.clone());
        }

        watchers
            .into_iter()
            .map(|watcher| match watcher.extract_result()? {
                Some(value) => Ok(value),
                None => unreachable!("A job failed without capturing its failure"),
            })
            .collect()
    }

    /// Like [`Self::until_ready`], but every readiness check runs on `executor` and the waiting
    /// job is resumed there. Between checks the request bounces through the completion thread.
    pub fn until_ready_on<E, R>(&self, executor: &E, readyable: R) -> UntilReadyOn<E, R>
    where
        E: Executor + Clone + 'static,
        R: Readyable + Send + 'static,
    {
        UntilReadyOn {
            start: Some((self.queue.clone(), executor.clone(), readyable)),
            handoff: None,
        }
    }

    fn enqueue_after_suspend(&self, request: PendingRequest) {
        let queue = self.queue.clone();
        after_suspend(Box::new(move || {
            trace!("Enqueueing a pending request");
            queue.push(Request::NotReady(request));
        }));
    }
}

/// Runs tasks on the completion thread, at most once per pass.
impl Executor for CompletionContext {
    fn submit(&self, task: Task) {
        self.queue.push(Request::Task(task));
    }
}

impl Drop for CompletionContext {
    fn drop(&mut self) {
        self.shared
            .stop_requested
            .store(true, Ordering::Release);
        self.wake_completer();

        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == std::thread::current().id() {
                // Dropped by one of our own continuations, the loop drains and exits on its own.
                return;
            }
            if thread.join().is_err() {
                error!("Completion context thread terminated abnormally");
            }
        }
    }
}

type DriverBody<O> = Pin<Box<dyn Future<Output = anyhow::Result<O>> + Send>>;

enum UntilReadyState<O> {
    Start(DriverBody<O>),
    Suspended {
        driver: Job<O>,
        waiting_party: Arc<Mutex<Waker>>,
    },
    Done,
}

/// Future returned by [`CompletionContext::until_ready`] and [`CompletionContext::until_all_ready`].
pub struct UntilReady<'a, O> {
    context: &'a CompletionContext,
    state: UntilReadyState<O>,
}

impl<O> Unpin for UntilReady<'_, O> {}

impl<'a, O: Send + 'static> UntilReady<'a, O> {
    fn new(context: &'a CompletionContext, driver: DriverBody<O>) -> Self {
        Self {
            context,
            state: UntilReadyState::Start(driver),
        }
    }

    fn finish(driver: Job<O>) -> O {
        match driver.extract_result() {
            Ok(value) => value,
            Err(error) => panic!("Checking readiness failed: {error}"),
        }
    }
}

impl<O: Send + 'static> Future for UntilReady<'_, O> {
    type Output = O;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<O> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.state, UntilReadyState::Done) {
            UntilReadyState::Start(body) => {
                let driver = Job::new(body);
                if driver.is_ready() {
                    return Poll::Ready(Self::finish(driver));
                }

                let waiting_party = Arc::new(Mutex::new(cx.waker().clone()));
                this.context.enqueue_after_suspend(PendingRequest {
                    waiting_party: waiting_party.clone(),
                    driver: driver.handle(),
                });
                this.state = UntilReadyState::Suspended { driver, waiting_party };
                Poll::Pending
            }
            UntilReadyState::Suspended { driver, waiting_party } => {
                {
                    let mut waker = waiting_party.lock().expect("Waiting Party Lock");
                    if !waker.will_wake(cx.waker()) {
                        *waker = cx.waker().clone();
                    }
                }

                if driver.is_ready() {
                    return Poll::Ready(Self::finish(driver));
                }
                this.state = UntilReadyState::Suspended { driver, waiting_party };
                Poll::Pending
            }
            UntilReadyState::Done => panic!("Polled a completed until_ready"),
        }
    }
}

/// Future returned by [`CompletionContext::until_ready_on`].
pub struct UntilReadyOn<E, R> {
    start: Option<(RequestQueue, E, R)>,
    handoff: Option<Arc<Handoff<R>>>,
}

impl<E, R> Unpin for UntilReadyOn<E, R> {}

impl<E, R> Future for UntilReadyOn<E, R>
where
    E: Executor + Clone + 'static,
    R: Readyable + Send + 'static,
{
    type Output = R;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<R> {
        let this = self.get_mut();
        if let Some(handoff) = &this.handoff {
            return handoff.poll_take(cx);
        }

        let Some((queue, executor, readyable)) = this.start.take() else {
            unreachable!("until_ready_on without a readyable");
        };
        let handoff = Arc::new(Handoff::new());
        let _ = handoff.poll_take(cx);
        this.handoff = Some(handoff.clone());

        after_suspend(Box::new(move || check_on(queue, executor, readyable, handoff)));
        Poll::Pending
    }
}

fn check_on<E, R>(queue: RequestQueue, executor: E, readyable: R, handoff: Arc<Handoff<R>>)
where
    E: Executor + Clone + 'static,
    R: Readyable + Send + 'static,
{
    let next_executor = executor.clone();
    executor.submit(Box::new(move || {
        if readyable.is_ready() {
            handoff.fulfil(readyable);
            return;
        }

        let next_queue = queue.clone();
        queue.push(Request::Task(Box::new(move || {
            check_on(next_queue, next_executor, readyable, handoff)
        })));
    }));
}

impl std::fmt::Debug for CompletionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionContext")
            .field("sleep_budget", &self.sleep_budget())
            .field("outstanding", &self.hint_num_outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::readyable::ReadyFn;

    #[test]
    pub fn ready_readyables_complete_inline() {
        let context = Arc::new(CompletionContext::new().unwrap());
        let flag = Arc::new(AtomicBool::new(true));

        let job = Job::new({
            let flag = flag.clone();
            let context = context.clone();
            async move {
                let flag = context.until_ready(flag).await;
                Ok(flag.is_ready())
            }
        });
        assert!(job.is_ready());
        assert!(job.extract_result().unwrap());
    }

    #[test]
    pub fn waiter_resumes_on_the_completion_thread() {
        let context = Arc::new(CompletionContext::new().unwrap());
        let flag = Arc::new(AtomicBool::new(false));

        let job = Job::new({
            let context = context.clone();
            let flag = flag.clone();
            async move {
                context.until_ready(flag).await;
                Ok(std::thread::current().name().map(str::to_string))
            }
        });
        assert!(!job.is_ready());

        flag.store(true, Ordering::Release);
        assert_eq!(job.wait().unwrap().as_deref(), Some("completion ctx"));
    }

    #[test]
    pub fn sleep_budget_is_adjustable() {
        let context = CompletionContext::with_sleep_budget(Duration::from_millis(1)).unwrap();
        assert_eq!(context.sleep_budget(), Duration::from_millis(1));
        context.set_sleep_budget(Duration::ZERO);
        assert_eq!(context.sleep_budget(), Duration::ZERO);
    }

    #[test]
    pub fn running_completer_picks_up_a_shorter_budget() {
        let context = Arc::new(CompletionContext::with_sleep_budget(Duration::from_secs(1)).unwrap());
        let flag = Arc::new(AtomicBool::new(false));

        let job = Job::new({
            let context = context.clone();
            let flag = flag.clone();
            async move {
                context.until_ready(flag).await;
                Ok(())
            }
        });
        assert!(!job.is_ready());

        // Let the completer settle into its long sleep first.
        std::thread::sleep(Duration::from_millis(50));
        flag.store(true, Ordering::Release);
        let switched_at = Instant::now();
        context.set_sleep_budget(Duration::ZERO);

        job.wait().unwrap();
        assert!(switched_at.elapsed() < Duration::from_millis(500));
    }

    #[test]
    pub fn last_reference_may_drop_on_the_completion_thread() {
        let context = Arc::new(CompletionContext::new().unwrap());
        let flag = Arc::new(AtomicBool::new(false));

        let job = Job::new({
            let context = context.clone();
            let flag = flag.clone();
            async move {
                context
                    .until_ready(ReadyFn(move || flag.load(Ordering::Acquire)))
                    .await;
                Ok(())
            }
        });

        let releaser = {
            let flag = flag.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                flag.store(true, Ordering::Release);
            })
        };
        drop(context);
        releaser.join().unwrap();
        job.wait().unwrap();
    }
}
