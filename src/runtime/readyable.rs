use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::runtime::job::Job;

/// Anything that can be asked whether it is done without blocking.
///
/// The completion context polls readyables from its own thread, hence readiness checks must be
/// cheap and must never block.
pub trait Readyable {
    fn is_ready(&self) -> bool;
}

impl<T: Send + 'static> Readyable for Job<T> {
    fn is_ready(&self) -> bool {
        Job::is_ready(self)
    }
}

impl<R: Readyable + ?Sized> Readyable for &R {
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }
}

impl<R: Readyable + ?Sized> Readyable for Arc<R> {
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }
}

impl<R: Readyable + ?Sized> Readyable for Box<R> {
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }
}

impl<T> Readyable for tokio::task::JoinHandle<T> {
    fn is_ready(&self) -> bool {
        self.is_finished()
    }
}

impl<T> Readyable for std::thread::JoinHandle<T> {
    fn is_ready(&self) -> bool {
        self.is_finished()
    }
}

impl Readyable for AtomicBool {
    fn is_ready(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

/// Adapts a closure into a [`Readyable`].
pub struct ReadyFn<F>(pub F);

impl<F: Fn() -> bool> Readyable for ReadyFn<F> {
    fn is_ready(&self) -> bool {
        (self.0)()
    }
}
