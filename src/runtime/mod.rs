pub mod completion;
pub mod cradle;
pub mod executor;
pub mod job;
pub mod local;
pub mod offscreen;
pub mod readyable;
pub mod thread_pool;
