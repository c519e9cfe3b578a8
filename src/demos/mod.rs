pub mod batch;
pub mod streaming;

use std::time::Duration;

/// How long the main thread sleeps between flushes of the local context that ran nothing.
pub const IDLE_FLUSH_SLEEP: Duration = Duration::from_millis(1);
