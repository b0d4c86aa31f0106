//! Thread pools fed from an in-process FIFO.
//!
//! Delivery handlers must return quickly, so anything slow (the summarizer
//! call, storage, republishing) is queued on a [`WorkerQueue`] and executed
//! on its own OS threads.

pub mod queue;

use std::fmt;
use std::time::Duration;

pub use queue::WorkerQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Stopped,
    Running,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Stopped => f.write_str("stopped"),
            WorkerStatus::Running => f.write_str("running"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerQueueConfig {
    /// Used for thread names and logs.
    pub name: String,
    pub workers: usize,
    pub idle_timeout: Duration,
    /// How long a worker waits for a task before checking for idleness.
    pub poll_interval: Duration,
}

impl Default for WorkerQueueConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            workers: 3,
            idle_timeout: Duration::from_secs(900),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl WorkerQueueConfig {
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        Self {
            name: name.into(),
            workers,
            ..Self::default()
        }
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
