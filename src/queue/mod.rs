//! Durable queue of welcome-email delivery jobs.
//!
//! Lifecycle of a job:
//!
//! - `enqueue` puts it in *waiting* (a second enqueue of the same id is a no-op)
//! - `claim` moves it to *active*, increments `attempts_made` and leases it
//!   for the stall timeout. Expired leases are moved back to waiting.
//! - `complete` / `fail` finish it, `retry` parks it in *delayed* until its
//!   backoff delay has elapsed.
//!
//! Lifecycle events are published to [`QueueObserver`]s. Nothing in the
//! delivery pipeline depends on them.

mod memory;
mod redis;

pub use self::memory::InMemoryJobQueue;
pub use self::redis::RedisJobQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::delivery_job::DeliveryJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueHealth {
    Healthy,
    Unhealthy,
}

impl QueueHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, QueueHealth::Healthy)
    }
}

/// Finished jobs kept for inspection until they are cleaned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishedState {
    Completed,
    Failed,
}

impl AsRef<str> for FinishedState {
    fn as_ref(&self) -> &str {
        match self {
            FinishedState::Completed => "completed",
            FinishedState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Stores and schedules `job`. `false` means a job with the same id
    /// already exists and nothing was added.
    async fn enqueue(&self, job: DeliveryJob) -> Result<bool, QueueError>;

    /// Connectivity check, bounded by the queue's operation timeout.
    async fn health_check(&self) -> QueueHealth;

    /// Next job that is due, with its attempt already counted.
    async fn claim(&self) -> Result<Option<DeliveryJob>, QueueError>;

    async fn complete(&self, job: &DeliveryJob) -> Result<(), QueueError>;

    /// Schedules another attempt after the job's backoff delay and returns it.
    async fn retry(&self, job: &DeliveryJob, error: &str) -> Result<Duration, QueueError>;

    /// Terminal failure; the job is not retried again.
    async fn fail(&self, job: &DeliveryJob, error: &str) -> Result<(), QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Drops finished jobs older than `older_than`, returning how many were removed.
    async fn clean(&self, state: FinishedState, older_than: Duration)
        -> Result<u64, QueueError>;
}

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("The queue backend is unavailable.")]
    Unavailable(#[from] ::redis::RedisError),
    #[error("The queue backend did not answer within {0:?}.")]
    Timeout(Duration),
    #[error("Failed to (de)serialize a delivery job.")]
    Serialization(#[from] serde_json::Error),
    #[error("The queue rejected the job: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Ready,
    Error { message: String },
    Stalled { count: u64 },
    Active { job_id: String, attempt: u32 },
    Completed { job_id: String },
    Retrying { job_id: String, attempt: u32, delay: Duration },
    Failed { job_id: String, attempt: u32, error: String },
    Cleaned { state: FinishedState, count: u64 },
}

pub trait QueueObserver: Send + Sync {
    fn on_event(&self, queue: &str, event: &QueueEvent);
}

/// Logs every queue event.
pub struct TracingObserver;

impl QueueObserver for TracingObserver {
    fn on_event(&self, queue: &str, event: &QueueEvent) {
        match event {
            QueueEvent::Ready => tracing::info!(queue, "Queue connection is ready"),
            QueueEvent::Error { message } => {
                tracing::error!(queue, error = %message, "Queue error")
            }
            QueueEvent::Stalled { count } => {
                tracing::warn!(queue, count, "Stalled jobs moved back to waiting")
            }
            QueueEvent::Active { job_id, attempt } => {
                tracing::debug!(queue, job_id = %job_id, attempt, "Job started processing")
            }
            QueueEvent::Completed { job_id } => {
                tracing::info!(queue, job_id = %job_id, "Job completed successfully")
            }
            QueueEvent::Retrying {
                job_id,
                attempt,
                delay,
            } => tracing::warn!(
                queue,
                job_id = %job_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Job failed, retry scheduled"
            ),
            QueueEvent::Failed {
                job_id,
                attempt,
                error,
            } => tracing::error!(
                queue,
                job_id = %job_id,
                attempt,
                error = %error,
                "Job failed"
            ),
            QueueEvent::Cleaned { state, count } => {
                tracing::info!(queue, state = %state.as_ref(), count, "Cleaned finished jobs")
            }
        }
    }
}

/// Fan-out of events to the registered observers.
#[derive(Clone, Default)]
pub struct QueueEvents {
    queue: String,
    observers: Vec<Arc<dyn QueueObserver>>,
}

impl QueueEvents {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            observers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, observer: Arc<dyn QueueObserver>) {
        self.observers.push(observer);
    }

    pub fn emit(&self, event: QueueEvent) {
        for observer in &self.observers {
            observer.on_event(&self.queue, &event);
        }
    }
}
