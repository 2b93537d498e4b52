use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::subscriber::Subscriber;

/// What the worker needs to deliver one welcome email.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WelcomePayload {
    pub subscriber_id: Uuid,
    pub name: String,
    pub email: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Waits `base * 2^(attempt - 1)` after the given failed attempt.
    Exponential { base_delay_ms: u64 },
}

impl BackoffPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Exponential { base_delay_ms } => {
                let exponent = attempt.saturating_sub(1);
                let factor = 2u64.saturating_pow(exponent);

                Duration::from_millis(base_delay_ms.saturating_mul(factor))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffPolicy::Exponential {
                base_delay_ms: 60_000,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeliveryJob {
    pub job_id: String,
    pub payload: WelcomePayload,
    pub options: JobOptions,
    /// Incremented by the queue every time the job is claimed.
    pub attempts_made: u32,
    pub last_error: Option<String>,
}

impl DeliveryJob {
    /// Builds the welcome job for a subscriber. The id is qualified with the
    /// enqueue time so a re-queued subscriber never collides with a stale job.
    pub fn welcome(subscriber: &Subscriber, options: JobOptions) -> Self {
        let enqueued_at = Utc::now();

        Self {
            job_id: format!(
                "welcome_{}_{}",
                subscriber.id,
                enqueued_at.timestamp_millis()
            ),
            payload: WelcomePayload {
                subscriber_id: subscriber.id,
                name: subscriber.name.as_ref().to_string(),
                email: subscriber.email.as_ref().to_string(),
                enqueued_at,
            },
            options,
            attempts_made: 0,
            last_error: None,
        }
    }

    pub fn start_attempt(&mut self) {
        self.attempts_made += 1;
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_made >= self.options.max_attempts
    }

    /// A job that stalled on its last allowed attempt is claimed once more
    /// only so that it can be failed.
    pub fn exceeded_max_attempts(&self) -> bool {
        self.attempts_made > self.options.max_attempts
    }

    pub fn retry_delay(&self) -> Duration {
        self.options.backoff.delay_after(self.attempts_made)
    }
}
