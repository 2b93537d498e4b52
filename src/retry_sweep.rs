use std::sync::Arc;
use std::time::Duration;

use crate::queue::{FinishedState, JobQueue};
use crate::subscription_service::{RetryScope, SubscriptionService};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How long finished jobs are kept before they are cleaned.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub completed: Duration,
    pub failed: Duration,
}

/// Periodically re-queues undelivered welcome emails and cleans old
/// finished jobs. Subscribers whose delivery attempts ran out are left to a
/// manual retry or a new subscription.
pub struct RetrySweeper {
    service: Arc<SubscriptionService>,
    queue: Arc<dyn JobQueue>,
    interval: Duration,
    batch_size: i64,
    retention: Retention,
}

impl RetrySweeper {
    pub fn new(
        service: Arc<SubscriptionService>,
        queue: Arc<dyn JobQueue>,
        interval: Duration,
        batch_size: i64,
        retention: Retention,
    ) -> Self {
        Self {
            service,
            queue,
            interval: interval.max(MIN_SWEEP_INTERVAL),
            batch_size,
            retention,
        }
    }

    pub async fn run_until_stopped(self) -> Result<(), anyhow::Error> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    /// One maintenance pass. Failures are logged and retried on the next tick.
    #[tracing::instrument(name = "Run queue maintenance", skip(self))]
    pub async fn sweep_once(&self) {
        if let Err(err) = self
            .service
            .retry_pending_deliveries(self.batch_size, RetryScope::Deferred)
            .await {
            tracing::error!(error.cause_chain = ?err, "Retry sweep failed");
        }

        for (state, older_than) in [
            (FinishedState::Completed, self.retention.completed),
            (FinishedState::Failed, self.retention.failed),
        ] {
            match self.queue.clean(state, older_than).await {
                Ok(count) => tracing::debug!(state = %state.as_ref(), count, "Cleaned finished jobs"),
                Err(err) => {
                    tracing::error!(state = %state.as_ref(), error.cause_chain = ?err, "Failed to clean finished jobs")
                }
            }
        }
    }
}
