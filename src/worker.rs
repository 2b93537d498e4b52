use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{field::display, Span};

use crate::dispatcher::{EmailDispatcher, Recipient};
use crate::domain::delivery_job::DeliveryJob;
use crate::domain::subscriber::StatusUpdate;
use crate::queue::JobQueue;
use crate::store::SubscriberStore;

pub enum ExecutionOutcome {
    TaskCompleted,
    EmptyQueue,
}

/// Consumes welcome-email jobs and writes delivery outcomes back to the
/// subscriber store.
pub struct QueueWorker {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn SubscriberStore>,
    dispatcher: Arc<dyn EmailDispatcher>,
    poll_interval: Duration,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn SubscriberStore>,
        dispatcher: Arc<dyn EmailDispatcher>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            dispatcher,
            poll_interval,
        }
    }

    pub async fn run_until_stopped(self) -> Result<(), anyhow::Error> {
        loop {
            match self.try_execute_task().await {
                Ok(ExecutionOutcome::EmptyQueue) => tokio::time::sleep(self.poll_interval).await,
                Ok(ExecutionOutcome::TaskCompleted) => {}
                Err(_) => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        }
    }

    /// Claims and processes at most one job.
    #[tracing::instrument(
        skip_all,
        fields(job_id = tracing::field::Empty, subscriber_id = tracing::field::Empty, attempt = tracing::field::Empty),
        err
    )]
    pub async fn try_execute_task(&self) -> Result<ExecutionOutcome, anyhow::Error> {
        let job = match self.queue.claim().await? {
            Some(job) => job,
            None => return Ok(ExecutionOutcome::EmptyQueue),
        };
        Span::current()
            .record("job_id", &display(&job.job_id))
            .record("subscriber_id", &display(&job.payload.subscriber_id))
            .record("attempt", &job.attempts_made);

        if job.exceeded_max_attempts() {
            let error = "Delivery stalled on its last attempt";
            let applied = self
                .store
                .transition_status(
                    job.payload.subscriber_id,
                    StatusUpdate::failed(error, Some(Utc::now())),
                )
                .await?;
            if !applied {
                tracing::warn!("Subscriber was no longer queued, status left unchanged");
            }
            self.queue.fail(&job, error).await?;
            return Ok(ExecutionOutcome::TaskCompleted);
        }

        let subscriber = match self.store.find_by_id(job.payload.subscriber_id).await? {
            Some(subscriber) => subscriber,
            None => {
                tracing::warn!("Subscriber no longer exists, dropping the job");
                self.queue.fail(&job, "Subscriber not found").await?;
                return Ok(ExecutionOutcome::TaskCompleted);
            }
        };

        if subscriber.status.is_sent() {
            tracing::info!("Welcome email was already sent, skipping");
            self.queue.complete(&job).await?;
            return Ok(ExecutionOutcome::TaskCompleted);
        }

        let delivery = match Recipient::try_from(&job.payload) {
            Ok(recipient) => self.dispatcher.send_welcome(&recipient).await,
            Err(err) => Err(err),
        };

        match delivery {
            Ok(()) => {
                let applied = self
                    .store
                    .transition_status(subscriber.id, StatusUpdate::sent(Utc::now()))
                    .await?;
                if !applied {
                    tracing::error!("Welcome email sent but the delivery could not be recorded");
                }
                self.queue.complete(&job).await?;
                tracing::info!("Welcome email sent");
            }
            Err(err) => self.handle_failed_delivery(&job, &err.to_string()).await?,
        }

        Ok(ExecutionOutcome::TaskCompleted)
    }

    async fn handle_failed_delivery(
        &self,
        job: &DeliveryJob,
        error: &str,
    ) -> Result<(), anyhow::Error> {
        let now = Utc::now();

        if job.attempts_exhausted() {
            tracing::error!(error, "Welcome email failed on its last attempt");
            let applied = self
                .store
                .transition_status(job.payload.subscriber_id, StatusUpdate::failed(error, Some(now)))
                .await?;
            if !applied {
                tracing::warn!("Subscriber was no longer queued, status left unchanged");
            }
            self.queue.fail(job, error).await?;
        } else {
            self.store.record_attempt(job.payload.subscriber_id, now).await?;
            let delay = self.queue.retry(job, error).await?;
            tracing::warn!(
                error,
                retry_in_ms = delay.as_millis() as u64,
                "Welcome email failed, retry scheduled"
            );
        }

        Ok(())
    }
}
