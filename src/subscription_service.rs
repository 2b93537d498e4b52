use std::sync::Arc;

use crate::domain::delivery_job::{DeliveryJob, JobOptions};
use crate::domain::new_subscriber::{NewSubscriber, SubscriptionMetadata};
use crate::domain::subscriber::{StatusUpdate, Subscriber};
use crate::domain::subscriber_status::SubscriberStatus;
use crate::queue::JobQueue;
use crate::store::{StoreError, SubscriberStore};

/// Which path a successful subscription took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionOutcome {
    /// New subscriber. The welcome job was enqueued, or the enqueue failed and
    /// the subscriber is `failed`.
    Created,
    /// New subscriber, queue unavailable. The retry sweep picks it up later.
    QueuedDelayed,
    /// A previously failed subscriber resubscribed and was re-queued.
    ExistingRetry,
}

#[derive(Debug, Clone)]
pub struct SubscriptionResult {
    pub subscriber: Subscriber,
    pub outcome: SubscriptionOutcome,
}

#[derive(thiserror::Error)]
pub enum SubscribeError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("This email is already subscribed to our newsletter.")]
    DuplicateSubscription,
    #[error("Failed to persist the subscription.")]
    PersistenceFailure(#[source] StoreError),
}

impl From<StoreError> for SubscribeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UniqueViolation => SubscribeError::DuplicateSubscription,
            err => SubscribeError::PersistenceFailure(err),
        }
    }
}

/// Which stuck subscribers a retry pass may re-queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryScope {
    /// `pending_retry` and `failed` records whose welcome job never reached
    /// the worker. Delivery-exhausted records are left alone.
    Deferred,
    /// Every `failed` and `pending_retry` record.
    IncludingExhausted,
}

impl RetryScope {
    fn covers(&self, subscriber: &Subscriber) -> bool {
        match self {
            RetryScope::IncludingExhausted => true,
            // Only the worker records delivery attempts
            RetryScope::Deferred => {
                !subscriber.status.is_failed() || subscriber.last_attempt_at.is_none()
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    pub processed: u64,
    pub requeued: u64,
    pub skipped_unhealthy: bool,
}

pub struct SubscriptionService {
    store: Arc<dyn SubscriberStore>,
    queue: Arc<dyn JobQueue>,
    job_options: JobOptions,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn SubscriberStore>,
        queue: Arc<dyn JobQueue>,
        job_options: JobOptions,
    ) -> Self {
        Self {
            store,
            queue,
            job_options,
        }
    }

    #[tracing::instrument(
        name = "Subscribe to the newsletter",
        skip(self, name, email, metadata),
        fields(subscriber_email = %email, outcome = tracing::field::Empty)
    )]
    pub async fn subscribe(
        &self,
        name: String,
        email: String,
        metadata: SubscriptionMetadata,
    ) -> Result<SubscriptionResult, SubscribeError> {
        let new_subscriber =
            NewSubscriber::parse(name, email, metadata).map_err(SubscribeError::InvalidInput)?;

        if let Some(existing) = self.store.find_by_email(&new_subscriber.email).await? {
            if !existing.status.is_failed() {
                return Err(SubscribeError::DuplicateSubscription);
            }
            let subscriber = self.requeue_failed(existing).await?;
            tracing::Span::current().record("outcome", "existing_retry");

            return Ok(SubscriptionResult {
                subscriber,
                outcome: SubscriptionOutcome::ExistingRetry,
            });
        }

        let mut subscriber = self.store.insert(&new_subscriber).await?;

        if !self.queue.health_check().await.is_healthy() {
            tracing::warn!(
                subscriber_id = %subscriber.id,
                "Queue is unavailable, welcome email deferred to the retry sweep"
            );
            self.apply(&mut subscriber, StatusUpdate::to(SubscriberStatus::PendingRetry))
                .await?;
            tracing::Span::current().record("outcome", "queued_delayed");

            return Ok(SubscriptionResult {
                subscriber,
                outcome: SubscriptionOutcome::QueuedDelayed,
            });
        }

        if self
            .apply(&mut subscriber, StatusUpdate::to(SubscriberStatus::Queued))
            .await?
        {
            self.enqueue_welcome(&mut subscriber).await?;
        }
        tracing::Span::current().record("outcome", "created");

        Ok(SubscriptionResult {
            subscriber,
            outcome: SubscriptionOutcome::Created,
        })
    }

    /// Re-queues subscribers left in `failed` or `pending_retry`, limited to
    /// the records `scope` covers.
    #[tracing::instrument(name = "Retry pending welcome emails", skip(self))]
    pub async fn retry_pending_deliveries(
        &self,
        batch_size: i64,
        scope: RetryScope,
    ) -> Result<SweepReport, StoreError> {
        if !self.queue.health_check().await.is_healthy() {
            tracing::warn!("Queue is unavailable, skipping the retry sweep");
            return Ok(SweepReport {
                skipped_unhealthy: true,
                ..SweepReport::default()
            });
        }

        let candidates = self
            .store
            .find_by_statuses(
                &[SubscriberStatus::Failed, SubscriberStatus::PendingRetry],
                batch_size,
            )
            .await?;

        let mut report = SweepReport::default();
        for mut subscriber in candidates.into_iter().filter(|s| scope.covers(s)) {
            report.processed += 1;
            if !self
                .apply(&mut subscriber, StatusUpdate::to(SubscriberStatus::Queued))
                .await?
            {
                continue;
            }
            if self.enqueue_welcome(&mut subscriber).await? {
                report.requeued += 1;
            }
        }

        tracing::info!(
            processed = report.processed,
            requeued = report.requeued,
            "Retry sweep finished"
        );

        Ok(report)
    }

    async fn requeue_failed(&self, mut subscriber: Subscriber) -> Result<Subscriber, SubscribeError> {
        if !self
            .apply(&mut subscriber, StatusUpdate::to(SubscriberStatus::Queued))
            .await?
        {
            return Err(SubscribeError::DuplicateSubscription);
        }

        if !self.enqueue_welcome(&mut subscriber).await? {
            return Err(SubscribeError::DuplicateSubscription);
        }

        Ok(subscriber)
    }

    /// Pushes a fresh welcome job for a `queued` subscriber. On failure the
    /// subscriber is moved to `failed` and `false` is returned.
    async fn enqueue_welcome(&self, subscriber: &mut Subscriber) -> Result<bool, StoreError> {
        let job = DeliveryJob::welcome(subscriber, self.job_options);
        let job_id = job.job_id.clone();

        match self.queue.enqueue(job).await {
            Ok(true) => {
                tracing::info!(subscriber_id = %subscriber.id, job_id = %job_id, "Welcome email queued");
                Ok(true)
            }
            Ok(false) => {
                tracing::warn!(
                    subscriber_id = %subscriber.id,
                    job_id = %job_id,
                    "A welcome email job with this id already exists"
                );
                let update = StatusUpdate::failed(
                    format!("A welcome email job with id {} already exists", job_id),
                    None,
                );
                self.apply(subscriber, update).await?;
                Ok(false)
            }
            Err(err) => {
                tracing::error!(
                    subscriber_id = %subscriber.id,
                    error.cause_chain = ?err,
                    "Failed to queue the welcome email"
                );
                let update = StatusUpdate::failed(
                    format!("Failed to queue the welcome email: {}", err),
                    None,
                );
                self.apply(subscriber, update).await?;
                Ok(false)
            }
        }
    }

    /// Applies a compare-and-set transition and mirrors it on `subscriber`.
    async fn apply(
        &self,
        subscriber: &mut Subscriber,
        update: StatusUpdate,
    ) -> Result<bool, StoreError> {
        let applied = self
            .store
            .transition_status(subscriber.id, update.clone())
            .await?;
        if applied {
            update.apply_to(subscriber);
        }

        Ok(applied)
    }
}
