//! Durable subscriber records.
//!
//! Email uniqueness is a store invariant: `insert` fails with
//! [`StoreError::UniqueViolation`] instead of relying on callers to look the
//! email up first.

mod memory;
mod postgres;

pub use memory::InMemorySubscriberStore;
pub use postgres::PgSubscriberStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    new_subscriber::NewSubscriber,
    subscriber::{StatusUpdate, Subscriber},
    subscriber_email::SubscriberEmail,
    subscriber_status::SubscriberStatus,
};

#[async_trait]
pub trait SubscriberStore: Send + Sync {
    async fn find_by_email(
        &self,
        email: &SubscriberEmail,
    ) -> Result<Option<Subscriber>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Subscriber>, StoreError>;

    /// Persists a new subscriber in `pending` status.
    async fn insert(&self, new_subscriber: &NewSubscriber) -> Result<Subscriber, StoreError>;

    /// Applies `update` if the subscriber's current status is one of
    /// `update.status.allowed_predecessors()`. Returns whether it applied.
    async fn transition_status(&self, id: Uuid, update: StatusUpdate)
        -> Result<bool, StoreError>;

    async fn record_attempt(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Subscribers in any of `statuses`, least recently attempted first.
    async fn find_by_statuses(
        &self,
        statuses: &[SubscriberStatus],
        limit: i64,
    ) -> Result<Vec<Subscriber>, StoreError>;
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("A subscriber with this email already exists.")]
    UniqueViolation,
    #[error("Failed to execute a database query.")]
    Database(#[source] sqlx::Error),
    #[error("A stored subscriber is not valid: {0}")]
    Corrupted(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_unique_violation(&err) {
            return StoreError::UniqueViolation;
        }

        StoreError::Database(err)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
