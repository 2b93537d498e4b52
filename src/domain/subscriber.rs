use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::subscriber_email::SubscriberEmail;
use crate::domain::subscriber_name::SubscriberName;
use crate::domain::subscriber_status::SubscriberStatus;

#[derive(Debug, Clone, serde::Serialize)]
pub struct Subscriber {
    pub id: Uuid,
    pub email: SubscriberEmail,
    pub name: SubscriberName,
    pub status: SubscriberStatus,
    pub last_error_message: Option<String>,
    pub subscription_date: DateTime<Utc>,
    pub email_sent_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// A status change together with the delivery fields that travel with it.
///
/// Applying it only succeeds while the subscriber is in one of
/// `status.allowed_predecessors()`. `last_error_message` is cleared by every
/// update that does not carry one.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: SubscriberStatus,
    pub last_error_message: Option<String>,
    pub email_sent_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn to(status: SubscriberStatus) -> Self {
        Self {
            status,
            last_error_message: None,
            email_sent_at: None,
            last_attempt_at: None,
        }
    }

    pub fn sent(at: DateTime<Utc>) -> Self {
        Self {
            email_sent_at: Some(at),
            last_attempt_at: Some(at),
            ..Self::to(SubscriberStatus::Sent)
        }
    }

    pub fn failed(error: impl Into<String>, attempted_at: Option<DateTime<Utc>>) -> Self {
        Self {
            last_error_message: Some(error.into()),
            last_attempt_at: attempted_at,
            ..Self::to(SubscriberStatus::Failed)
        }
    }

    /// Writes the update onto an in-memory copy, mirroring what stores persist.
    /// Re-applying `sent` to a sent subscriber changes nothing.
    pub fn apply_to(&self, subscriber: &mut Subscriber) {
        if subscriber.status.is_sent() && self.status.is_sent() {
            return;
        }
        subscriber.status = self.status;
        subscriber.last_error_message = self.last_error_message.clone();
        if self.email_sent_at.is_some() {
            subscriber.email_sent_at = self.email_sent_at;
        }
        if self.last_attempt_at.is_some() {
            subscriber.last_attempt_at = self.last_attempt_at;
        }
    }
}
