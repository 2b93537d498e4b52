use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{StoreError, SubscriberStore};
use crate::domain::{
    new_subscriber::NewSubscriber,
    subscriber::{StatusUpdate, Subscriber},
    subscriber_email::SubscriberEmail,
    subscriber_status::SubscriberStatus,
};

/// Process-local store. The uniqueness check and the insert happen under one
/// lock, which gives the same guarantee as the unique index in Postgres.
#[derive(Default)]
pub struct InMemorySubscriberStore {
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
}

impl InMemorySubscriberStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Subscriber> {
        self.subscribers.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl SubscriberStore for InMemorySubscriberStore {
    async fn find_by_email(
        &self,
        email: &SubscriberEmail,
    ) -> Result<Option<Subscriber>, StoreError> {
        let subscribers = self.subscribers.lock().await;

        Ok(subscribers
            .values()
            .find(|subscriber| &subscriber.email == email)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Subscriber>, StoreError> {
        Ok(self.subscribers.lock().await.get(&id).cloned())
    }

    async fn insert(&self, new_subscriber: &NewSubscriber) -> Result<Subscriber, StoreError> {
        let mut subscribers = self.subscribers.lock().await;

        if subscribers
            .values()
            .any(|subscriber| subscriber.email == new_subscriber.email)
        {
            return Err(StoreError::UniqueViolation);
        }

        let subscriber = Subscriber {
            id: Uuid::new_v4(),
            email: new_subscriber.email.clone(),
            name: new_subscriber.name.clone(),
            status: SubscriberStatus::Pending,
            last_error_message: None,
            subscription_date: Utc::now(),
            email_sent_at: None,
            last_attempt_at: None,
            ip_address: new_subscriber.metadata.ip_address.clone(),
            user_agent: new_subscriber.metadata.user_agent.clone(),
        };
        subscribers.insert(subscriber.id, subscriber.clone());

        Ok(subscriber)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        update: StatusUpdate,
    ) -> Result<bool, StoreError> {
        let mut subscribers = self.subscribers.lock().await;

        match subscribers.get_mut(&id) {
            Some(subscriber) if subscriber.status.can_transition_to(update.status) => {
                update.apply_to(subscriber);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_attempt(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(subscriber) = self.subscribers.lock().await.get_mut(&id) {
            subscriber.last_attempt_at = Some(at);
        }

        Ok(())
    }

    async fn find_by_statuses(
        &self,
        statuses: &[SubscriberStatus],
        limit: i64,
    ) -> Result<Vec<Subscriber>, StoreError> {
        let subscribers = self.subscribers.lock().await;
        let mut matching: Vec<Subscriber> = subscribers
            .values()
            .filter(|subscriber| statuses.contains(&subscriber.status))
            .cloned()
            .collect();

        // None sorts before Some, like NULLS FIRST
        matching.sort_by_key(|subscriber| (subscriber.last_attempt_at, subscriber.subscription_date));
        matching.truncate(usize::try_from(limit).unwrap_or(0));

        Ok(matching)
    }
}
