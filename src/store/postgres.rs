use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use super::{StoreError, SubscriberStore};
use crate::domain::{
    new_subscriber::NewSubscriber,
    subscriber::{StatusUpdate, Subscriber},
    subscriber_email::SubscriberEmail,
    subscriber_name::SubscriberName,
    subscriber_status::SubscriberStatus,
};

const SUBSCRIBER_COLUMNS: &str = "id, email, name, status, last_error_message, subscription_date, \
     email_sent_at, last_attempt_at, ip_address, user_agent";

pub struct PgSubscriberStore {
    db_pool: PgPool,
}

impl PgSubscriberStore {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl SubscriberStore for PgSubscriberStore {
    #[tracing::instrument(name = "Find a subscriber by email", skip(self))]
    async fn find_by_email(
        &self,
        email: &SubscriberEmail,
    ) -> Result<Option<Subscriber>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscribers WHERE email = $1",
            SUBSCRIBER_COLUMNS
        ))
        .bind(email.as_ref())
        .fetch_optional(&self.db_pool)
        .await?;

        row.as_ref().map(subscriber_from_row).transpose()
    }

    #[tracing::instrument(name = "Find a subscriber by id", skip(self))]
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Subscriber>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscribers WHERE id = $1",
            SUBSCRIBER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db_pool)
        .await?;

        row.as_ref().map(subscriber_from_row).transpose()
    }

    #[tracing::instrument(
        name = "Insert a new subscriber into the database",
        skip(self, new_subscriber),
        fields(subscriber_email = %new_subscriber.email)
    )]
    async fn insert(&self, new_subscriber: &NewSubscriber) -> Result<Subscriber, StoreError> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO subscribers (id, email, name, status, subscription_date, ip_address, user_agent, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $5)
            RETURNING {}
            "#,
            SUBSCRIBER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(new_subscriber.email.as_ref())
        .bind(new_subscriber.name.as_ref())
        .bind(SubscriberStatus::Pending.as_ref())
        .bind(now)
        .bind(new_subscriber.metadata.ip_address.as_deref())
        .bind(new_subscriber.metadata.user_agent.as_deref())
        .fetch_one(&self.db_pool)
        .await
        .map_err(|err| {
            let err = StoreError::from(err);
            if !matches!(err, StoreError::UniqueViolation) {
                tracing::error!("Failed to execute query: {:?}", err);
            }
            err
        })?;

        subscriber_from_row(&row)
    }

    #[tracing::instrument(
        name = "Transition a subscriber status",
        skip(self, update),
        fields(status = %update.status.as_ref())
    )]
    async fn transition_status(
        &self,
        id: Uuid,
        update: StatusUpdate,
    ) -> Result<bool, StoreError> {
        let predecessors: Vec<String> = update
            .status
            .allowed_predecessors()
            .iter()
            .map(|status| status.as_ref().to_string())
            .collect();

        let result = sqlx::query(
            r#"
            UPDATE subscribers
            SET status = $2,
                last_error_message = $3,
                email_sent_at = CASE WHEN status = 'sent' THEN email_sent_at
                    ELSE COALESCE($4, email_sent_at) END,
                last_attempt_at = CASE WHEN status = 'sent' THEN last_attempt_at
                    ELSE COALESCE($5, last_attempt_at) END,
                updated_at = now()
            WHERE id = $1 AND status = ANY($6)
            "#,
        )
        .bind(id)
        .bind(update.status.as_ref())
        .bind(update.last_error_message.as_deref())
        .bind(update.email_sent_at)
        .bind(update.last_attempt_at)
        .bind(predecessors)
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(name = "Record a delivery attempt", skip(self))]
    async fn record_attempt(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE subscribers SET last_attempt_at = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(name = "Find subscribers by status", skip(self, statuses))]
    async fn find_by_statuses(
        &self,
        statuses: &[SubscriberStatus],
        limit: i64,
    ) -> Result<Vec<Subscriber>, StoreError> {
        let statuses: Vec<String> = statuses
            .iter()
            .map(|status| status.as_ref().to_string())
            .collect();

        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM subscribers
            WHERE status = ANY($1)
            ORDER BY last_attempt_at ASC NULLS FIRST, subscription_date ASC
            LIMIT $2
            "#,
            SUBSCRIBER_COLUMNS
        ))
        .bind(statuses)
        .bind(limit)
        .fetch_all(&self.db_pool)
        .await?;

        rows.iter().map(subscriber_from_row).collect()
    }
}

fn subscriber_from_row(row: &PgRow) -> Result<Subscriber, StoreError> {
    Ok(Subscriber {
        id: row.try_get("id")?,
        email: SubscriberEmail::parse(row.try_get("email")?).map_err(StoreError::Corrupted)?,
        name: SubscriberName::parse(row.try_get("name")?).map_err(StoreError::Corrupted)?,
        status: SubscriberStatus::parse(row.try_get("status")?).map_err(StoreError::Corrupted)?,
        last_error_message: row.try_get("last_error_message")?,
        subscription_date: row.try_get("subscription_date")?,
        email_sent_at: row.try_get("email_sent_at")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
    })
}
