use chrono::Utc;
use std::sync::Arc;

use crate::helpers::{new_subscriber, TestDatabase};
use newsletter_service::domain::subscriber::StatusUpdate;
use newsletter_service::domain::subscriber_status::SubscriberStatus;
use newsletter_service::store::{StoreError, SubscriberStore};

#[tokio::test]
async fn concurrent_inserts_of_one_email_store_a_single_subscriber() {
    let database = TestDatabase::new().await;
    let store = Arc::new(database.store());

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.insert(&new_subscriber("ada@example.com")).await })
        })
        .collect();

    let mut inserted = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => inserted += 1,
            Err(StoreError::UniqueViolation) => duplicates += 1,
            Err(err) => panic!("unexpected error: {:?}", err),
        }
    }

    assert_eq!(inserted, 1);
    assert_eq!(duplicates, 9);
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscribers")
        .fetch_one(&database.pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn transition_is_rejected_outside_the_allowed_predecessors() {
    let database = TestDatabase::new().await;
    let store = database.store();
    let subscriber = store.insert(&new_subscriber("ada@example.com")).await.unwrap();
    assert_eq!(subscriber.status, SubscriberStatus::Pending);

    let pending_to_sent = store
        .transition_status(subscriber.id, StatusUpdate::sent(Utc::now()))
        .await
        .unwrap();
    let pending_to_queued = store
        .transition_status(subscriber.id, StatusUpdate::to(SubscriberStatus::Queued))
        .await
        .unwrap();
    let queued_to_queued = store
        .transition_status(subscriber.id, StatusUpdate::to(SubscriberStatus::Queued))
        .await
        .unwrap();

    assert!(!pending_to_sent);
    assert!(pending_to_queued);
    assert!(!queued_to_queued);
    let stored = store.find_by_id(subscriber.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SubscriberStatus::Queued);
}

#[tokio::test]
async fn failed_error_message_is_stored_and_cleared_on_requeue() {
    let database = TestDatabase::new().await;
    let store = database.store();
    let subscriber = store.insert(&new_subscriber("ada@example.com")).await.unwrap();
    let queued = StatusUpdate::to(SubscriberStatus::Queued);

    store.transition_status(subscriber.id, queued.clone()).await.unwrap();
    store
        .transition_status(subscriber.id, StatusUpdate::failed("mailbox unavailable", Some(Utc::now())))
        .await
        .unwrap();
    let failed = store.find_by_id(subscriber.id).await.unwrap().unwrap();
    store.transition_status(subscriber.id, queued).await.unwrap();
    let requeued = store.find_by_id(subscriber.id).await.unwrap().unwrap();

    assert_eq!(failed.status, SubscriberStatus::Failed);
    assert_eq!(failed.last_error_message.as_deref(), Some("mailbox unavailable"));
    assert!(failed.last_attempt_at.is_some());
    assert_eq!(requeued.last_error_message, None);
    assert_eq!(requeued.last_attempt_at, failed.last_attempt_at);
}

#[tokio::test]
async fn sending_again_keeps_the_first_delivery_time() {
    let database = TestDatabase::new().await;
    let store = database.store();
    let subscriber = store.insert(&new_subscriber("ada@example.com")).await.unwrap();
    store
        .transition_status(subscriber.id, StatusUpdate::to(SubscriberStatus::Queued))
        .await
        .unwrap();
    store
        .transition_status(subscriber.id, StatusUpdate::sent(Utc::now() - chrono::Duration::minutes(5)))
        .await
        .unwrap();
    let first = store.find_by_id(subscriber.id).await.unwrap().unwrap();

    let resent = store
        .transition_status(subscriber.id, StatusUpdate::sent(Utc::now()))
        .await
        .unwrap();

    assert!(resent);
    let second = store.find_by_id(subscriber.id).await.unwrap().unwrap();
    assert_eq!(second.status, SubscriberStatus::Sent);
    assert_eq!(second.email_sent_at, first.email_sent_at);
    assert_eq!(second.last_attempt_at, first.last_attempt_at);
}

#[tokio::test]
async fn retry_candidates_are_never_attempted_first() {
    let database = TestDatabase::new().await;
    let store = database.store();

    let attempted = store.insert(&new_subscriber("ada@example.com")).await.unwrap();
    store
        .transition_status(attempted.id, StatusUpdate::to(SubscriberStatus::Queued))
        .await
        .unwrap();
    store
        .transition_status(attempted.id, StatusUpdate::failed("mailbox unavailable", Some(Utc::now())))
        .await
        .unwrap();

    let deferred = store.insert(&new_subscriber("bob@example.com")).await.unwrap();
    store
        .transition_status(deferred.id, StatusUpdate::to(SubscriberStatus::PendingRetry))
        .await
        .unwrap();

    let never_queued = store.insert(&new_subscriber("eve@example.com")).await.unwrap();
    store
        .transition_status(never_queued.id, StatusUpdate::to(SubscriberStatus::Queued))
        .await
        .unwrap();
    store
        .transition_status(never_queued.id, StatusUpdate::failed("queue unavailable", None))
        .await
        .unwrap();

    store.insert(&new_subscriber("pending@example.com")).await.unwrap();

    let statuses = [SubscriberStatus::Failed, SubscriberStatus::PendingRetry];
    let all: Vec<_> = store
        .find_by_statuses(&statuses, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|subscriber| subscriber.id)
        .collect();
    let first_two: Vec<_> = store
        .find_by_statuses(&statuses, 2)
        .await
        .unwrap()
        .into_iter()
        .map(|subscriber| subscriber.id)
        .collect();

    assert_eq!(all, vec![deferred.id, never_queued.id, attempted.id]);
    assert_eq!(first_two, vec![deferred.id, never_queued.id]);
}
