use claim::{assert_none, assert_some};
use std::time::Duration;

use crate::helpers::{welcome_job, TestRedis};
use newsletter_service::queue::{FinishedState, JobQueue, QueueHealth};

#[tokio::test]
async fn enqueueing_a_known_job_id_is_reported_and_ignored() {
    let redis = TestRedis::new().await;
    let queue = redis.queue(Duration::from_secs(30));

    let first = queue.enqueue(welcome_job("welcome_1", 0)).await.unwrap();
    let second = queue.enqueue(welcome_job("welcome_1", 0)).await.unwrap();

    assert!(first);
    assert!(!second);
    assert_eq!(queue.stats().await.unwrap().waiting, 1);
    assert!(matches!(queue.health_check().await, QueueHealth::Healthy));
}

#[tokio::test]
async fn stalled_lease_is_reclaimed_and_counted_as_an_attempt() {
    let redis = TestRedis::new().await;
    let queue = redis.queue(Duration::ZERO);
    queue.enqueue(welcome_job("welcome_1", 0)).await.unwrap();

    let first = queue.claim().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = queue.claim().await.unwrap().unwrap();

    assert_eq!(first.job_id, "welcome_1");
    assert_eq!(first.attempts_made, 1);
    assert_eq!(second.job_id, "welcome_1");
    assert_eq!(second.attempts_made, 2);
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.active, 1);
    assert_eq!(stats.waiting, 0);
}

#[tokio::test]
async fn retried_job_waits_for_its_backoff_before_it_is_claimed_again() {
    let redis = TestRedis::new().await;
    let queue = redis.queue(Duration::from_secs(30));
    queue.enqueue(welcome_job("welcome_slow", 60_000)).await.unwrap();
    queue.enqueue(welcome_job("welcome_fast", 0)).await.unwrap();

    let slow = queue.claim().await.unwrap().unwrap();
    let fast = queue.claim().await.unwrap().unwrap();
    let slow_delay = queue.retry(&slow, "mailbox unavailable").await.unwrap();
    let fast_delay = queue.retry(&fast, "mailbox unavailable").await.unwrap();

    assert_eq!(slow_delay, Duration::from_secs(60));
    assert_eq!(fast_delay, Duration::ZERO);
    let promoted = queue.claim().await.unwrap().unwrap();
    assert_eq!(promoted.job_id, "welcome_fast");
    assert_eq!(promoted.attempts_made, 2);
    assert_eq!(promoted.last_error.as_deref(), Some("mailbox unavailable"));
    assert_none!(queue.claim().await.unwrap());
    assert_eq!(queue.stats().await.unwrap().delayed, 1);
}

#[tokio::test]
async fn finished_jobs_are_counted_and_cleaned() {
    let redis = TestRedis::new().await;
    let queue = redis.queue(Duration::from_secs(30));
    queue.enqueue(welcome_job("welcome_done", 0)).await.unwrap();
    queue.enqueue(welcome_job("welcome_dead", 0)).await.unwrap();

    let done = assert_some!(queue.claim().await.unwrap());
    queue.complete(&done).await.unwrap();
    let dead = assert_some!(queue.claim().await.unwrap());
    queue.fail(&dead, "mailbox unavailable").await.unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.active, 0);

    let kept = queue
        .clean(FinishedState::Completed, Duration::from_secs(3600))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let cleaned = queue
        .clean(FinishedState::Completed, Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(kept, 0);
    assert_eq!(cleaned, 1);
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn completed_job_id_can_be_enqueued_again_with_fresh_attempts() {
    let redis = TestRedis::new().await;
    let queue = redis.queue(Duration::from_secs(30));
    queue.enqueue(welcome_job("welcome_1", 0)).await.unwrap();
    let job = queue.claim().await.unwrap().unwrap();
    queue.complete(&job).await.unwrap();

    assert!(queue.enqueue(welcome_job("welcome_1", 0)).await.unwrap());
    let again = queue.claim().await.unwrap().unwrap();

    assert_eq!(again.attempts_made, 1);
}
