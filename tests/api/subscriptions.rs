use std::collections::HashMap;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::helpers::{subscription_body, TestApp};
use newsletter_service::domain::subscriber_status::SubscriberStatus;

async fn mount_mail_api(test_app: &TestApp, status: u16) {
    Mock::given(path("/mail/send"))
        .and(method("POST"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&test_app.email_server)
        .await;
}

#[tokio::test]
async fn subscribe_returns_201_when_body_is_valid() {
    let test_app = TestApp::spawn_app().await;

    let response = test_app
        .post_subscription(subscription_body("Frank", "frank@test.com"))
        .await;

    assert_eq!(201, response.status().as_u16());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Thank you for subscribing!");
    assert_eq!(body["data"]["email"], "frank@test.com");
    assert_eq!(body["data"]["name"], "Frank");
    assert_eq!(body["data"]["status"], "queued");
}

#[tokio::test]
async fn subscribe_persists_the_new_subscriber_with_normalized_email() {
    let test_app = TestApp::spawn_app().await;

    test_app
        .post_subscription(subscription_body("Bob", "  Bob@Example.com "))
        .await;

    let subscribers = test_app.store.all().await;
    assert_eq!(subscribers.len(), 1);
    assert_eq!(subscribers[0].email.as_ref(), "bob@example.com");
    assert_eq!(subscribers[0].name.as_ref(), "Bob");
    assert_eq!(subscribers[0].status, SubscriberStatus::Queued);
}

#[tokio::test]
async fn subscribe_returns_400_when_body_require_field_is_missing() {
    let test_app = TestApp::spawn_app().await;

    let test_cases: Vec<(HashMap<&str, &str>, &str)> = vec![
        (HashMap::from([]), "missing body parameters"),
        (HashMap::from([("name", "Frank")]), "missing email parameter"),
        (
            HashMap::from([("email", "frank@test.com")]),
            "missing name parameter",
        ),
    ];

    for (invalid_body, error_message) in test_cases {
        let response = test_app.post_subscription(invalid_body).await;

        assert_eq!(
            400,
            response.status().as_u16(),
            "The API did not fail with 400 status when payload was {}",
            error_message
        );
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["success"], false);
    }
}

#[tokio::test]
async fn subscribe_returns_400_when_body_is_present_but_not_valid() {
    let test_app = TestApp::spawn_app().await;

    let test_cases: Vec<(HashMap<&str, &str>, &str)> = vec![
        (subscription_body("", "test@test.com"), "empty name"),
        (subscription_body("{Frank}", "test@test.com"), "invalid name"),
        (subscription_body("Frank", "test.com"), "invalid email"),
        (subscription_body("Frank", "frank@localhost"), "email without a dotted domain"),
    ];

    for (invalid_body, error_message) in test_cases {
        let response = test_app.post_subscription(invalid_body).await;

        assert_eq!(
            400,
            response.status().as_u16(),
            "The API did not fail with 400 status when payload was {}",
            error_message
        );
    }
    assert!(test_app.store.all().await.is_empty());
}

#[tokio::test]
async fn subscribing_twice_returns_400_and_keeps_one_record() {
    let test_app = TestApp::spawn_app().await;

    let first = test_app
        .post_subscription(subscription_body("Ada", "ada@example.com"))
        .await;
    let second = test_app
        .post_subscription(subscription_body("Ada", "ADA@example.com"))
        .await;

    assert_eq!(201, first.status().as_u16());
    assert_eq!(400, second.status().as_u16());
    let body: serde_json::Value = second.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(test_app.store.all().await.len(), 1);
}

#[tokio::test]
async fn welcome_email_is_delivered_by_the_worker() {
    let test_app = TestApp::spawn_app().await;
    Mock::given(path("/mail/send"))
        .and(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&test_app.email_server)
        .await;

    test_app
        .post_subscription(subscription_body("Ada", "ada@example.com"))
        .await;
    test_app.dispatch_all_pending_emails().await;

    let subscriber = &test_app.store.all().await[0];
    assert_eq!(subscriber.status, SubscriberStatus::Sent);
    assert!(subscriber.email_sent_at.is_some());

    let received_requests = test_app.email_server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&received_requests[0].body).unwrap();
    assert_eq!(body["subject"], "Welcome to Our Newsletter!");
    assert_eq!(body["personalizations"][0]["to"][0]["email"], "ada@example.com");
}

#[tokio::test]
async fn welcome_email_fails_after_five_attempts() {
    let test_app = TestApp::spawn_app().await;
    Mock::given(path("/mail/send"))
        .and(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(5)
        .mount(&test_app.email_server)
        .await;

    test_app
        .post_subscription(subscription_body("Ada", "ada@example.com"))
        .await;
    test_app.dispatch_all_pending_emails().await;

    let subscriber = &test_app.store.all().await[0];
    assert_eq!(subscriber.status, SubscriberStatus::Failed);
    assert!(subscriber.last_error_message.is_some());
}

#[tokio::test]
async fn resubscribing_after_a_failed_delivery_sends_a_fresh_welcome_email() {
    let test_app = TestApp::spawn_app().await;
    mount_mail_api(&test_app, 500).await;
    test_app
        .post_subscription(subscription_body("Ada", "ada@example.com"))
        .await;
    test_app.dispatch_all_pending_emails().await;
    test_app.email_server.reset().await;
    mount_mail_api(&test_app, 200).await;

    let response = test_app
        .post_subscription(subscription_body("Ada", "ada@example.com"))
        .await;
    test_app.dispatch_all_pending_emails().await;

    assert_eq!(201, response.status().as_u16());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(
        body["message"],
        "You're already subscribed! We're sending you a fresh welcome email."
    );
    assert_eq!(test_app.store.all().await[0].status, SubscriberStatus::Sent);
}

#[tokio::test]
async fn subscribe_is_accepted_while_the_queue_is_unavailable() {
    let test_app = TestApp::spawn_app().await;
    test_app.queue.set_healthy(false);

    let response = test_app
        .post_subscription(subscription_body("Ada", "ada@example.com"))
        .await;

    assert_eq!(201, response.status().as_u16());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(
        body["message"],
        "Thank you for subscribing! Your welcome email will be sent shortly."
    );
    assert_eq!(body["data"]["status"], "pending_retry");
    assert!(test_app.queue.jobs().await.is_empty());
}

#[tokio::test]
async fn subscribe_is_accepted_when_the_enqueue_fails() {
    let test_app = TestApp::spawn_app().await;
    test_app.queue.set_reject_enqueues(true);

    let response = test_app
        .post_subscription(subscription_body("Ada", "ada@example.com"))
        .await;

    assert_eq!(201, response.status().as_u16());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["data"]["status"], "failed");
}
