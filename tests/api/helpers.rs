use once_cell::sync::Lazy;
use reqwest::Response;
use std::collections::HashMap;
use std::sync::Arc;
use wiremock::MockServer;

use newsletter_service::{
    config::get_configuration,
    queue::InMemoryJobQueue,
    startup::{Application, Backends},
    store::InMemorySubscriberStore,
    telemetry::{get_subscriber, init_subscriber},
    worker::{ExecutionOutcome, QueueWorker},
};

// Logs are only printed when TEST_LOG is set, e.g. `TEST_LOG=true cargo test`
static TRACING: Lazy<()> = Lazy::new(|| {
    let default_filter_level = "info".to_string();
    let subscriber_name = "test".to_string();

    if std::env::var("TEST_LOG").is_ok() {
        let subscriber = get_subscriber(subscriber_name, default_filter_level, std::io::stdout);
        init_subscriber(subscriber).expect("Failed to initialize tracing.");
    } else {
        let subscriber = get_subscriber(subscriber_name, default_filter_level, std::io::sink);
        init_subscriber(subscriber).expect("Failed to initialize tracing.");
    }
});

pub struct TestApp {
    pub address: String,
    pub email_server: MockServer,
    pub store: Arc<InMemorySubscriberStore>,
    pub queue: Arc<InMemoryJobQueue>,
    pub worker: QueueWorker,
    api_client: reqwest::Client,
}

impl TestApp {
    pub async fn spawn_app() -> TestApp {
        Lazy::force(&TRACING);

        let mut config = get_configuration().expect("Missing configuration file.");
        let email_server = MockServer::start().await;

        // Port 0 makes the OS pick a free port, so tests can run in parallel
        config.set_app_port(0);
        config.set_email_client_base_url(email_server.uri());
        // Retries are due immediately so a test can drain the queue
        config.queue.backoff_base_milliseconds = 0;

        let store = Arc::new(InMemorySubscriberStore::new());
        let queue = Arc::new(InMemoryJobQueue::new(config.queue.get_stall_timeout()));
        let backends = Backends {
            store: store.clone(),
            queue: queue.clone(),
        };

        let application = Application::build_with_backends(config, backends)
            .expect("Failed to build application.");
        let address = format!("http://127.0.0.1:{}", application.get_port());

        tokio::spawn(application.server);

        TestApp {
            address,
            email_server,
            store,
            queue,
            worker: application.worker,
            api_client: reqwest::Client::new(),
        }
    }

    pub async fn post_subscription(&self, body: HashMap<&str, &str>) -> Response {
        self.api_client
            .post(&format!("{}/subscriptions", self.address))
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request.")
    }

    pub async fn get_queue_status(&self) -> Response {
        self.api_client
            .get(&format!("{}/admin/queue/status", self.address))
            .send()
            .await
            .expect("Failed to execute request.")
    }

    pub async fn post_retry_deliveries(&self) -> Response {
        self.api_client
            .post(&format!("{}/admin/deliveries/retry", self.address))
            .send()
            .await
            .expect("Failed to execute request.")
    }

    /// Runs the worker until no job is due.
    pub async fn dispatch_all_pending_emails(&self) {
        loop {
            if let ExecutionOutcome::EmptyQueue = self
                .worker
                .try_execute_task()
                .await
                .expect("Failed to execute a queue task.")
            {
                break;
            }
        }
    }
}

pub fn subscription_body<'a>(name: &'a str, email: &'a str) -> HashMap<&'a str, &'a str> {
    HashMap::from([("name", name), ("email", email)])
}
