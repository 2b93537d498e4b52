use actix_web::dev::Server;
use actix_web::http::StatusCode;
use actix_web::{error, web, App, HttpServer};
use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::net::TcpListener;
use std::sync::Arc;
use tracing_actix_web::TracingLogger;

use crate::config::Settings;
use crate::dispatcher::{EmailDispatcher, WelcomeEmailDispatcher};
use crate::email_client::EmailClient;
use crate::queue::{JobQueue, RedisJobQueue, TracingObserver};
use crate::retry_sweep::RetrySweeper;
use crate::routes::{
    error_response, handle_create_subscription, health_check, queue_status, retry_deliveries,
    RetryBatchSize,
};
use crate::store::{PgSubscriberStore, SubscriberStore};
use crate::subscription_service::SubscriptionService;
use crate::worker::QueueWorker;

/// Storage and queue backends shared by the API, the worker and the sweeper.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn SubscriberStore>,
    pub queue: Arc<dyn JobQueue>,
}

impl Backends {
    /// Postgres store (migrated on connect) and Redis queue.
    pub async fn connect(config: &Settings) -> Result<Self, anyhow::Error> {
        let db_pool = PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_secs(2))
            .connect_lazy_with(config.get_db_options());
        sqlx::migrate!("./migrations")
            .run(&db_pool)
            .await
            .context("Failed to run database migrations.")?;

        let redis_client = redis::Client::open(config.get_redis_address())
            .context("Invalid Redis address.")?;
        let queue = RedisJobQueue::new(
            redis_client,
            &config.get_queue_namespace(),
            config.queue.get_stall_timeout(),
            config.queue.get_operation_timeout(),
        )
        .with_observer(Arc::new(TracingObserver));

        Ok(Self {
            store: Arc::new(PgSubscriberStore::new(db_pool)),
            queue: Arc::new(queue),
        })
    }
}

/// The HTTP server plus the background tasks of one process.
pub struct Application {
    pub port: u16,
    pub server: Server,
    pub worker: QueueWorker,
    pub sweeper: RetrySweeper,
}

impl Application {
    pub async fn build(config: Settings) -> Result<Self, anyhow::Error> {
        let backends = Backends::connect(&config).await?;

        Self::build_with_backends(config, backends)
    }

    pub fn build_with_backends(config: Settings, backends: Backends) -> Result<Self, anyhow::Error> {
        let sender_email = config
            .get_email_client_sender()
            .map_err(anyhow::Error::msg)
            .context("Sender email is not valid.")?;
        let email_client = EmailClient::new(
            config.get_email_client_base_url(),
            sender_email,
            config.get_email_client_api(),
            Some(config.get_email_client_timeout()),
        )?;
        let dispatcher: Arc<dyn EmailDispatcher> =
            Arc::new(WelcomeEmailDispatcher::new(email_client));

        let service = Arc::new(SubscriptionService::new(
            backends.store.clone(),
            backends.queue.clone(),
            config.queue.get_job_options(),
        ));
        let worker = QueueWorker::new(
            backends.queue.clone(),
            backends.store.clone(),
            dispatcher,
            config.queue.get_poll_interval(),
        );
        let sweeper = RetrySweeper::new(
            service.clone(),
            backends.queue.clone(),
            config.queue.get_retry_sweep_interval(),
            config.queue.retry_sweep_batch_size,
            config.queue.get_retention(),
        );

        let listener = TcpListener::bind(config.get_address())
            .with_context(|| format!("Failed to bind {}.", config.get_address()))?;
        let port = listener.local_addr()?.port();
        let server = run(
            listener,
            service,
            backends.queue,
            config.queue.retry_sweep_batch_size,
        )?;

        Ok(Self {
            port,
            server,
            worker,
            sweeper,
        })
    }

    pub fn get_port(&self) -> u16 {
        self.port
    }
}

pub fn run(
    listener: TcpListener,
    service: Arc<SubscriptionService>,
    queue: Arc<dyn JobQueue>,
    retry_batch_size: i64,
) -> Result<Server, std::io::Error> {
    let service = web::Data::from(service);
    let queue: web::Data<dyn JobQueue> = web::Data::from(queue);
    let retry_batch_size = web::Data::new(RetryBatchSize(retry_batch_size));

    let server = HttpServer::new(move || {
        App::new()
            // Logs every incoming request with its own span
            .wrap(TracingLogger::default())
            .app_data(web::JsonConfig::default().error_handler(|err, _req| {
                let response = error_response(StatusCode::BAD_REQUEST, &err.to_string());
                error::InternalError::from_response(err, response).into()
            }))
            .route("/health_check", web::get().to(health_check))
            .route("/subscriptions", web::post().to(handle_create_subscription))
            .route("/admin/queue/status", web::get().to(queue_status))
            .route("/admin/deliveries/retry", web::post().to(retry_deliveries))
            .app_data(service.clone())
            .app_data(queue.clone())
            .app_data(retry_batch_size.clone())
    })
    .listen(listener)?
    .run();

    Ok(server)
}
