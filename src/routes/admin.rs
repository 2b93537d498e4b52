use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, ResponseError};

use crate::queue::{JobQueue, QueueError};
use crate::routes::{error_chain_fmt, error_response};
use crate::store::StoreError;
use crate::subscription_service::{RetryScope, SubscriptionService};

/// Number of subscribers a manually triggered retry sweep handles.
pub struct RetryBatchSize(pub i64);

#[derive(thiserror::Error)]
pub enum AdminError {
    #[error("Failed to read the queue status.")]
    Queue(#[from] QueueError),
    #[error("Failed to retry pending deliveries.")]
    Store(#[from] StoreError),
}

impl std::fmt::Debug for AdminError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl ResponseError for AdminError {
    fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    fn error_response(&self) -> HttpResponse {
        error_response(self.status_code(), &self.to_string())
    }
}

#[derive(serde::Serialize)]
struct AdminResponse<T> {
    success: bool,
    data: T,
}

#[tracing::instrument(name = "Queue status handler", skip(queue))]
pub async fn queue_status(queue: web::Data<dyn JobQueue>) -> Result<HttpResponse, AdminError> {
    let stats = queue.stats().await?;

    Ok(HttpResponse::Ok().json(AdminResponse {
        success: true,
        data: stats,
    }))
}

/// Manual retry. Unlike the scheduled sweep it also re-queues subscribers
/// whose delivery attempts ran out.
#[tracing::instrument(name = "Retry deliveries handler", skip(service, batch_size))]
pub async fn retry_deliveries(
    service: web::Data<SubscriptionService>,
    batch_size: web::Data<RetryBatchSize>,
) -> Result<HttpResponse, AdminError> {
    let report = service
        .retry_pending_deliveries(batch_size.0, RetryScope::IncludingExhausted)
        .await?;

    Ok(HttpResponse::Ok().json(AdminResponse {
        success: true,
        data: report,
    }))
}
