use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use uuid::Uuid;

use crate::domain::new_subscriber::{NewSubscriberBody, SubscriptionMetadata};
use crate::domain::subscriber_status::SubscriberStatus;
use crate::routes::{error_chain_fmt, error_response};
use crate::subscription_service::{
    SubscribeError, SubscriptionOutcome, SubscriptionResult, SubscriptionService,
};

#[derive(serde::Serialize)]
struct SubscriptionResponse {
    success: bool,
    message: &'static str,
    data: SubscriptionData,
}

#[derive(serde::Serialize)]
struct SubscriptionData {
    id: Uuid,
    name: String,
    email: String,
    status: SubscriberStatus,
}

impl From<SubscriptionResult> for SubscriptionResponse {
    fn from(result: SubscriptionResult) -> Self {
        let message = match result.outcome {
            SubscriptionOutcome::Created => "Thank you for subscribing!",
            SubscriptionOutcome::QueuedDelayed => {
                "Thank you for subscribing! Your welcome email will be sent shortly."
            }
            SubscriptionOutcome::ExistingRetry => {
                "You're already subscribed! We're sending you a fresh welcome email."
            }
        };
        let subscriber = result.subscriber;

        Self {
            success: true,
            message,
            data: SubscriptionData {
                id: subscriber.id,
                name: subscriber.name.as_ref().to_string(),
                email: subscriber.email.as_ref().to_string(),
                status: subscriber.status,
            },
        }
    }
}

impl std::fmt::Debug for SubscribeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl ResponseError for SubscribeError {
    fn status_code(&self) -> StatusCode {
        match self {
            SubscribeError::InvalidInput(_) | SubscribeError::DuplicateSubscription => {
                StatusCode::BAD_REQUEST
            }
            SubscribeError::PersistenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        error_response(self.status_code(), &self.to_string())
    }
}

#[tracing::instrument(
    name = "Creating a new subscriber handler",
    skip(request, body, service),
    fields(
        subscriber_email = %body.email,
        subscriber_name = %body.name
    )
)]
pub async fn handle_create_subscription(
    request: HttpRequest,
    body: web::Json<NewSubscriberBody>,
    service: web::Data<SubscriptionService>,
) -> Result<HttpResponse, SubscribeError> {
    let metadata = SubscriptionMetadata {
        ip_address: request
            .connection_info()
            .realip_remote_addr()
            .map(str::to_string),
        user_agent: request
            .headers()
            .get(actix_web::http::header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    };
    let NewSubscriberBody { name, email } = body.into_inner();

    let result = service.subscribe(name, email, metadata).await?;

    Ok(HttpResponse::Created().json(SubscriptionResponse::from(result)))
}
