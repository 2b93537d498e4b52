mod admin;
mod health_check;
mod subscriptions;

pub use admin::*;
pub use health_check::*;
pub use subscriptions::*;

use actix_web::HttpResponse;

/// Body of every error response.
#[derive(serde::Serialize)]
pub struct ErrorBody<'a> {
    pub success: bool,
    pub message: &'a str,
}

pub fn error_response(status: actix_web::http::StatusCode, message: &str) -> HttpResponse {
    HttpResponse::build(status).json(ErrorBody {
        success: false,
        message,
    })
}

pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{}", cause)?;
        current = cause.source();
    }
    Ok(())
}
