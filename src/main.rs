use std::fmt::{Debug, Display};
use tokio::task::JoinError;

use newsletter_service::config::get_configuration;
use newsletter_service::startup::Application;
use newsletter_service::telemetry::{get_subscriber, init_subscriber};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = get_subscriber(
        String::from("newsletter_service"),
        String::from("info"),
        std::io::stdout,
    );
    init_subscriber(subscriber)?;

    let config = get_configuration()?;
    let application = Application::build(config.clone()).await?;

    tracing::info!("Server listening on {}", config.get_address());

    let api_task = tokio::spawn(application.server);
    let worker_task = tokio::spawn(application.worker.run_until_stopped());
    let sweeper_task = tokio::spawn(application.sweeper.run_until_stopped());

    tokio::select! {
        outcome = api_task => report_exit("API", outcome),
        outcome = worker_task => report_exit("Queue worker", outcome),
        outcome = sweeper_task => report_exit("Retry sweeper", outcome),
    };

    Ok(())
}

fn report_exit(task_name: &str, outcome: Result<Result<(), impl Debug + Display>, JoinError>) {
    match outcome {
        Ok(Ok(())) => {
            tracing::info!("{} has exited", task_name)
        }
        Ok(Err(e)) => {
            tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "{} failed",
                task_name
            )
        }
        Err(e) => {
            tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "{} task failed to complete",
                task_name
            )
        }
    }
}
