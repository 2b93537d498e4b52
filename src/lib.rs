pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod email_client;
pub mod queue;
pub mod retry_sweep;
pub mod routes;
pub mod startup;
pub mod store;
pub mod subscription_service;
pub mod telemetry;
pub mod worker;
