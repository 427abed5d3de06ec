pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod flow;
pub mod http_client;
pub mod model;
pub mod stream;
pub mod telemetry;
pub mod validate;
