use http::header::{HeaderMap, HeaderValue, USER_AGENT};
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

pub mod auth;
pub mod clients;
pub mod config;
pub mod dps;
pub mod events;
pub mod maps;
pub mod models;
pub mod server;
pub mod signalr;
pub mod telemetry;
pub mod twins;

pub type Error = Box<dyn std::error::Error + Send + Sync>;

pub fn set_up_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .init();
}

/// HTTP client shared by every outbound call.
pub fn http_client(config: &Config) -> Result<reqwest::Client, Error> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION"),
        )),
    );

    let client = reqwest::Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(config.http_timeout))
        .build()?;
    Ok(client)
}
