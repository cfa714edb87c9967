//! HTTP clients for the two upstream services: the time-series store
//! (line-protocol writes, Flux queries over annotated CSV) and the
//! headless capture worker.

mod annotated;
pub mod capture;
pub mod flux;
mod store;

use std::time::Duration;

pub use capture::{CaptureGateway, CaptureResult, CaptureSpec};
pub use store::StoreGateway;

/// Errors surfaced by foreground store/worker calls. The serve layer maps
/// every variant to a 502.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unreadable upstream response: {0}")]
    Decode(String),
    #[error("capture worker reported failure: {0}")]
    Rejected(String),
}

/// Connection settings for the time-series store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env_url("PULSE_STORE_URL", "http://127.0.0.1:8086"),
            org: env_or("PULSE_STORE_ORG", "pulse"),
            bucket: env_or("PULSE_STORE_BUCKET", "pulse"),
            token: env_or("PULSE_STORE_TOKEN", ""),
        }
    }
}

/// Connection settings for the capture worker.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub worker_url: String,
    pub timeout: Duration,
}

impl CaptureConfig {
    pub fn from_env() -> Self {
        let secs = std::env::var("PULSE_CAPTURE_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(45);
        Self {
            worker_url: env_url("PULSE_CAPTURE_URL", "http://127.0.0.1:9230"),
            timeout: Duration::from_secs(secs.max(1)),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_url(key: &str, default: &str) -> String {
    env_or(key, default).trim_end_matches('/').to_string()
}
