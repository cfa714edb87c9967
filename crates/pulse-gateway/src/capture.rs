use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{CaptureConfig, GatewayError};

pub const DEFAULT_VIEWPORT_WIDTH: i64 = 1440;
pub const DEFAULT_VIEWPORT_HEIGHT: i64 = 900;
pub const DEFAULT_DEVICE_SCALE: f64 = 1.0;

/// One capture job: target URL, cache-relative output path, viewport.
#[derive(Debug, Clone)]
pub struct CaptureSpec {
    pub url: String,
    pub output: String,
    pub width: i64,
    pub height: i64,
    pub device_scale_factor: f64,
}

impl CaptureSpec {
    pub fn new(url: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            output: output.into(),
            width: DEFAULT_VIEWPORT_WIDTH,
            height: DEFAULT_VIEWPORT_HEIGHT,
            device_scale_factor: DEFAULT_DEVICE_SCALE,
        }
    }
}

#[derive(Serialize)]
struct CaptureJob<'a> {
    url: &'a str,
    output: &'a str,
    #[serde(rename = "fullPage")]
    full_page: bool,
    viewport: ViewportJob,
}

#[derive(Serialize)]
struct ViewportJob {
    width: i64,
    height: i64,
    #[serde(rename = "deviceScaleFactor")]
    device_scale_factor: f64,
}

/// Worker response. Every field beyond `ok` is optional; callers fill in
/// defaults from the requested viewport.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureResult {
    #[serde(default)]
    pub ok: bool,
    pub captured_at: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub bytes: Option<u64>,
    pub duration_ms: Option<f64>,
    pub format: Option<String>,
    pub sha256: Option<String>,
    pub error: Option<String>,
}

/// Client for the headless capture worker. One pooled connection, no
/// retries: a capture is expensive and the caller reports failure.
#[derive(Debug, Clone)]
pub struct CaptureGateway {
    client: Client,
    config: CaptureConfig,
}

impl CaptureGateway {
    pub fn new(config: CaptureConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client, config })
    }

    pub async fn capture(&self, spec: &CaptureSpec) -> Result<CaptureResult, GatewayError> {
        let url = format!("{}/capture", self.config.worker_url);
        let job = CaptureJob {
            url: &spec.url,
            output: &spec.output,
            full_page: true,
            viewport: ViewportJob {
                width: spec.width,
                height: spec.height,
                device_scale_factor: spec.device_scale_factor,
            },
        };
        let response = self.client.post(&url).json(&job).send().await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| GatewayError::Decode(err.to_string()))?;
        if !status.is_success() {
            warn!(status = %status, "capture worker rejected job");
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body: body.chars().take(256).collect(),
            });
        }
        let result: CaptureResult =
            serde_json::from_str(&body).map_err(|err| GatewayError::Decode(err.to_string()))?;
        if !result.ok {
            let reason = result
                .error
                .unwrap_or_else(|| "capture failed".to_string());
            return Err(GatewayError::Rejected(reason));
        }
        Ok(result)
    }
}
