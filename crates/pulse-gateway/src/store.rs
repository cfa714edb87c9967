use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder};
use tracing::{debug, warn};

use crate::{annotated, GatewayError, StoreConfig};

/// Client for the time-series store. Writes are fire-and-forget; queries
/// surface [`GatewayError`] so callers choose between foreground failure
/// and background degradation.
#[derive(Debug, Clone)]
pub struct StoreGateway {
    write_client: Client,
    query_client: Client,
    config: StoreConfig,
}

impl StoreGateway {
    pub fn new(config: StoreConfig) -> Result<Self, GatewayError> {
        let write_client = Client::builder()
            .timeout(Duration::from_secs(5))
            .connect_timeout(Duration::from_secs(2))
            .build()?;
        let query_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(3))
            .build()?;
        Ok(Self {
            write_client,
            query_client,
            config,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if self.config.token.is_empty() {
            request
        } else {
            request.header(AUTHORIZATION, format!("Token {}", self.config.token))
        }
    }

    /// Write one or more line-protocol statements. Failures are logged and
    /// swallowed; ingest must never observe store trouble.
    pub async fn write_lines(&self, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        let body = lines.join("\n");
        let url = format!("{}/api/v2/write", self.config.base_url);
        let request = self
            .write_client
            .post(&url)
            .query(&[
                ("org", self.config.org.as_str()),
                ("bucket", self.config.bucket.as_str()),
                ("precision", "ms"),
            ])
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
        match self.authorize(request).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(count = lines.len(), "wrote analytics statements");
            }
            Ok(response) => {
                warn!(status = %response.status(), "store rejected analytics write");
            }
            Err(err) => {
                warn!(%err, "store write failed");
            }
        }
    }

    pub async fn write_line(&self, line: &str) {
        let lines = [line.to_string()];
        self.write_lines(&lines).await;
    }

    /// Run a Flux query and parse the annotated-CSV response into rows.
    pub async fn query(&self, flux: &str) -> Result<Vec<HashMap<String, String>>, GatewayError> {
        let url = format!("{}/api/v2/query", self.config.base_url);
        let request = self
            .query_client
            .post(&url)
            .query(&[("org", self.config.org.as_str())])
            .header(CONTENT_TYPE, "application/vnd.flux")
            .header(ACCEPT, "application/csv")
            .body(flux.to_string());
        let response = self.authorize(request).send().await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| GatewayError::Decode(err.to_string()))?;
        if !status.is_success() {
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body: body.chars().take(256).collect(),
            });
        }
        Ok(annotated::parse_rows(&body))
    }

    /// Background variant: a failed query degrades to no rows.
    pub async fn query_or_empty(&self, flux: &str) -> Vec<HashMap<String, String>> {
        match self.query(flux).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(%err, "store query failed, serving empty result");
                Vec::new()
            }
        }
    }
}
