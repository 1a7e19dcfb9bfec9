//! Upstream API fetcher
//!
//! One outbound HTTP request per cache miss. The fetcher interpolates the
//! series name into the configured endpoint template, passes the date
//! bounds (and optional static API key) as request parameters, and hands
//! back the raw JSON body for flattening. No retries live here; a failed
//! fetch is a failed invocation.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

use crate::config::{GatewayConfig, UpstreamMethod};
use crate::token::{RequestDescriptor, DATE_FORMAT};

/// Errors that can occur while fetching from the upstream API
#[derive(Debug, Error)]
pub enum FetchError {
    /// The upstream answered with a 4xx/5xx status
    #[error("Upstream rejected the request with status {status}")]
    UpstreamRejected { status: u16 },

    /// The upstream could not be reached (timeout, DNS, connect failure)
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// The response body was not the expected JSON
    #[error("Upstream returned an unreadable body: {0}")]
    InvalidBody(String),
}

/// Raw, unflattened upstream response body
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// Parsed JSON body as received
    pub body: Value,
}

/// Seam between the orchestrator and the outside world
///
/// Production uses [`HttpFetcher`]; tests substitute stubs that count
/// invocations and serve canned payloads.
#[async_trait]
pub trait UpstreamFetch: Send + Sync {
    /// Performs exactly one upstream request for the descriptor
    async fn fetch(&self, descriptor: &RequestDescriptor) -> Result<RawResponse, FetchError>;
}

/// HTTP implementation of [`UpstreamFetch`] over reqwest
pub struct HttpFetcher {
    client: Client,
    endpoint_template: String,
    api_key: Option<String>,
    method: UpstreamMethod,
}

impl HttpFetcher {
    /// Creates a fetcher from the gateway configuration
    ///
    /// The request timeout is baked into the client; on expiry the call
    /// surfaces as `FetchError::UpstreamUnreachable`.
    pub fn new(config: &GatewayConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| FetchError::UpstreamUnreachable(e.to_string()))?;

        Ok(Self {
            client,
            endpoint_template: config.endpoint_template.clone(),
            api_key: config.api_key.clone(),
            method: config.method,
        })
    }

    /// Resolves the endpoint template for one descriptor
    fn build_url(&self, descriptor: &RequestDescriptor) -> String {
        self.endpoint_template
            .replace("{series}", &descriptor.series_name)
    }

    /// Assembles the outbound request parameters
    fn build_params(&self, descriptor: &RequestDescriptor) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("start_date", descriptor.start.format(DATE_FORMAT).to_string()),
            ("end_date", descriptor.end.format(DATE_FORMAT).to_string()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }
        params
    }
}

#[async_trait]
impl UpstreamFetch for HttpFetcher {
    async fn fetch(&self, descriptor: &RequestDescriptor) -> Result<RawResponse, FetchError> {
        let url = self.build_url(descriptor);
        let params = self.build_params(descriptor);

        let request = match self.method {
            UpstreamMethod::Get => self.client.get(&url).query(&params),
            UpstreamMethod::Post => self.client.post(&url).form(&params),
        };

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::UpstreamUnreachable(e.to_string()))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(FetchError::UpstreamRejected {
                status: status.as_u16(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::InvalidBody(e.to_string()))?;

        Ok(RawResponse { body })
    }
}
