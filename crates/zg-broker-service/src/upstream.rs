//! Forwarding of metered requests to the model server.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};

/// Errors reaching the upstream model server.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// A request to forward.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    /// Billable route, without the service prefix.
    pub route: String,
    /// Content type of the body, if the client sent one.
    pub content_type: Option<String>,
    /// Raw request body.
    pub body: Vec<u8>,
}

/// The upstream's answer, as received.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// Content type of the body.
    pub content_type: Option<String>,
    /// Content encoding of the body.
    pub content_encoding: Option<String>,
    /// Raw response body, still encoded.
    pub body: Vec<u8>,
}

/// The model server behind the broker.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Forward a request and return the raw response.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream cannot be reached.
    async fn forward(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>;
}

/// Upstream reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUpstream {
    /// Create an upstream for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is empty or the client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(UpstreamError::Configuration("target URL is empty".into()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }
}

fn header_text(headers: &reqwest::header::HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let url = format!("{}{}", self.base_url, request.route);
        tracing::debug!(%url, "forwarding to upstream");

        let mut builder = self.client.post(&url).body(request.body);
        if let Some(content_type) = request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        let response = builder.send().await?;

        let status = response.status();
        let content_type = header_text(response.headers(), CONTENT_TYPE);
        let content_encoding = header_text(response.headers(), CONTENT_ENCODING);
        let body = response.bytes().await?.to_vec();

        Ok(UpstreamResponse {
            status,
            content_type,
            content_encoding,
            body,
        })
    }
}
