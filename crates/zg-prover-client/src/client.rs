//! Prover HTTP client implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::error::ProverError;
use crate::types::{
    ApiErrorResponse, CheckSignatureRequest, ProofInput, ProofInputRequest, SolidityCalldata,
};
use crate::ProofService;

/// Prover API client.
#[derive(Debug, Clone)]
pub struct ProverClient {
    client: Client,
    base_url: String,
}

impl ProverClient {
    /// Create a new prover client with default options.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the prover (e.g., `"http://prover:3000"`)
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProverError> {
        Self::with_options(base_url, &ClientOptions::default())
    }

    /// Create a new prover client with custom options.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is empty or the HTTP client cannot be
    /// built.
    pub fn with_options(
        base_url: impl Into<String>,
        options: &ClientOptions,
    ) -> Result<Self, ProverError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ProverError::Configuration("prover URL is empty".into()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout_seconds))
            .build()?;

        Ok(Self { client, base_url })
    }

    /// Base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ProverError> {
        let url = format!("{}{path}", self.base_url);
        tracing::debug!(%url, "calling prover");

        let response = self.client.post(&url).json(body).send().await?;
        Self::handle_response(response).await
    }

    /// Handle API response and convert errors.
    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProverError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorResponse>(&body)
            .map(|e| e.error)
            .unwrap_or(body);

        Err(ProverError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ProofService for ProverClient {
    async fn check_signature(
        &self,
        request: &CheckSignatureRequest,
    ) -> Result<Vec<bool>, ProverError> {
        self.post("/check-sign", request).await
    }

    async fn generate_proof_input(
        &self,
        request: &ProofInputRequest,
    ) -> Result<ProofInput, ProverError> {
        self.post("/proof-input", request).await
    }

    async fn generate_solidity_calldata(
        &self,
        input: &ProofInput,
    ) -> Result<SolidityCalldata, ProverError> {
        self.post("/solidity-calldata", input).await
    }
}

/// Client options for customization.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Request timeout in seconds (default: 30).
    pub timeout_seconds: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
        }
    }
}

impl ClientOptions {
    /// Create options with a request timeout.
    #[must_use]
    pub fn with_timeout(timeout_seconds: u64) -> Self {
        Self { timeout_seconds }
    }
}
