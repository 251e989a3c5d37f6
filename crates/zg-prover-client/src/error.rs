//! Prover client error types.

/// Errors that can occur when talking to the prover.
#[derive(Debug, thiserror::Error)]
pub enum ProverError {
    /// HTTP request failed (connection, timeout, body decoding).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The prover answered with a non-success status.
    #[error("prover error: HTTP {status} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message returned by the prover, if any.
        message: String,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}
