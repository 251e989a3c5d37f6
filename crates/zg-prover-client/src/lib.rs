//! Client for the remote zero-knowledge prover.
//!
//! The prover is an opaque HTTP service with three operations used by the
//! settlement engine:
//!
//! - `POST /check-sign`: verify one signature per request against a user key
//! - `POST /proof-input`: build the input of an aggregate proof
//! - `POST /solidity-calldata`: turn a proof input into on-chain calldata
//!
//! # Example
//!
//! ```no_run
//! use zg_prover_client::{CheckSignatureRequest, ProofService, ProverClient, ProverRequest};
//!
//! # async fn example() -> Result<(), zg_prover_client::ProverError> {
//! let client = ProverClient::new("http://prover:3000")?;
//!
//! let verdicts = client
//!     .check_signature(&CheckSignatureRequest {
//!         pubkey: ["1".into(), "2".into()],
//!         requests: vec![ProverRequest {
//!             req_fee: "10".into(),
//!             res_fee: "20".into(),
//!             nonce: "1".into(),
//!             provider_address: "0x2222222222222222222222222222222222222222".into(),
//!             user_address: "0x1111111111111111111111111111111111111111".into(),
//!             request_hash: vec![0, 255],
//!         }],
//!         signatures: vec![vec![1, 2, 3]],
//!     })
//!     .await?;
//! assert_eq!(verdicts.len(), 1);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod error;
mod types;

pub use client::{ClientOptions, ProverClient};
pub use error::ProverError;
pub use types::*;

use async_trait::async_trait;

/// The remote proving capability.
///
/// Implemented by [`ProverClient`]; tests substitute an in-process fake.
#[async_trait]
pub trait ProofService: Send + Sync {
    /// Verify each signature against its request. Returns one verdict per
    /// request, in request order.
    ///
    /// # Errors
    ///
    /// Returns an error if the prover is unreachable or rejects the call.
    async fn check_signature(&self, request: &CheckSignatureRequest)
        -> Result<Vec<bool>, ProverError>;

    /// Build the input of an aggregate proof.
    ///
    /// # Errors
    ///
    /// Returns an error if the prover is unreachable or rejects the call.
    async fn generate_proof_input(
        &self,
        request: &ProofInputRequest,
    ) -> Result<ProofInput, ProverError>;

    /// Turn a proof input into calldata for the settlement contract.
    ///
    /// # Errors
    ///
    /// Returns an error if the prover is unreachable or rejects the call.
    async fn generate_solidity_calldata(
        &self,
        input: &ProofInput,
    ) -> Result<SolidityCalldata, ProverError>;
}
