//! Settlement-side view of the remote prover.
//!
//! [`Prover`] pairs the raw prover API with the ledger: it resolves the
//! user's signer key, converts usage records into prover requests and bounds
//! every remote call with a timeout. A timeout counts as a failure of the
//! step that timed out.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::U256;

use zg_broker_core::{AccountAddress, UsageRecord};
use zg_prover_client::{
    CheckSignatureRequest, ProofInputRequest, ProofService, ProverError, ProverRequest,
    SolidityCalldata,
};

use crate::ledger::{Ledger, LedgerError};

/// Number of words in a Groth16 proof (`pA` 2, `pB` 2x2, `pC` 2).
const PROOF_WORDS: usize = 8;

/// Remote prover operations, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofStep {
    /// `POST /check-sign`.
    CheckSignature,
    /// `POST /proof-input`.
    GenerateProofInput,
    /// `POST /solidity-calldata`.
    GenerateSolidityCalldata,
}

impl fmt::Display for ProofStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CheckSignature => "check-sign",
            Self::GenerateProofInput => "proof-input",
            Self::GenerateSolidityCalldata => "solidity-calldata",
        })
    }
}

/// Errors from signature checks and calldata generation.
#[derive(Debug, thiserror::Error)]
pub enum ProofError {
    /// The user's signer key could not be fetched.
    #[error("signer lookup failed: {0}")]
    Ledger(#[from] LedgerError),

    /// A remote prover step failed.
    #[error("prover {step} failed: {source}")]
    Remote {
        /// The failing step.
        step: ProofStep,
        /// The underlying client error.
        #[source]
        source: ProverError,
    },

    /// A remote prover step did not answer in time.
    #[error("prover {0} timed out")]
    Timeout(ProofStep),

    /// The prover answered with the wrong number of verdicts.
    #[error("prover returned {got} verdicts for {expected} requests")]
    LengthMismatch {
        /// Requests sent.
        expected: usize,
        /// Verdicts received.
        got: usize,
    },

    /// More requests than one proof can fold.
    #[error("batch of {size} requests exceeds proof batch size {limit}")]
    BatchTooLarge {
        /// Requests in the batch.
        size: usize,
        /// Configured proof batch size.
        limit: usize,
    },

    /// Records of different users in one batch.
    #[error("batch mixes users {0} and {1}")]
    MixedUsers(AccountAddress, AccountAddress),

    /// The prover's calldata is not usable by the contract.
    #[error("invalid calldata: {0}")]
    InvalidCalldata(String),
}

/// Verifier input of the settlement contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementCalldata {
    /// The user whose fees are settled.
    pub user: AccountAddress,
    /// Proof words: `pA`, `pB` row by row, then `pC`.
    pub in_proof: Vec<U256>,
    /// Public inputs of the proof.
    pub proof_inputs: Vec<U256>,
    /// Number of proof chunks in this submission.
    pub num_chunks: u64,
    /// Public input count of each chunk.
    pub segment_size: Vec<U256>,
}

impl SettlementCalldata {
    /// Flatten prover calldata into contract words.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCalldata` if a word does not parse, the proof does
    /// not have exactly eight words, or there are no public inputs.
    pub fn from_proof(user: AccountAddress, calldata: &SolidityCalldata) -> Result<Self, ProofError> {
        let in_proof = calldata
            .p_a
            .iter()
            .chain(calldata.p_b.iter().flatten())
            .chain(calldata.p_c.iter())
            .map(|word| parse_word(word))
            .collect::<Result<Vec<_>, _>>()?;
        if in_proof.len() != PROOF_WORDS {
            return Err(ProofError::InvalidCalldata(format!(
                "expected {PROOF_WORDS} proof words, got {}",
                in_proof.len()
            )));
        }

        let proof_inputs = calldata
            .pub_inputs
            .iter()
            .map(|word| parse_word(word))
            .collect::<Result<Vec<_>, _>>()?;
        if proof_inputs.is_empty() {
            return Err(ProofError::InvalidCalldata("no public inputs".into()));
        }

        let segment_size = vec![U256::from(proof_inputs.len())];
        Ok(Self {
            user,
            in_proof,
            proof_inputs,
            num_chunks: 1,
            segment_size,
        })
    }
}

fn parse_word(word: &str) -> Result<U256, ProofError> {
    U256::from_str(word.trim())
        .map_err(|e| ProofError::InvalidCalldata(format!("word {word:?}: {e}")))
}

/// Convert a usage record into the prover's request shape.
#[must_use]
pub fn prover_request(record: &UsageRecord) -> ProverRequest {
    ProverRequest {
        req_fee: record.input_fee.to_string(),
        res_fee: record.output_fee.to_string(),
        nonce: record.nonce.to_string(),
        provider_address: record.provider.to_string(),
        user_address: record.user.to_string(),
        request_hash: record
            .request_hash
            .as_ref()
            .map(zg_broker_core::RequestHash::to_words)
            .unwrap_or_default(),
    }
}

fn prover_batch(records: &[UsageRecord]) -> (Vec<ProverRequest>, Vec<Vec<i64>>) {
    records
        .iter()
        .map(|r| (prover_request(r), r.signature.words().to_vec()))
        .unzip()
}

/// The single user of a batch, or `None` for an empty batch.
fn batch_user(records: &[UsageRecord]) -> Result<Option<AccountAddress>, ProofError> {
    let Some(first) = records.first() else {
        return Ok(None);
    };
    match records.iter().find(|r| r.user != first.user) {
        Some(other) => Err(ProofError::MixedUsers(first.user, other.user)),
        None => Ok(Some(first.user)),
    }
}

/// Signature verification and calldata generation for settlement batches.
#[derive(Clone)]
pub struct Prover {
    service: Arc<dyn ProofService>,
    ledger: Arc<dyn Ledger>,
    batch_size: usize,
    timeout: Duration,
}

impl Prover {
    /// Create a prover over a remote proof service.
    ///
    /// `ledger` is only used to look up signer keys, so a cached ledger fits.
    #[must_use]
    pub fn new(
        service: Arc<dyn ProofService>,
        ledger: Arc<dyn Ledger>,
        batch_size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            service,
            ledger,
            batch_size,
            timeout,
        }
    }

    /// Maximum number of requests folded into one proof.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Verify every record's signature against its user's key.
    ///
    /// Returns exactly one verdict per record, in record order. An empty
    /// batch returns no verdicts without calling out.
    ///
    /// # Errors
    ///
    /// Fails the whole batch if the key lookup or the prover call fails, or
    /// if the prover's answer has the wrong length.
    pub async fn check_signatures(&self, records: &[UsageRecord]) -> Result<Vec<bool>, ProofError> {
        let Some(user) = batch_user(records)? else {
            return Ok(Vec::new());
        };
        let pubkey = self.signer_key(&user).await?;
        let (requests, signatures) = prover_batch(records);

        let request = CheckSignatureRequest {
            pubkey,
            requests,
            signatures,
        };
        let verdicts = self
            .call(
                ProofStep::CheckSignature,
                self.service.check_signature(&request),
            )
            .await?;

        if verdicts.len() != records.len() {
            return Err(ProofError::LengthMismatch {
                expected: records.len(),
                got: verdicts.len(),
            });
        }
        Ok(verdicts)
    }

    /// Build settlement calldata for a batch of verified records.
    ///
    /// Returns `None` for an empty batch.
    ///
    /// # Errors
    ///
    /// Fails if the batch is too large, the key lookup fails, either remote
    /// step fails, or the calldata cannot be converted.
    pub async fn generate_solidity_calldata(
        &self,
        records: &[UsageRecord],
    ) -> Result<Option<SettlementCalldata>, ProofError> {
        let Some(user) = batch_user(records)? else {
            return Ok(None);
        };
        if records.len() > self.batch_size {
            return Err(ProofError::BatchTooLarge {
                size: records.len(),
                limit: self.batch_size,
            });
        }
        let pubkey = self.signer_key(&user).await?;
        let (requests, signatures) = prover_batch(records);

        let request = ProofInputRequest {
            batch_size: self.batch_size,
            pubkey,
            requests,
            signatures,
        };
        let input = self
            .call(
                ProofStep::GenerateProofInput,
                self.service.generate_proof_input(&request),
            )
            .await?;
        let calldata = self
            .call(
                ProofStep::GenerateSolidityCalldata,
                self.service.generate_solidity_calldata(&input),
            )
            .await?;

        SettlementCalldata::from_proof(user, &calldata).map(Some)
    }

    async fn signer_key(&self, user: &AccountAddress) -> Result<[String; 2], ProofError> {
        let account = self.ledger.get_user_account(user).await?;
        Ok(account.signer.parts().clone())
    }

    async fn call<T>(
        &self,
        step: ProofStep,
        fut: impl Future<Output = Result<T, ProverError>>,
    ) -> Result<T, ProofError> {
        tracing::debug!(%step, "calling prover");
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(ProofError::Remote { step, source }),
            Err(_) => Err(ProofError::Timeout(step)),
        }
    }
}

impl fmt::Debug for Prover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prover")
            .field("batch_size", &self.batch_size)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
