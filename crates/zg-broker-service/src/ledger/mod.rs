//! Access to the on-chain serving contract.
//!
//! The broker reads user accounts (signer key, settled nonce, balance) and
//! submits settlement calldata. Both go through the [`Ledger`] trait so the
//! settlement engine can run against an in-process fake.

mod cache;
mod contract;

pub use cache::CachedLedger;
pub use contract::ChainLedger;

use async_trait::async_trait;
use serde::Serialize;

use zg_broker_core::{AccountAddress, UserAccount};

use crate::prover::SettlementCalldata;

/// Errors from ledger reads and writes.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The user has no account with this provider.
    #[error("no ledger account for {0}")]
    AccountNotFound(AccountAddress),

    /// The contract returned an account we cannot use.
    #[error("invalid ledger account: {0}")]
    InvalidAccount(String),

    /// The RPC call failed.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// The settlement transaction failed or reverted.
    #[error("transaction failed: {0}")]
    Transaction(String),

    /// A call did not finish within the configured timeout.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Confirmation of a settlement transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxReceipt {
    /// Transaction hash, `0x`-prefixed.
    pub tx_hash: String,
    /// Block the transaction was included in.
    pub block_number: Option<u64>,
}

/// The serving contract as seen by one provider.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Fetch a user's account with this provider.
    ///
    /// # Errors
    ///
    /// Returns `AccountNotFound` if the user never registered, or an RPC
    /// error. Callers must not fall back to a made-up key.
    async fn get_user_account(&self, user: &AccountAddress) -> Result<UserAccount, LedgerError>;

    /// Fetch a user's account, bypassing any cache in front of the contract.
    ///
    /// # Errors
    ///
    /// Same as [`get_user_account`](Self::get_user_account).
    async fn refresh_user_account(
        &self,
        user: &AccountAddress,
    ) -> Result<UserAccount, LedgerError> {
        self.get_user_account(user).await
    }

    /// Submit settlement calldata and wait for the receipt.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot be sent, reverts, or the
    /// receipt does not arrive in time. A timeout does not mean the
    /// transaction failed on-chain.
    async fn settle_fees(&self, calldata: &SettlementCalldata) -> Result<TxReceipt, LedgerError>;
}
