//! JSON-RPC ledger backed by the serving contract.

use std::time::Duration;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, U256};
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use async_trait::async_trait;

use zg_broker_core::{AccountAddress, SignerKey, UserAccount};

use super::{Ledger, LedgerError, TxReceipt};
use crate::prover::SettlementCalldata;

sol! {
    #[sol(rpc)]
    interface IServing {
        struct Refund {
            uint256 index;
            uint256 amount;
            uint256 createdAt;
            bool processed;
        }

        struct Account {
            address user;
            address provider;
            uint256 nonce;
            uint256 balance;
            uint256 pendingRefund;
            uint256[2] signer;
            Refund[] refunds;
            string additionalInfo;
        }

        struct VerifierInput {
            uint256[] inProof;
            uint256[] proofInputs;
            uint256 numChunks;
            uint256[] segmentSize;
        }

        function getAccount(address user, address provider) external view returns (Account memory);

        function settleFees(VerifierInput calldata verifierInput) external;
    }
}

fn to_address(address: &AccountAddress) -> Address {
    Address::from(*address.as_bytes())
}

/// Ledger client talking to the serving contract over JSON-RPC.
///
/// A provider is built per call, so a flaky RPC endpoint never leaves a
/// broken connection behind.
#[derive(Debug, Clone)]
pub struct ChainLedger {
    rpc_url: reqwest::Url,
    contract: Address,
    provider: Address,
    signer: PrivateKeySigner,
    timeout: Duration,
}

impl ChainLedger {
    /// Create a ledger client.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the RPC URL or private key is invalid.
    pub fn new(
        rpc_url: &str,
        contract: &AccountAddress,
        provider: &AccountAddress,
        private_key: &str,
        timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let rpc_url = rpc_url
            .parse()
            .map_err(|e| LedgerError::Configuration(format!("invalid RPC URL: {e}")))?;
        let signer: PrivateKeySigner = private_key
            .trim()
            .parse()
            .map_err(|e| LedgerError::Configuration(format!("invalid private key: {e}")))?;

        Ok(Self {
            rpc_url,
            contract: to_address(contract),
            provider: to_address(provider),
            signer,
            timeout,
        })
    }

    /// Address transactions are sent from.
    #[must_use]
    pub fn sender(&self) -> Address {
        self.signer.address()
    }
}

fn account_error(user: &AccountAddress, err: &impl std::fmt::Display) -> LedgerError {
    let message = err.to_string();
    if message.contains("AccountNotExists") {
        LedgerError::AccountNotFound(*user)
    } else {
        LedgerError::Rpc(message)
    }
}

fn into_user_account(
    user: &AccountAddress,
    account: &IServing::Account,
) -> Result<UserAccount, LedgerError> {
    let nonce = u64::try_from(account.nonce)
        .map_err(|_| LedgerError::InvalidAccount(format!("nonce {} overflows", account.nonce)))?;
    let balance = u128::try_from(account.balance).map_err(|_| {
        LedgerError::InvalidAccount(format!("balance {} overflows", account.balance))
    })?;
    let signer = SignerKey::from_decimal(account.signer[0].to_string(), account.signer[1].to_string())
        .ok_or_else(|| LedgerError::InvalidAccount("malformed signer key".into()))?;

    Ok(UserAccount {
        address: *user,
        signer,
        nonce,
        balance,
    })
}

#[async_trait]
impl Ledger for ChainLedger {
    async fn get_user_account(&self, user: &AccountAddress) -> Result<UserAccount, LedgerError> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let contract = IServing::new(self.contract, &provider);

        let call = contract.getAccount(to_address(user), self.provider);
        let account = tokio::time::timeout(self.timeout, call.call())
            .await
            .map_err(|_| LedgerError::Timeout("getAccount"))?
            .map_err(|e| account_error(user, &e))?
            ._0;

        into_user_account(user, &account)
    }

    async fn settle_fees(&self, calldata: &SettlementCalldata) -> Result<TxReceipt, LedgerError> {
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(EthereumWallet::from(self.signer.clone()))
            .on_http(self.rpc_url.clone());
        let contract = IServing::new(self.contract, &provider);

        let input = IServing::VerifierInput {
            inProof: calldata.in_proof.clone(),
            proofInputs: calldata.proof_inputs.clone(),
            numChunks: U256::from(calldata.num_chunks),
            segmentSize: calldata.segment_size.clone(),
        };

        let submit = async {
            let pending = contract
                .settleFees(input)
                .send()
                .await
                .map_err(|e| LedgerError::Transaction(format!("failed to send: {e}")))?;
            tracing::info!(tx = %pending.tx_hash(), user = %calldata.user, "Settlement transaction sent");

            let receipt = pending
                .get_receipt()
                .await
                .map_err(|e| LedgerError::Transaction(format!("failed to get receipt: {e}")))?;
            if !receipt.status() {
                return Err(LedgerError::Transaction(format!(
                    "transaction {} reverted",
                    receipt.transaction_hash
                )));
            }
            Ok(TxReceipt {
                tx_hash: receipt.transaction_hash.to_string(),
                block_number: receipt.block_number,
            })
        };

        tokio::time::timeout(self.timeout, submit)
            .await
            .map_err(|_| LedgerError::Timeout("settleFees"))?
    }
}
