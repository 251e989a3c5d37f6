//! Account cache in front of a ledger.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use zg_broker_core::{AccountAddress, UserAccount};

use super::{Ledger, LedgerError, TxReceipt};
use crate::prover::SettlementCalldata;

struct CachedAccount {
    account: UserAccount,
    fetched_at: Instant,
}

/// Caches account lookups of an inner ledger for a fixed time.
///
/// Suited to signer key lookups. Anything that needs the current on-chain
/// nonce should read the inner ledger directly.
pub struct CachedLedger {
    inner: Arc<dyn Ledger>,
    ttl: Duration,
    accounts: RwLock<HashMap<AccountAddress, CachedAccount>>,
}

impl CachedLedger {
    /// Wrap `inner`, keeping accounts for `ttl`.
    #[must_use]
    pub fn new(inner: Arc<dyn Ledger>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// Drop a cached account.
    pub async fn invalidate(&self, user: &AccountAddress) {
        self.accounts.write().await.remove(user);
    }
}

#[async_trait]
impl Ledger for CachedLedger {
    async fn get_user_account(&self, user: &AccountAddress) -> Result<UserAccount, LedgerError> {
        {
            let accounts = self.accounts.read().await;
            if let Some(cached) = accounts.get(user) {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.account.clone());
                }
            }
        }

        tracing::debug!(user = %user, "Ledger account cache miss");
        let account = self.inner.get_user_account(user).await?;
        self.accounts.write().await.insert(
            *user,
            CachedAccount {
                account: account.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(account)
    }

    async fn refresh_user_account(
        &self,
        user: &AccountAddress,
    ) -> Result<UserAccount, LedgerError> {
        self.invalidate(user).await;
        self.get_user_account(user).await
    }

    async fn settle_fees(&self, calldata: &SettlementCalldata) -> Result<TxReceipt, LedgerError> {
        let receipt = self.inner.settle_fees(calldata).await?;
        // Balance and nonce moved on-chain.
        self.invalidate(&calldata.user).await;
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use zg_broker_core::SignerKey;

    struct CountingLedger {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl Ledger for CountingLedger {
        async fn get_user_account(
            &self,
            user: &AccountAddress,
        ) -> Result<UserAccount, LedgerError> {
            let n = self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(UserAccount {
                address: *user,
                signer: SignerKey::from_decimal("1", "2").unwrap(),
                nonce: n as u64,
                balance: 0,
            })
        }

        async fn settle_fees(
            &self,
            _calldata: &SettlementCalldata,
        ) -> Result<TxReceipt, LedgerError> {
            Ok(TxReceipt {
                tx_hash: "0xabc".into(),
                block_number: Some(1),
            })
        }
    }

    fn user() -> AccountAddress {
        "0x1111111111111111111111111111111111111111".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn caches_until_ttl() {
        let inner = Arc::new(CountingLedger {
            lookups: AtomicUsize::new(0),
        });
        let cached = CachedLedger::new(inner.clone(), Duration::from_secs(60));

        cached.get_user_account(&user()).await.unwrap();
        cached.get_user_account(&user()).await.unwrap();
        assert_eq!(inner.lookups.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        cached.get_user_account(&user()).await.unwrap();
        assert_eq!(inner.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn settlement_invalidates_user() {
        let inner = Arc::new(CountingLedger {
            lookups: AtomicUsize::new(0),
        });
        let cached = CachedLedger::new(inner.clone(), Duration::from_secs(60));

        cached.get_user_account(&user()).await.unwrap();
        cached
            .settle_fees(&SettlementCalldata {
                user: user(),
                in_proof: Vec::new(),
                proof_inputs: Vec::new(),
                num_chunks: 1,
                segment_size: Vec::new(),
            })
            .await
            .unwrap();
        let account = cached.get_user_account(&user()).await.unwrap();

        assert_eq!(inner.lookups.load(Ordering::SeqCst), 2);
        assert_eq!(account.nonce, 1);
    }

    #[tokio::test]
    async fn refresh_skips_the_cache() {
        let inner = Arc::new(CountingLedger {
            lookups: AtomicUsize::new(0),
        });
        let cached = CachedLedger::new(inner.clone(), Duration::from_secs(60));

        cached.get_user_account(&user()).await.unwrap();
        let fresh = cached.refresh_user_account(&user()).await.unwrap();
        let again = cached.get_user_account(&user()).await.unwrap();

        assert_eq!(inner.lookups.load(Ordering::SeqCst), 2);
        assert_eq!(fresh.nonce, 1);
        assert_eq!(again.nonce, 1);
    }
}
