//! Common test utilities for broker integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::Router;
use axum_test::{TestRequest, TestServer};
use chrono::Utc;

use zg_broker_core::{
    AccountAddress, NewUsage, RequestHash, Signature, SignerKey, UsageRecord, UserAccount,
};
use zg_broker_service::{
    create_router, AppState, Ledger, LedgerError, Prover, ServiceConfig, SettlementCalldata,
    SettlementEngine, SettlementSettings, TxReceipt, Upstream, UpstreamError, UpstreamRequest,
    UpstreamResponse,
};
use zg_broker_store::{MemoryStore, Store};
use zg_prover_client::{
    CheckSignatureRequest, ProofInput, ProofInputRequest, ProofService, ProverError,
    SolidityCalldata,
};

pub const USER: &str = "0x1111111111111111111111111111111111111111";
pub const PROVIDER: &str = "0x2222222222222222222222222222222222222222";
/// A user the ledger has never heard of.
pub const STRANGER: &str = "0x0909090909090909090909090909090909090909";

// ============================================================================
// Mock Ledger
// ============================================================================

/// In-process serving contract.
#[derive(Default)]
pub struct MockLedger {
    accounts: Mutex<HashMap<AccountAddress, UserAccount>>,
    submissions: Mutex<Vec<SettlementCalldata>>,
    fail_submit: AtomicBool,
}

impl MockLedger {
    /// Register a user with an on-chain nonce.
    pub fn register(&self, user: AccountAddress, nonce: u64) {
        let account = UserAccount {
            address: user,
            signer: SignerKey::from_decimal("123", "456").unwrap(),
            nonce,
            balance: 1_000_000,
        };
        self.accounts.lock().unwrap().insert(user, account);
    }

    /// Set a registered user's locked balance.
    pub fn set_balance(&self, user: &AccountAddress, balance: u128) {
        if let Some(account) = self.accounts.lock().unwrap().get_mut(user) {
            account.balance = balance;
        }
    }

    /// Forget a user, as if they never opened an account.
    pub fn unregister(&self, user: &AccountAddress) {
        self.accounts.lock().unwrap().remove(user);
    }

    pub fn fail_submissions(&self, fail: bool) {
        self.fail_submit.store(fail, Ordering::SeqCst);
    }

    pub fn submissions(&self) -> Vec<SettlementCalldata> {
        self.submissions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn get_user_account(&self, user: &AccountAddress) -> Result<UserAccount, LedgerError> {
        self.accounts
            .lock()
            .unwrap()
            .get(user)
            .cloned()
            .ok_or(LedgerError::AccountNotFound(*user))
    }

    async fn settle_fees(&self, calldata: &SettlementCalldata) -> Result<TxReceipt, LedgerError> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(LedgerError::Transaction("execution reverted".into()));
        }
        let mut submissions = self.submissions.lock().unwrap();
        submissions.push(calldata.clone());
        Ok(TxReceipt {
            tx_hash: format!("0x{:064x}", submissions.len()),
            block_number: Some(submissions.len() as u64),
        })
    }
}

// ============================================================================
// Mock Prover
// ============================================================================

/// In-process prover. Accepts every signature unless told otherwise.
#[derive(Default)]
pub struct MockProver {
    verdicts: Mutex<Option<Vec<bool>>>,
    fail: AtomicBool,
    check_calls: AtomicUsize,
    proof_calls: AtomicUsize,
    last_batch_size: AtomicUsize,
}

impl MockProver {
    pub fn set_verdicts(&self, verdicts: Vec<bool>) {
        *self.verdicts.lock().unwrap() = Some(verdicts);
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn check_calls(&self) -> usize {
        self.check_calls.load(Ordering::SeqCst)
    }

    pub fn proof_calls(&self) -> usize {
        self.proof_calls.load(Ordering::SeqCst)
    }

    pub fn last_batch_size(&self) -> usize {
        self.last_batch_size.load(Ordering::SeqCst)
    }

    fn outage(&self) -> Result<(), ProverError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProverError::Api {
                status: 503,
                message: "prover unavailable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProofService for MockProver {
    async fn check_signature(
        &self,
        request: &CheckSignatureRequest,
    ) -> Result<Vec<bool>, ProverError> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        self.outage()?;
        let verdicts = self.verdicts.lock().unwrap().take();
        Ok(verdicts.unwrap_or_else(|| vec![true; request.requests.len()]))
    }

    async fn generate_proof_input(
        &self,
        request: &ProofInputRequest,
    ) -> Result<ProofInput, ProverError> {
        self.proof_calls.fetch_add(1, Ordering::SeqCst);
        self.outage()?;
        self.last_batch_size
            .store(request.requests.len(), Ordering::SeqCst);
        Ok(ProofInput(serde_json::json!({
            "l": request.batch_size,
            "requests": request.requests.len(),
        })))
    }

    async fn generate_solidity_calldata(
        &self,
        _input: &ProofInput,
    ) -> Result<SolidityCalldata, ProverError> {
        self.outage()?;
        Ok(SolidityCalldata {
            p_a: vec!["0x1".into(), "0x2".into()],
            p_b: vec![
                vec!["0x3".into(), "0x4".into()],
                vec!["0x5".into(), "0x6".into()],
            ],
            p_c: vec!["0x7".into(), "0x8".into()],
            pub_inputs: vec!["0x9".into(), "0xa".into()],
        })
    }
}

// ============================================================================
// Mock Upstream
// ============================================================================

/// What the mock model server does with the next requests.
#[derive(Debug, Clone)]
pub enum UpstreamBehavior {
    /// Answer with a status, content type and body.
    Reply {
        status: StatusCode,
        content_type: &'static str,
        body: Vec<u8>,
    },
    /// Be unreachable.
    Unreachable,
}

/// In-process model server.
pub struct MockUpstream {
    behavior: Mutex<UpstreamBehavior>,
    requests: Mutex<Vec<UpstreamRequest>>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self {
            behavior: Mutex::new(chat_reply("four words of output")),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set(&self, behavior: UpstreamBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn forward(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        self.requests.lock().unwrap().push(request);
        match self.behavior.lock().unwrap().clone() {
            UpstreamBehavior::Reply {
                status,
                content_type,
                body,
            } => Ok(UpstreamResponse {
                status,
                content_type: Some(content_type.to_string()),
                content_encoding: None,
                body,
            }),
            UpstreamBehavior::Unreachable => {
                Err(UpstreamError::Configuration("connection refused".into()))
            }
        }
    }
}

/// A successful chat completion answering with `content`.
pub fn chat_reply(content: &str) -> UpstreamBehavior {
    let body = serde_json::json!({
        "choices": [
            { "message": { "role": "assistant", "content": content }, "finish_reason": "stop" }
        ]
    });
    UpstreamBehavior::Reply {
        status: StatusCode::OK,
        content_type: "application/json",
        body: serde_json::to_vec(&body).unwrap(),
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// The store shared by the server and the settlement engine.
    pub store: Arc<MemoryStore>,
    /// The fake serving contract.
    pub ledger: Arc<MockLedger>,
    /// The fake prover.
    pub prover: Arc<MockProver>,
    /// The fake model server.
    pub upstream: Arc<MockUpstream>,
    /// Settlement engine over the same store.
    pub engine: SettlementEngine,
    /// The paying user, registered with on-chain nonce 0.
    pub user: AccountAddress,
    /// The broker's provider address.
    pub provider: AccountAddress,
}

/// Configuration used by [`TestHarness::new`].
pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        listen_addr: "127.0.0.1:0".into(),
        provider_address: Some(PROVIDER.into()),
        target_url: Some("http://model.invalid".into()),
        settle_trigger_threshold: 20,
        prover_batch_size: 4,
        request_timeout_seconds: 30,
        ..ServiceConfig::default()
    }
}

impl TestHarness {
    /// Create a new test harness with an empty store.
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Create a harness serving `config`.
    pub fn with_config(config: ServiceConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MockLedger::default());
        let prover = Arc::new(MockProver::default());
        let upstream = Arc::new(MockUpstream::new());

        let user: AccountAddress = USER.parse().unwrap();
        let provider: AccountAddress = PROVIDER.parse().unwrap();
        ledger.register(user, 0);

        let engine = SettlementEngine::new(
            store.clone(),
            Prover::new(
                prover.clone(),
                ledger.clone(),
                config.prover_batch_size,
                Duration::from_secs(5),
            ),
            ledger.clone(),
            SettlementSettings::from_config(&config),
        );

        let state = AppState::new(
            store.clone(),
            config,
            upstream.clone(),
            ledger.clone(),
            engine.status(),
        )
        .expect("Failed to build app state");
        let router: Router = create_router(state);
        let server = TestServer::new(router).expect("Failed to create test server");

        Self {
            server,
            store,
            ledger,
            prover,
            upstream,
            engine,
            user,
            provider,
        }
    }

    /// A chat request with complete metering headers whose fees exactly
    /// cover `content` at a price of one per word.
    pub fn chat_request(&self, nonce: u64, content: &str) -> TestRequest {
        let words = content.split_whitespace().count();
        self.server
            .post("/v1/proxy/chat/completions")
            .add_header("Address", USER)
            .add_header("Fee", words.to_string())
            .add_header("Input-Fee", words.to_string())
            .add_header("Nonce", nonce.to_string())
            .add_header("Request-Hash", "0xabcd")
            .add_header("Signature", "[1,2,3]")
            .add_header("Use-Proxy", "false")
            .json(&serde_json::json!({
                "model": "llama",
                "messages": [{ "role": "user", "content": content }]
            }))
    }

    /// Store a delivered usage record directly, bypassing HTTP.
    pub async fn delivered(&self, nonce: u64, fee: u128) -> UsageRecord {
        self.delivered_for(self.user, nonce, fee).await
    }

    /// Store a delivered usage record of `user` directly, bypassing HTTP.
    pub async fn delivered_for(&self, user: AccountAddress, nonce: u64, fee: u128) -> UsageRecord {
        let record = UsageRecord::new(NewUsage {
            user,
            provider: self.provider,
            route: "/chat/completions".into(),
            service_name: None,
            input_count: 1,
            input_fee: fee,
            previous_output_fee: None,
            fee,
            nonce,
            request_hash: Some(RequestHash::from_bytes(vec![0xab, 0xcd])),
            signature: Signature::new(vec![1, 2, 3]),
        });
        self.store.insert_usage(&record).await.unwrap();
        self.store
            .record_delivery(&record.id, 1, 0, Utc::now())
            .await
            .unwrap()
    }

    /// Reload a record, including soft-deleted ones.
    pub async fn reload(&self, record: &UsageRecord) -> UsageRecord {
        self.store
            .list_usage(&zg_broker_core::UsageFilter {
                include_deleted: true,
                ..Default::default()
            })
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.id == record.id)
            .expect("record disappeared")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
