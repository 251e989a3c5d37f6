//! The settlement tick and its background loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use zg_broker_core::{InstanceId, SettlementPair, UsageRecord, UsageRecordId};
use zg_broker_store::{GroupCriteria, Store, StoreError};

use super::{
    SettlementError, SettlementOutcome, SettlementPhase, SettlementStatus, StatusHandle, StepError,
};
use crate::config::ServiceConfig;
use crate::ledger::Ledger;
use crate::prover::Prover;

/// Scheduler timing and grouping.
#[derive(Debug, Clone, Copy)]
pub struct SettlementSettings {
    /// Time between ticks.
    pub interval: Duration,
    /// Which groups are eligible and how large they may be.
    pub criteria: GroupCriteria,
    /// How long a claim protects a group from other instances.
    pub claim_ttl: chrono::Duration,
    /// How long a group that failed to settle is held back before a retry.
    pub retry_backoff: chrono::Duration,
}

fn chrono_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::from_std(Duration::from_secs(secs)).unwrap_or(chrono::Duration::MAX)
}

impl SettlementSettings {
    /// Derive settings from the service configuration.
    ///
    /// Groups are capped at the proof batch size so every group fits one
    /// proof.
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.settlement_interval_seconds),
            criteria: GroupCriteria {
                threshold: config.settle_trigger_threshold,
                force_after: chrono_seconds(config.force_settlement_after_seconds),
                limit: config.prover_batch_size,
            },
            claim_ttl: chrono_seconds(config.claim_ttl_seconds),
            retry_backoff: chrono_seconds(config.settlement_retry_backoff_seconds),
        }
    }
}

/// Tags a step failure with the phase it happened in.
trait DuringPhase<T> {
    fn during(self, phase: SettlementPhase) -> Result<T, SettlementError>;
}

impl<T, E: Into<StepError>> DuringPhase<T> for Result<T, E> {
    fn during(self, phase: SettlementPhase) -> Result<T, SettlementError> {
        self.map_err(|err| SettlementError {
            phase,
            source: err.into(),
        })
    }
}

fn ids_of(records: &[UsageRecord]) -> Vec<UsageRecordId> {
    records.iter().map(|r| r.id).collect()
}

/// Wall time inside a tick that started at `now`.
#[derive(Debug, Clone, Copy)]
struct TickClock {
    now: DateTime<Utc>,
    started: Instant,
}

impl TickClock {
    fn start(now: DateTime<Utc>) -> Self {
        Self {
            now,
            started: Instant::now(),
        }
    }

    fn current(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.started.elapsed())
            .map_or(self.now, |elapsed| self.now + elapsed)
    }
}

/// Runs settlement ticks for one broker instance.
pub struct SettlementEngine {
    store: Arc<dyn Store>,
    prover: Prover,
    ledger: Arc<dyn Ledger>,
    settings: SettlementSettings,
    instance: InstanceId,
    status: StatusHandle,
}

impl SettlementEngine {
    /// Create an engine with a fresh instance ID.
    ///
    /// `ledger` is used to read the current on-chain nonce and to submit
    /// settlements, so it should not be cached.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        prover: Prover,
        ledger: Arc<dyn Ledger>,
        settings: SettlementSettings,
    ) -> Self {
        Self::with_instance(store, prover, ledger, settings, InstanceId::generate())
    }

    /// Create an engine that claims records as `instance`.
    #[must_use]
    pub fn with_instance(
        store: Arc<dyn Store>,
        prover: Prover,
        ledger: Arc<dyn Ledger>,
        settings: SettlementSettings,
        instance: InstanceId,
    ) -> Self {
        let status = SettlementStatus {
            instance: Some(instance.to_string()),
            ..SettlementStatus::default()
        };
        Self {
            store,
            prover,
            ledger,
            settings,
            instance,
            status: Arc::new(RwLock::new(status)),
        }
    }

    /// The instance ID stamped on claims.
    #[must_use]
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Shared handle to this engine's status.
    #[must_use]
    pub fn status(&self) -> StatusHandle {
        Arc::clone(&self.status)
    }

    /// Run one settlement tick at `now`.
    ///
    /// Settles at most one (user, provider) group. Records whose state was
    /// made final before a failure stay final. The rest stay claimed for the
    /// retry backoff, which keeps the whole pair out of selection so other
    /// pairs get their turn.
    ///
    /// # Errors
    ///
    /// Returns the phase that failed and why.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<SettlementOutcome, SettlementError> {
        let clock = TickClock::start(now);
        let promoted = self
            .store
            .promote_delivered()
            .await
            .during(SettlementPhase::Acknowledging)?;
        if promoted > 0 {
            tracing::debug!(promoted, "Promoted delivered usage records");
        }

        let Some(group) = self
            .store
            .next_settlement_group(&self.settings.criteria, now)
            .await
            .during(SettlementPhase::Selecting)?
        else {
            return Ok(SettlementOutcome::Idle { promoted });
        };

        let ids = group.ids();
        let claimed = self
            .store
            .claim(&ids, self.instance, now + self.settings.claim_ttl, now)
            .await
            .during(SettlementPhase::Claiming)?;
        if !claimed {
            tracing::info!(pair = %group.pair, "Settlement group claimed by another instance");
            return Ok(SettlementOutcome::Contended { pair: group.pair });
        }

        tracing::info!(
            pair = %group.pair,
            records = group.records.len(),
            total_fee = %group.total_fee(),
            "Settling group"
        );

        let mut remaining = group.records;
        let result = self.settle_claimed(group.pair, &mut remaining, clock).await;

        if result.is_err() && !remaining.is_empty() {
            self.back_off(group.pair, &ids_of(&remaining), clock).await;
        }
        result
    }

    /// Hold a failed group's unfinished records until the retry backoff has
    /// passed. Falls back to releasing the claim if it can no longer be
    /// extended.
    async fn back_off(&self, pair: SettlementPair, ids: &[UsageRecordId], clock: TickClock) {
        let at = clock.current();
        if self.settings.retry_backoff > chrono::Duration::zero() {
            match self
                .store
                .extend_claim(ids, self.instance, at + self.settings.retry_backoff, at)
                .await
            {
                Ok(true) => {
                    tracing::info!(
                        pair = %pair,
                        records = ids.len(),
                        retry_after_secs = self.settings.retry_backoff.num_seconds(),
                        "Holding failed settlement group for retry"
                    );
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(pair = %pair, error = %e, "Failed to hold settlement group");
                }
            }
        }

        if let Err(e) = self.store.release_claim(ids, self.instance).await {
            // The claim lapses on its own after the TTL.
            tracing::warn!(pair = %pair, error = %e, "Failed to release settlement claim");
        }
    }

    /// Settle a claimed group. Records are removed from `remaining` as soon as
    /// their final state is committed.
    async fn settle_claimed(
        &self,
        pair: SettlementPair,
        remaining: &mut Vec<UsageRecord>,
        clock: TickClock,
    ) -> Result<SettlementOutcome, SettlementError> {
        let account = self
            .ledger
            .get_user_account(&pair.user)
            .await
            .during(SettlementPhase::Reconciling)?;

        let reconciled: Vec<UsageRecordId> = remaining
            .iter()
            .filter(|r| r.nonce <= account.nonce)
            .map(|r| r.id)
            .collect();
        if !reconciled.is_empty() {
            self.store
                .mark_settled(&reconciled, self.instance, clock.current())
                .await
                .during(SettlementPhase::Reconciling)?;
            remaining.retain(|r| r.nonce > account.nonce);
            tracing::info!(
                pair = %pair,
                records = reconciled.len(),
                chain_nonce = account.nonce,
                "Usage already settled on-chain"
            );
        }

        let verdicts = self
            .prover
            .check_signatures(remaining)
            .await
            .during(SettlementPhase::Verifying)?;
        let rejected: Vec<UsageRecordId> = remaining
            .iter()
            .zip(&verdicts)
            .filter(|(_, valid)| !**valid)
            .map(|(r, _)| r.id)
            .collect();
        if !rejected.is_empty() {
            self.store
                .mark_rejected(&rejected, self.instance, clock.current())
                .await
                .during(SettlementPhase::Verifying)?;
            remaining.retain(|r| !rejected.contains(&r.id));
            tracing::warn!(pair = %pair, records = rejected.len(), "Rejected usage with invalid signatures");
        }

        if remaining.is_empty() {
            return Ok(SettlementOutcome::Settled {
                pair,
                settled: 0,
                reconciled: reconciled.len(),
                rejected: rejected.len(),
                tx_hash: None,
            });
        }

        let calldata = self
            .prover
            .generate_solidity_calldata(remaining)
            .await
            .during(SettlementPhase::ProofGenerating)?
            .ok_or(SettlementError {
                phase: SettlementPhase::ProofGenerating,
                source: StepError::MissingCalldata,
            })?;

        // Proving can take long; make sure the claim outlives the submission.
        let settled = ids_of(remaining);
        let at = clock.current();
        let renewed = self
            .store
            .extend_claim(&settled, self.instance, at + self.settings.claim_ttl, at)
            .await
            .during(SettlementPhase::Submitting)?;
        if !renewed {
            return Err(SettlementError {
                phase: SettlementPhase::Submitting,
                source: StepError::Store(StoreError::ClaimLost(settled.len())),
            });
        }

        let receipt = self
            .ledger
            .settle_fees(&calldata)
            .await
            .during(SettlementPhase::Submitting)?;

        self.store
            .mark_settled(&settled, self.instance, clock.current())
            .await
            .during(SettlementPhase::Committing)?;
        remaining.clear();

        tracing::info!(
            pair = %pair,
            records = settled.len(),
            tx = %receipt.tx_hash,
            "Settlement committed"
        );

        Ok(SettlementOutcome::Settled {
            pair,
            settled: settled.len(),
            reconciled: reconciled.len(),
            rejected: rejected.len(),
            tx_hash: Some(receipt.tx_hash),
        })
    }

    async fn run_tick(&self) {
        let now = Utc::now();
        let result = self.tick(now).await;

        let mut status = self.status.write().await;
        status.ticks += 1;
        status.last_tick_at = Some(now);
        match result {
            Ok(outcome) => {
                status.last_outcome = Some(outcome);
                status.last_error = None;
                status.last_error_phase = None;
            }
            Err(e) => {
                tracing::error!(phase = %e.phase, error = %e, "Settlement tick failed");
                status.last_error = Some(e.to_string());
                status.last_error_phase = Some(e.phase);
            }
        }
    }

    /// Tick every interval until `shutdown` turns `true` or its sender is
    /// dropped. A running tick always finishes before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            instance = %self.instance,
            interval_secs = self.settings.interval.as_secs(),
            threshold = %self.settings.criteria.threshold,
            "Settlement scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => self.run_tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(instance = %self.instance, "Settlement scheduler stopped");
    }

    /// Spawn [`run`](Self::run) as a background task.
    #[must_use]
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
