//! PostgreSQL storage implementation.
//!
//! Fees and nonces are kept in `NUMERIC` columns and moved across the wire as
//! text, so the full `u128`/`u64` range survives without a decimal crate.
//! Multi-record updates run in one transaction and roll back unless every
//! listed record matched. Claims lock the pair's `usage_nonces` row first, so
//! two instances cannot split one pair between them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use zg_broker_core::{
    Claim, InstanceId, SettlementPair, SettlementState, UsageFilter, UsageRecord, UsageRecordId,
};

use crate::error::{Result, StoreError};
use crate::selection::{GroupCriteria, SettlementGroup};
use crate::Store;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("migrations/postgres");

const SELECT_USAGE: &str = r"
    SELECT id, user_address, provider_address, route, service_name,
           input_count, output_count,
           input_fee::text AS input_fee,
           output_fee::text AS output_fee,
           previous_output_fee::text AS previous_output_fee,
           fee::text AS fee,
           nonce::text AS nonce,
           request_hash, signature, state, claim_owner, claim_expires_at,
           created_at, delivered_at, settled_at, deleted_at
    FROM usage_records
";

/// Database row for usage records.
#[derive(sqlx::FromRow)]
struct UsageRow {
    id: String,
    user_address: String,
    provider_address: String,
    route: String,
    service_name: Option<String>,
    input_count: i64,
    output_count: i64,
    input_fee: String,
    output_fee: String,
    previous_output_fee: Option<String>,
    fee: String,
    nonce: String,
    request_hash: Option<String>,
    signature: serde_json::Value,
    state: String,
    claim_owner: Option<Uuid>,
    claim_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
    settled_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
}

fn corrupt(field: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Serialization(format!("{field}: {err}"))
}

fn parse<T>(field: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| corrupt(field, e))
}

impl TryFrom<UsageRow> for UsageRecord {
    type Error = StoreError;

    fn try_from(row: UsageRow) -> Result<Self> {
        let claim = match (row.claim_owner, row.claim_expires_at) {
            (Some(owner), Some(expires_at)) => Some(Claim {
                owner: InstanceId::from_uuid(owner),
                expires_at,
            }),
            _ => None,
        };

        Ok(Self {
            id: parse("id", &row.id)?,
            user: parse("user_address", &row.user_address)?,
            provider: parse("provider_address", &row.provider_address)?,
            route: row.route,
            service_name: row.service_name,
            input_count: u64::try_from(row.input_count).map_err(|e| corrupt("input_count", e))?,
            output_count: u64::try_from(row.output_count)
                .map_err(|e| corrupt("output_count", e))?,
            input_fee: parse("input_fee", &row.input_fee)?,
            output_fee: parse("output_fee", &row.output_fee)?,
            previous_output_fee: row
                .previous_output_fee
                .as_deref()
                .map(|v| parse("previous_output_fee", v))
                .transpose()?,
            fee: parse("fee", &row.fee)?,
            nonce: parse("nonce", &row.nonce)?,
            request_hash: row
                .request_hash
                .as_deref()
                .map(|v| parse("request_hash", v))
                .transpose()?,
            signature: serde_json::from_value(row.signature).map_err(|e| corrupt("signature", e))?,
            state: parse("state", &row.state)?,
            claim,
            created_at: row.created_at,
            delivered_at: row.delivered_at,
            settled_at: row.settled_at,
            deleted_at: row.deleted_at,
        })
    }
}

fn id_strings(ids: &[UsageRecordId]) -> Vec<String> {
    ids.iter().map(ToString::to_string).collect()
}

fn to_i64(field: &str, value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|e| corrupt(field, e))
}

/// PostgreSQL-backed `Store`.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool. Migrations are not run.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and apply pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or a migration fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Apply pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Get a reference to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn finish(
        &self,
        ids: &[UsageRecordId],
        owner: InstanceId,
        next: SettlementState,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r"
            UPDATE usage_records
            SET state = $3, settled_at = $4, claim_owner = NULL, claim_expires_at = NULL
            WHERE id = ANY($1)
              AND claim_owner = $2
              AND claim_expires_at > $4
              AND state = 'ack_delivered'
              AND deleted_at IS NULL
            ",
        )
        .bind(id_strings(ids))
        .bind(owner.as_uuid())
        .bind(next.as_str())
        .bind(at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let expected = ids.len() as u64;
        if updated != expected {
            tx.rollback().await?;
            let lost = usize::try_from(expected.saturating_sub(updated)).unwrap_or(usize::MAX);
            return Err(StoreError::ClaimLost(lost));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn locked_record(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        id: &UsageRecordId,
    ) -> Result<UsageRecord> {
        let row: Option<UsageRow> = sqlx::query_as(&format!(
            "{SELECT_USAGE} WHERE id = $1 AND deleted_at IS NULL FOR UPDATE"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut **tx)
        .await?;
        row.ok_or(StoreError::NotFound)?.try_into()
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_usage(&self, record: &UsageRecord) -> Result<()> {
        let pair = record.pair();
        let mut tx = self.pool.begin().await?;

        // Raises the per-pair high-water mark only if the nonce is larger.
        let accepted: Option<String> = sqlx::query_scalar(
            r"
            INSERT INTO usage_nonces (user_address, provider_address, last_nonce)
            VALUES ($1, $2, $3::numeric)
            ON CONFLICT (user_address, provider_address) DO UPDATE
                SET last_nonce = EXCLUDED.last_nonce
                WHERE usage_nonces.last_nonce < EXCLUDED.last_nonce
            RETURNING last_nonce::text
            ",
        )
        .bind(pair.user.to_string())
        .bind(pair.provider.to_string())
        .bind(record.nonce.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        if accepted.is_none() {
            let last: String = sqlx::query_scalar(
                r"
                SELECT last_nonce::text FROM usage_nonces
                WHERE user_address = $1 AND provider_address = $2
                ",
            )
            .bind(pair.user.to_string())
            .bind(pair.provider.to_string())
            .fetch_one(&mut *tx)
            .await?;
            tx.rollback().await?;
            return Err(StoreError::NonceNotIncreasing {
                pair,
                nonce: record.nonce,
                last: parse("last_nonce", &last)?,
            });
        }

        let signature =
            serde_json::to_value(&record.signature).map_err(|e| corrupt("signature", e))?;
        let inserted = sqlx::query(
            r"
            INSERT INTO usage_records (
                id, user_address, provider_address, route, service_name,
                input_count, output_count, input_fee, output_fee, previous_output_fee,
                fee, nonce, request_hash, signature, state,
                claim_owner, claim_expires_at, created_at, delivered_at, settled_at, deleted_at
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8::numeric, $9::numeric, $10::numeric,
                $11::numeric, $12::numeric, $13, $14, $15,
                NULL, NULL, $16, $17, $18, $19
            )
            ",
        )
        .bind(record.id.to_string())
        .bind(pair.user.to_string())
        .bind(pair.provider.to_string())
        .bind(&record.route)
        .bind(&record.service_name)
        .bind(to_i64("input_count", record.input_count)?)
        .bind(to_i64("output_count", record.output_count)?)
        .bind(record.input_fee.to_string())
        .bind(record.output_fee.to_string())
        .bind(record.previous_output_fee.map(|f| f.to_string()))
        .bind(record.fee.to_string())
        .bind(record.nonce.to_string())
        .bind(record.request_hash.as_ref().map(ToString::to_string))
        .bind(signature)
        .bind(record.state.as_str())
        .bind(record.created_at)
        .bind(record.delivered_at)
        .bind(record.settled_at)
        .bind(record.deleted_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                tx.rollback().await?;
                return Err(StoreError::Duplicate(record.id));
            }
            Err(err) => return Err(err.into()),
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_usage(&self, id: &UsageRecordId) -> Result<Option<UsageRecord>> {
        let row: Option<UsageRow> = sqlx::query_as(&format!(
            "{SELECT_USAGE} WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(UsageRecord::try_from).transpose()
    }

    async fn record_delivery(
        &self,
        id: &UsageRecordId,
        output_count: u64,
        output_fee: u128,
        at: DateTime<Utc>,
    ) -> Result<UsageRecord> {
        let mut tx = self.pool.begin().await?;
        let mut record = Self::locked_record(&mut tx, id).await?;
        record.record_delivery(output_count, output_fee, at)?;

        sqlx::query(
            r"
            UPDATE usage_records
            SET output_count = $2, output_fee = $3::numeric, fee = $4::numeric, delivered_at = $5
            WHERE id = $1
            ",
        )
        .bind(id.to_string())
        .bind(to_i64("output_count", record.output_count)?)
        .bind(record.output_fee.to_string())
        .bind(record.fee.to_string())
        .bind(record.delivered_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record)
    }

    async fn soft_delete(&self, id: &UsageRecordId, at: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let record = Self::locked_record(&mut tx, id).await?;
        if record.state != SettlementState::Pending {
            tx.rollback().await?;
            return Err(StoreError::Conflict(format!(
                "cannot delete record {id} in state {}",
                record.state
            )));
        }

        sqlx::query("UPDATE usage_records SET deleted_at = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_usage(&self, filter: &UsageFilter) -> Result<Vec<UsageRecord>> {
        let mut query: QueryBuilder<'_, Postgres> = QueryBuilder::new(SELECT_USAGE);
        query.push(" WHERE TRUE");
        if !filter.include_deleted {
            query.push(" AND deleted_at IS NULL");
        }
        if let Some(state) = filter.state {
            query.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(user) = filter.user {
            query.push(" AND user_address = ").push_bind(user.to_string());
        }
        query.push(" ORDER BY id ASC");
        if let Some(limit) = filter.limit {
            query
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows: Vec<UsageRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(UsageRecord::try_from).collect()
    }

    async fn unsettled_fee(&self, pair: &SettlementPair) -> Result<u128> {
        let total: String = sqlx::query_scalar(
            r"
            SELECT COALESCE(SUM(fee), 0)::text
            FROM usage_records
            WHERE user_address = $1 AND provider_address = $2
              AND deleted_at IS NULL
              AND state IN ('pending', 'ack_delivered')
            ",
        )
        .bind(pair.user.to_string())
        .bind(pair.provider.to_string())
        .fetch_one(&self.pool)
        .await?;
        parse("unsettled_fee", &total)
    }

    async fn promote_delivered(&self) -> Result<usize> {
        let promoted = sqlx::query(
            r"
            UPDATE usage_records
            SET state = 'ack_delivered'
            WHERE state = 'pending' AND delivered_at IS NOT NULL AND deleted_at IS NULL
            ",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(usize::try_from(promoted).unwrap_or(usize::MAX))
    }

    async fn next_settlement_group(
        &self,
        criteria: &GroupCriteria,
        now: DateTime<Utc>,
    ) -> Result<Option<SettlementGroup>> {
        let pair: Option<(String, String)> = sqlx::query_as(
            r"
            SELECT user_address, provider_address
            FROM usage_records
            WHERE deleted_at IS NULL
              AND state = 'ack_delivered'
              AND NOT EXISTS (
                  SELECT 1 FROM usage_records held
                  WHERE held.user_address = usage_records.user_address
                    AND held.provider_address = usage_records.provider_address
                    AND held.deleted_at IS NULL
                    AND held.state = 'ack_delivered'
                    AND held.claim_expires_at > $1
              )
            GROUP BY user_address, provider_address
            HAVING SUM(fee) >= $2::numeric OR MIN(created_at) <= $3
            ORDER BY MIN(created_at) ASC, user_address ASC, provider_address ASC
            LIMIT 1
            ",
        )
        .bind(now)
        .bind(criteria.threshold.to_string())
        .bind(now - criteria.force_after)
        .fetch_optional(&self.pool)
        .await?;

        let Some((user, provider)) = pair else {
            return Ok(None);
        };

        let rows: Vec<UsageRow> = sqlx::query_as(&format!(
            r"{SELECT_USAGE}
            WHERE user_address = $1 AND provider_address = $2
              AND deleted_at IS NULL
              AND state = 'ack_delivered'
              AND (claim_expires_at IS NULL OR claim_expires_at <= $3)
            ORDER BY nonce ASC
            LIMIT $4"
        ))
        .bind(&user)
        .bind(&provider)
        .bind(now)
        .bind(i64::try_from(criteria.limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let records = rows
            .into_iter()
            .map(UsageRecord::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(SettlementGroup {
            pair: SettlementPair {
                user: parse("user_address", &user)?,
                provider: parse("provider_address", &provider)?,
            },
            records,
        }))
    }

    async fn claim(
        &self,
        ids: &[UsageRecordId],
        owner: InstanceId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let ids = id_strings(ids);

        sqlx::query(
            r"
            SELECT 1 FROM usage_nonces
            WHERE (user_address, provider_address) IN (
                SELECT user_address, provider_address FROM usage_records WHERE id = ANY($1)
            )
            FOR UPDATE
            ",
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        let held: bool = sqlx::query_scalar(
            r"
            SELECT EXISTS (
                SELECT 1 FROM usage_records held
                WHERE (held.user_address, held.provider_address) IN (
                    SELECT user_address, provider_address FROM usage_records WHERE id = ANY($1)
                )
                  AND held.deleted_at IS NULL
                  AND held.state = 'ack_delivered'
                  AND held.claim_expires_at > $2
            )
            ",
        )
        .bind(&ids)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        if held {
            tx.rollback().await?;
            return Ok(false);
        }

        let claimed = sqlx::query(
            r"
            UPDATE usage_records
            SET claim_owner = $2, claim_expires_at = $3
            WHERE id = ANY($1)
              AND deleted_at IS NULL
              AND state = 'ack_delivered'
              AND (claim_expires_at IS NULL OR claim_expires_at <= $4)
            ",
        )
        .bind(&ids)
        .bind(owner.as_uuid())
        .bind(expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed != ids.len() as u64 {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn extend_claim(
        &self,
        ids: &[UsageRecordId],
        owner: InstanceId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let extended = sqlx::query(
            r"
            UPDATE usage_records
            SET claim_expires_at = $3
            WHERE id = ANY($1)
              AND claim_owner = $2
              AND claim_expires_at > $4
              AND state = 'ack_delivered'
              AND deleted_at IS NULL
            ",
        )
        .bind(id_strings(ids))
        .bind(owner.as_uuid())
        .bind(expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if extended != ids.len() as u64 {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn release_claim(&self, ids: &[UsageRecordId], owner: InstanceId) -> Result<()> {
        sqlx::query(
            r"
            UPDATE usage_records
            SET claim_owner = NULL, claim_expires_at = NULL
            WHERE id = ANY($1) AND claim_owner = $2
            ",
        )
        .bind(id_strings(ids))
        .bind(owner.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_settled(
        &self,
        ids: &[UsageRecordId],
        owner: InstanceId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.finish(ids, owner, SettlementState::Settled, at).await
    }

    async fn mark_rejected(
        &self,
        ids: &[UsageRecordId],
        owner: InstanceId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.finish(ids, owner, SettlementState::Rejected, at).await
    }
}
