use std::str::FromStr;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use super::{PairRecord, Persistence};
use crate::config::DatabaseConfig;
use crate::error::{HarvestError, Result};
use crate::types::{ChainId, ContractKind, NftOwnershipDelta, StakeEvent, WalletContractPair};

/// Postgres-backed store. Amounts are NUMERIC(78, 0), addresses BYTEA.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects and runs pending migrations.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_numeric(value: U256) -> Result<BigDecimal> {
    BigDecimal::from_str(&value.to_string())
        .map_err(|e| HarvestError::Persistence(format!("cannot store {} as NUMERIC: {}", value, e)))
}

fn to_address(bytes: &[u8]) -> Result<Address> {
    if bytes.len() != 20 {
        return Err(HarvestError::Persistence(format!(
            "stored address has {} bytes",
            bytes.len()
        )));
    }
    Ok(Address::from_slice(bytes))
}

fn to_block(number: u64) -> Result<i64> {
    i64::try_from(number)
        .map_err(|_| HarvestError::Persistence(format!("block {} does not fit BIGINT", number)))
}

#[async_trait]
impl Persistence for PgStore {
    /// Insert or update a tracked pair.
    async fn upsert_tracked_pair(&self, chain: &ChainId, record: &PairRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO tracked_pairs (chain, wallet, contract, kind, pinned, created_at)
             VALUES ($1, $2, $3, $4, $5, NOW())
             ON CONFLICT (chain, wallet, contract) DO UPDATE
             SET kind = $4, pinned = $5",
        )
        .bind(chain.as_str())
        .bind(record.pair.wallet.as_slice())
        .bind(record.pair.contract.as_slice())
        .bind(record.kind.as_str())
        .bind(record.pinned)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete a tracked pair together with its balance snapshot.
    async fn remove_tracked_pair(&self, chain: &ChainId, pair: &WalletContractPair) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM tracked_pairs WHERE chain = $1 AND wallet = $2 AND contract = $3")
            .bind(chain.as_str())
            .bind(pair.wallet.as_slice())
            .bind(pair.contract.as_slice())
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "DELETE FROM balance_snapshots WHERE chain = $1 AND wallet = $2 AND contract = $3",
        )
        .bind(chain.as_str())
        .bind(pair.wallet.as_slice())
        .bind(pair.contract.as_slice())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load_tracked_pairs(&self, chain: &ChainId) -> Result<Vec<PairRecord>> {
        let rows: Vec<(Vec<u8>, Vec<u8>, String, bool)> = sqlx::query_as(
            "SELECT wallet, contract, kind, pinned FROM tracked_pairs
             WHERE chain = $1
             ORDER BY created_at",
        )
        .bind(chain.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for (wallet, contract, kind, pinned) in rows {
            let Some(kind) = ContractKind::parse(&kind) else {
                tracing::warn!(chain = %chain, kind = %kind, "Unknown contract kind in tracked_pairs, skipping");
                continue;
            };
            records.push(PairRecord {
                pair: WalletContractPair::new(to_address(&wallet)?, to_address(&contract)?),
                kind,
                pinned,
            });
        }
        Ok(records)
    }

    /// Keep the latest balance of a pair. Older blocks never overwrite newer ones.
    async fn upsert_balance_snapshot(
        &self,
        chain: &ChainId,
        pair: &WalletContractPair,
        block_number: u64,
        amount: U256,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO balance_snapshots (chain, wallet, contract, block_number, amount, updated_at)
             VALUES ($1, $2, $3, $4, $5, NOW())
             ON CONFLICT (chain, wallet, contract) DO UPDATE
             SET block_number = $4, amount = $5, updated_at = NOW()
             WHERE balance_snapshots.block_number <= $4",
        )
        .bind(chain.as_str())
        .bind(pair.wallet.as_slice())
        .bind(pair.contract.as_slice())
        .bind(to_block(block_number)?)
        .bind(to_numeric(amount)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_nft_ownership(&self, chain: &ChainId, delta: &NftOwnershipDelta) -> Result<()> {
        sqlx::query(
            "INSERT INTO nft_ownership (chain, contract, token_id, wallet, owned, block_number)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (chain, contract, token_id, wallet) DO UPDATE
             SET owned = $5, block_number = $6
             WHERE nft_ownership.block_number <= $6",
        )
        .bind(chain.as_str())
        .bind(delta.contract.as_slice())
        .bind(to_numeric(delta.token_id)?)
        .bind(delta.wallet.as_slice())
        .bind(delta.net_count == 1)
        .bind(to_block(delta.block_number)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_stake(&self, chain: &ChainId, event: &StakeEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO stakes (chain, tx_hash, log_index, stake_target, action, wallet,
                token_type, amount, total_staked, block_number, block_time, comment)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (chain, tx_hash, log_index, stake_target) DO UPDATE
             SET total_staked = $9, block_time = COALESCE($11, stakes.block_time)",
        )
        .bind(chain.as_str())
        .bind(event.tx_hash.as_slice())
        .bind(event.log_index as i64)
        .bind(event.stake_target_id.as_slice())
        .bind(event.action.as_str())
        .bind(event.user_wallet.as_slice())
        .bind(event.token_type as i16)
        .bind(to_numeric(event.amount_delta)?)
        .bind(to_numeric(event.total_staked)?)
        .bind(to_block(event.block_number)?)
        .bind(event.timestamp)
        .bind(event.comment())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn latest_stake_comment(&self, chain: &ChainId) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT comment FROM stakes
             WHERE chain = $1
             ORDER BY block_number DESC, log_index DESC
             LIMIT 1",
        )
        .bind(chain.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(c,)| c))
    }

    /// Upsert the ingestion checkpoint of a chain.
    async fn save_cursor(&self, chain: &ChainId, block_number: u64) -> Result<()> {
        sqlx::query(
            "INSERT INTO harvester_cursors (chain, block_number, updated_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (chain) DO UPDATE
             SET block_number = $2, updated_at = NOW()",
        )
        .bind(chain.as_str())
        .bind(to_block(block_number)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_cursor(&self, chain: &ChainId) -> Result<Option<u64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT block_number FROM harvester_cursors WHERE chain = $1")
                .bind(chain.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(b,)| b as u64))
    }
}
