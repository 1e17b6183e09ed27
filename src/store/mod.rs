//! Durable state of the harvester: tracked pairs, cursors and derived snapshots.

pub mod memory;
pub mod postgres;

use alloy::primitives::U256;
use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ChainId, ContractKind, NftOwnershipDelta, StakeEvent, WalletContractPair};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// A tracked pair as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairRecord {
    pub pair: WalletContractPair,
    pub kind: ContractKind,
    /// Tracked through the wallet × contract matrix rather than a listener.
    pub pinned: bool,
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn upsert_tracked_pair(&self, chain: &ChainId, record: &PairRecord) -> Result<()>;

    async fn remove_tracked_pair(&self, chain: &ChainId, pair: &WalletContractPair) -> Result<()>;

    async fn load_tracked_pairs(&self, chain: &ChainId) -> Result<Vec<PairRecord>>;

    async fn upsert_balance_snapshot(
        &self,
        chain: &ChainId,
        pair: &WalletContractPair,
        block_number: u64,
        amount: U256,
    ) -> Result<()>;

    async fn upsert_nft_ownership(&self, chain: &ChainId, delta: &NftOwnershipDelta) -> Result<()>;

    async fn upsert_stake(&self, chain: &ChainId, event: &StakeEvent) -> Result<()>;

    /// Comment of the most recent persisted stake, `"<block>:<log_index>"`.
    async fn latest_stake_comment(&self, chain: &ChainId) -> Result<Option<String>>;

    async fn save_cursor(&self, chain: &ChainId, block_number: u64) -> Result<()>;

    async fn load_cursor(&self, chain: &ChainId) -> Result<Option<u64>>;
}

/// Splits a stake comment into `(block, log_index)`.
pub fn parse_stake_comment(comment: &str) -> Option<(u64, u64)> {
    let (block, index) = comment.split_once(':')?;
    Some((block.trim().parse().ok()?, index.trim().parse().ok()?))
}
