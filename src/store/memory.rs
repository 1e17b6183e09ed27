use std::collections::{BTreeMap, HashMap};

use alloy::primitives::{Address, B128, B256, U256};
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{parse_stake_comment, PairRecord, Persistence};
use crate::error::Result;
use crate::types::{ChainId, NftOwnershipDelta, StakeEvent, WalletContractPair};

#[derive(Debug, Default)]
struct ChainState {
    cursor: Option<u64>,
    pairs: BTreeMap<WalletContractPair, PairRecord>,
    balances: HashMap<WalletContractPair, (u64, U256)>,
    /// (contract, token_id) → (wallet, block) of the current owner as last seen.
    nft_owners: HashMap<(Address, U256), (Address, u64)>,
    stakes: BTreeMap<(B256, u64, B128), StakeEvent>,
}

/// Keeps everything in process memory. State is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    chains: Mutex<HashMap<ChainId, ChainState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn balance(&self, chain: &ChainId, pair: &WalletContractPair) -> Option<(u64, U256)> {
        let chains = self.chains.lock().await;
        chains.get(chain)?.balances.get(pair).copied()
    }

    pub async fn nft_owner(&self, chain: &ChainId, contract: Address, token_id: U256) -> Option<Address> {
        let chains = self.chains.lock().await;
        chains
            .get(chain)?
            .nft_owners
            .get(&(contract, token_id))
            .map(|(wallet, _)| *wallet)
    }

    pub async fn stake_count(&self, chain: &ChainId) -> usize {
        let chains = self.chains.lock().await;
        chains.get(chain).map_or(0, |c| c.stakes.len())
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn upsert_tracked_pair(&self, chain: &ChainId, record: &PairRecord) -> Result<()> {
        let mut chains = self.chains.lock().await;
        chains
            .entry(chain.clone())
            .or_default()
            .pairs
            .insert(record.pair, *record);
        Ok(())
    }

    async fn remove_tracked_pair(&self, chain: &ChainId, pair: &WalletContractPair) -> Result<()> {
        let mut chains = self.chains.lock().await;
        if let Some(state) = chains.get_mut(chain) {
            state.pairs.remove(pair);
            state.balances.remove(pair);
        }
        Ok(())
    }

    async fn load_tracked_pairs(&self, chain: &ChainId) -> Result<Vec<PairRecord>> {
        let chains = self.chains.lock().await;
        Ok(chains
            .get(chain)
            .map(|c| c.pairs.values().copied().collect())
            .unwrap_or_default())
    }

    async fn upsert_balance_snapshot(
        &self,
        chain: &ChainId,
        pair: &WalletContractPair,
        block_number: u64,
        amount: U256,
    ) -> Result<()> {
        let mut chains = self.chains.lock().await;
        chains
            .entry(chain.clone())
            .or_default()
            .balances
            .insert(*pair, (block_number, amount));
        Ok(())
    }

    async fn upsert_nft_ownership(&self, chain: &ChainId, delta: &NftOwnershipDelta) -> Result<()> {
        let mut chains = self.chains.lock().await;
        let owners = &mut chains.entry(chain.clone()).or_default().nft_owners;
        let key = (delta.contract, delta.token_id);
        if delta.net_count == 1 {
            owners.insert(key, (delta.wallet, delta.block_number));
        } else if owners.get(&key).is_some_and(|(wallet, _)| *wallet == delta.wallet) {
            owners.remove(&key);
        }
        Ok(())
    }

    async fn upsert_stake(&self, chain: &ChainId, event: &StakeEvent) -> Result<()> {
        let mut chains = self.chains.lock().await;
        chains.entry(chain.clone()).or_default().stakes.insert(
            (event.tx_hash, event.log_index, event.stake_target_id),
            event.clone(),
        );
        Ok(())
    }

    async fn latest_stake_comment(&self, chain: &ChainId) -> Result<Option<String>> {
        let chains = self.chains.lock().await;
        Ok(chains.get(chain).and_then(|c| {
            c.stakes
                .values()
                .map(StakeEvent::comment)
                .max_by_key(|comment| parse_stake_comment(comment))
        }))
    }

    async fn save_cursor(&self, chain: &ChainId, block_number: u64) -> Result<()> {
        let mut chains = self.chains.lock().await;
        chains.entry(chain.clone()).or_default().cursor = Some(block_number);
        Ok(())
    }

    async fn load_cursor(&self, chain: &ChainId) -> Result<Option<u64>> {
        let chains = self.chains.lock().await;
        Ok(chains.get(chain).and_then(|c| c.cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContractKind, StakeAction};

    const WALLET: Address = Address::repeat_byte(0x42);
    const TOKEN: Address = Address::repeat_byte(0xaa);

    fn stake(block_number: u64, log_index: u64) -> StakeEvent {
        StakeEvent {
            action: StakeAction::Stake,
            tx_hash: B256::repeat_byte(block_number as u8),
            log_index,
            block_number,
            user_wallet: WALLET,
            stake_target_id: B128::repeat_byte(1),
            token_type: 0,
            amount_delta: U256::from(1),
            total_staked: U256::from(1),
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_pairs_round_trip() {
        let store = MemoryStore::new();
        let chain = ChainId::new("nova");
        let pair = WalletContractPair::new(WALLET, TOKEN);
        let record = PairRecord {
            pair,
            kind: ContractKind::Erc20,
            pinned: true,
        };
        store.upsert_tracked_pair(&chain, &record).await.unwrap();
        store.upsert_tracked_pair(&chain, &record).await.unwrap();
        assert_eq!(store.load_tracked_pairs(&chain).await.unwrap(), vec![record]);

        store.remove_tracked_pair(&chain, &pair).await.unwrap();
        assert!(store.load_tracked_pairs(&chain).await.unwrap().is_empty());
        assert!(store
            .load_tracked_pairs(&ChainId::new("other"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_latest_stake_comment_orders_numerically() {
        let store = MemoryStore::new();
        let chain = ChainId::new("nova");
        assert_eq!(store.latest_stake_comment(&chain).await.unwrap(), None);

        store.upsert_stake(&chain, &stake(9, 3)).await.unwrap();
        store.upsert_stake(&chain, &stake(10, 0)).await.unwrap();
        store.upsert_stake(&chain, &stake(10, 2)).await.unwrap();
        assert_eq!(
            store.latest_stake_comment(&chain).await.unwrap().as_deref(),
            Some("10:2")
        );
    }

    #[tokio::test]
    async fn test_nft_ownership_moves() {
        let store = MemoryStore::new();
        let chain = ChainId::new("nova");
        let delta = |wallet, net_count| NftOwnershipDelta {
            wallet,
            contract: TOKEN,
            token_id: U256::from(7),
            net_count,
            block_number: 1,
        };
        store.upsert_nft_ownership(&chain, &delta(WALLET, 1)).await.unwrap();
        // A stale "not owned" from another wallet does not clear the owner.
        store
            .upsert_nft_ownership(&chain, &delta(Address::ZERO, 0))
            .await
            .unwrap();
        assert_eq!(store.nft_owner(&chain, TOKEN, U256::from(7)).await, Some(WALLET));
        store.upsert_nft_ownership(&chain, &delta(WALLET, 0)).await.unwrap();
        assert_eq!(store.nft_owner(&chain, TOKEN, U256::from(7)).await, None);
    }

    #[tokio::test]
    async fn test_cursor() {
        let store = MemoryStore::new();
        let chain = ChainId::new("nova");
        assert_eq!(store.load_cursor(&chain).await.unwrap(), None);
        store.save_cursor(&chain, 42).await.unwrap();
        assert_eq!(store.load_cursor(&chain).await.unwrap(), Some(42));
    }
}
