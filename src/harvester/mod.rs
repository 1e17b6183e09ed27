//! Subscription core: per-chain adapters, the listener registry and fan-out.

mod dispatch;
pub mod listener;
mod pipeline;
mod registry;

use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use alloy::primitives::{Address, U256};

use crate::adapter::{block_listener, ChainAdapter, Ingestion};
use crate::config::HarvesterConfig;
use crate::diff::balance::replay_balance;
use crate::diff::{Cell, ConsistencyReport};
use crate::error::{HarvestError, Result};
use crate::store::{parse_stake_comment, Persistence};
use crate::types::{ChainId, ContractKind, WalletContractPair};

pub use listener::{
    BalanceChange, EventKind, Listener, ListenerId, NewBlock, NftOwnership, Scope, Stake, TokenTransfer,
};
pub use pipeline::{ChainPipeline, IngestionResult};
use registry::{ChainEntry, PairChange, Registry};

pub(crate) struct Inner {
    registry: RwLock<Registry>,
    store: Arc<dyn Persistence>,
    config: HarvesterConfig,
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Binds one adapter per chain, tracks wallet/contract pairs and pushes
/// derived events to listeners.
///
/// Cheap to clone; clones share state. Constructed once by the composition
/// root and passed to whoever needs it.
#[derive(Clone)]
pub struct Harvester {
    inner: Arc<Inner>,
}

fn parse_address(value: &str) -> Result<Address> {
    let trimmed = value.trim();
    if trimmed.len() != 42 || !trimmed.starts_with("0x") {
        return Err(HarvestError::InvalidAddress(value.to_string()));
    }
    Address::from_str(trimmed).map_err(|_| HarvestError::InvalidAddress(value.to_string()))
}

impl Harvester {
    pub fn new(store: Arc<dyn Persistence>, config: HarvesterConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: RwLock::new(Registry::default()),
                store,
                config,
            }),
        }
    }

    /// Binds `adapter` to its chain and becomes its block listener.
    ///
    /// Restores the persisted cursor and pinned pairs. Pairs that were only
    /// held by listeners of a previous process are dropped.
    pub async fn register_adapter(&self, adapter: Arc<dyn ChainAdapter>) -> Result<()> {
        let chain = adapter.chain().clone();
        let duplicate = || HarvestError::Subscription(format!("an adapter for '{}' is already registered", chain));
        if self.inner.read().chains.contains_key(&chain) {
            return Err(duplicate());
        }

        let store = &self.inner.store;
        let cursor = store.load_cursor(&chain).await?;
        let records = store.load_tracked_pairs(&chain).await?;
        let stake_resume = store
            .latest_stake_comment(&chain)
            .await?
            .as_deref()
            .and_then(parse_stake_comment);

        let pipeline = ChainPipeline {
            cursor,
            stake_resume,
            ..Default::default()
        };

        let mut stale = Vec::new();
        let restored = {
            let mut registry = self.inner.write();
            if registry.chains.contains_key(&chain) {
                return Err(duplicate());
            }
            let mut entry = ChainEntry::new(adapter.clone(), pipeline);
            for record in &records {
                if record.pinned {
                    entry.pin(record.pair, record.kind);
                } else {
                    stale.push(record.pair);
                }
            }
            let restored = entry.pairs.len();
            registry.chains.insert(chain.clone(), entry);
            restored
        };

        for pair in stale {
            if let Err(e) = store.remove_tracked_pair(&chain, &pair).await {
                tracing::warn!(chain = %chain, pair = %pair, error = %e, "Failed to drop stale pair");
            }
        }

        if let Some(cursor) = cursor {
            adapter.resume_from(cursor);
        }

        let weak = Arc::downgrade(&self.inner);
        adapter.register_block_listener(block_listener(move |chain, ingestion| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.process(&chain, ingestion).await.map(|_| ()),
                    None => Ok(()),
                }
            }
        }));

        tracing::info!(
            chain = %chain,
            mode = ?adapter.mode(),
            cursor = ?adapter.cursor(),
            restored_pairs = restored,
            "Adapter registered"
        );
        Ok(())
    }

    /// Processes one ingestion event of `chain` as its adapter would deliver it.
    pub async fn ingest(&self, chain: &ChainId, ingestion: Ingestion) -> Result<IngestionResult> {
        self.inner.process(chain, ingestion).await
    }

    pub fn adapter(&self, chain: &ChainId) -> Result<Arc<dyn ChainAdapter>> {
        Ok(self.inner.read().chain(chain)?.adapter.clone())
    }

    /// Subscribes to every `K` event, of one chain or of all chains.
    pub fn subscribe<K: EventKind>(
        &self,
        chain: Option<&ChainId>,
        listener: Listener<K::Payload>,
    ) -> Result<ListenerId> {
        let mut registry = self.inner.write();
        let scope = match chain {
            Some(chain) => {
                registry.chain(chain)?;
                Scope::Chain(chain.clone())
            }
            None => Scope::All,
        };
        let id = registry.next_id();
        K::listeners_mut(&mut registry).insert(id, scope.clone(), listener);
        registry.record_subscription(id, K::TAG, scope);
        tracing::debug!(listener = %id, kind = K::NAME, "Subscribed");
        Ok(id)
    }

    /// Subscribes to `K` events of one wallet/contract pair and starts
    /// tracking the pair if nothing tracked it yet.
    pub async fn subscribe_for_wallet_and_contract<K: EventKind>(
        &self,
        chain: &ChainId,
        wallet: &str,
        contract: &str,
        listener: Listener<K::Payload>,
    ) -> Result<ListenerId> {
        let pair = WalletContractPair::new(parse_address(wallet)?, parse_address(contract)?);

        let (id, change) = {
            let mut registry = self.inner.write();
            registry.chain(chain)?;
            let id = registry.next_id();
            let change = registry.chain_mut(chain)?.attach(pair, K::CELL, id);
            let scope = Scope::Pair(chain.clone(), pair);
            K::listeners_mut(&mut registry).insert(id, scope.clone(), listener);
            registry.record_subscription(id, K::TAG, scope);
            (id, change)
        };

        self.persist_pair(chain, change).await;
        tracing::info!(chain = %chain, pair = %pair, listener = %id, kind = K::NAME, "Subscribed to pair");
        Ok(id)
    }

    /// Detaches a listener. A pair left without listeners and not pinned is
    /// no longer tracked.
    pub async fn unsubscribe(&self, id: ListenerId) -> Result<()> {
        let (scope, change) = {
            let mut registry = self.inner.write();
            let scope = registry.remove_listener(id)?;
            let change = match &scope {
                Scope::Pair(chain, pair) => registry
                    .chains
                    .get_mut(chain)
                    .map_or(PairChange::Unchanged, |entry| entry.detach(pair, id)),
                _ => PairChange::Unchanged,
            };
            (scope, change)
        };

        if let Some(chain) = scope.chain() {
            if let PairChange::Remove(pair) = &change {
                tracing::info!(chain = %chain, pair = %pair, "Pair no longer tracked");
            }
            self.persist_pair(chain, change).await;
        }
        tracing::debug!(listener = %id, "Unsubscribed");
        Ok(())
    }

    /// Tracks `wallet` against every token and NFT contract of the chain.
    pub async fn add_wallet(&self, chain: &ChainId, wallet: &str) -> Result<()> {
        let wallet = parse_address(wallet)?;
        let changes = {
            let mut registry = self.inner.write();
            let entry = registry.chain_mut(chain)?;
            if !entry.wallets.insert(wallet) {
                return Err(HarvestError::Subscription(format!(
                    "wallet {} already tracked on '{}'",
                    wallet, chain
                )));
            }
            let contracts: Vec<(Address, ContractKind)> = entry
                .token_contracts
                .iter()
                .map(|c| (*c, ContractKind::Erc20))
                .chain(entry.nft_contracts.iter().map(|c| (*c, ContractKind::Nft)))
                .collect();
            contracts
                .into_iter()
                .map(|(contract, kind)| entry.pin(WalletContractPair::new(wallet, contract), kind))
                .collect::<Vec<_>>()
        };

        for change in changes {
            self.persist_pair(chain, change).await;
        }
        tracing::info!(chain = %chain, wallet = %wallet, "Wallet added");
        Ok(())
    }

    pub async fn remove_wallet(&self, chain: &ChainId, wallet: &str) -> Result<()> {
        let wallet = parse_address(wallet)?;
        let changes = {
            let mut registry = self.inner.write();
            let entry = registry.chain_mut(chain)?;
            if !entry.wallets.remove(&wallet) {
                return Err(HarvestError::Subscription(format!(
                    "wallet {} is not tracked on '{}'",
                    wallet, chain
                )));
            }
            let contracts: Vec<Address> = entry
                .token_contracts
                .iter()
                .chain(entry.nft_contracts.iter())
                .copied()
                .collect();
            contracts
                .into_iter()
                .map(|contract| entry.unpin(&WalletContractPair::new(wallet, contract)))
                .collect::<Vec<_>>()
        };

        for change in changes {
            self.persist_pair(chain, change).await;
        }
        tracing::info!(chain = %chain, wallet = %wallet, "Wallet removed");
        Ok(())
    }

    /// Tracks every wallet of the chain against an ERC20 contract.
    pub async fn add_token_contract(&self, chain: &ChainId, contract: &str) -> Result<()> {
        self.add_contract(chain, contract, ContractKind::Erc20).await
    }

    /// Tracks every wallet of the chain against an NFT contract.
    pub async fn add_nft_contract(&self, chain: &ChainId, contract: &str) -> Result<()> {
        self.add_contract(chain, contract, ContractKind::Nft).await
    }

    pub async fn remove_token_contract(&self, chain: &ChainId, contract: &str) -> Result<()> {
        self.remove_contract(chain, contract, ContractKind::Erc20).await
    }

    pub async fn remove_nft_contract(&self, chain: &ChainId, contract: &str) -> Result<()> {
        self.remove_contract(chain, contract, ContractKind::Nft).await
    }

    async fn add_contract(&self, chain: &ChainId, contract: &str, kind: ContractKind) -> Result<()> {
        let contract = parse_address(contract)?;
        let changes = {
            let mut registry = self.inner.write();
            let entry = registry.chain_mut(chain)?;
            if entry.token_contracts.contains(&contract) || entry.nft_contracts.contains(&contract) {
                return Err(HarvestError::Subscription(format!(
                    "contract {} already tracked on '{}'",
                    contract, chain
                )));
            }
            match kind {
                ContractKind::Erc20 => entry.token_contracts.insert(contract),
                ContractKind::Nft => entry.nft_contracts.insert(contract),
            };
            let wallets: Vec<Address> = entry.wallets.iter().copied().collect();
            wallets
                .into_iter()
                .map(|wallet| entry.pin(WalletContractPair::new(wallet, contract), kind))
                .collect::<Vec<_>>()
        };

        for change in changes {
            self.persist_pair(chain, change).await;
        }
        tracing::info!(chain = %chain, contract = %contract, kind = kind.as_str(), "Contract added");
        Ok(())
    }

    async fn remove_contract(&self, chain: &ChainId, contract: &str, kind: ContractKind) -> Result<()> {
        let contract = parse_address(contract)?;
        let changes = {
            let mut registry = self.inner.write();
            let entry = registry.chain_mut(chain)?;
            let removed = match kind {
                ContractKind::Erc20 => entry.token_contracts.remove(&contract),
                ContractKind::Nft => entry.nft_contracts.remove(&contract),
            };
            if !removed {
                return Err(HarvestError::Subscription(format!(
                    "{} contract {} is not tracked on '{}'",
                    kind.as_str(),
                    contract,
                    chain
                )));
            }
            let wallets: Vec<Address> = entry.wallets.iter().copied().collect();
            wallets
                .into_iter()
                .map(|wallet| entry.unpin(&WalletContractPair::new(wallet, contract)))
                .collect::<Vec<_>>()
        };

        for change in changes {
            self.persist_pair(chain, change).await;
        }
        tracing::info!(chain = %chain, contract = %contract, kind = kind.as_str(), "Contract removed");
        Ok(())
    }

    async fn persist_pair(&self, chain: &ChainId, change: PairChange) {
        let store = &self.inner.store;
        let result = match &change {
            PairChange::Unchanged => return,
            PairChange::Upsert(record) => store.upsert_tracked_pair(chain, record).await,
            PairChange::Remove(pair) => store.remove_tracked_pair(chain, pair).await,
        };
        if let Err(e) = result {
            tracing::warn!(chain = %chain, change = ?change, error = %e, "Failed to persist tracked pair");
        }
    }

    /// Pairs currently tracked on `chain`, sorted.
    pub fn tracked_pairs(&self, chain: &ChainId) -> Result<Vec<WalletContractPair>> {
        let registry = self.inner.read();
        let mut pairs: Vec<WalletContractPair> = registry.chain(chain)?.pairs.keys().copied().collect();
        pairs.sort();
        Ok(pairs)
    }

    /// Current balance cell of a pair, `None` until it is initialised.
    pub async fn balance(&self, chain: &ChainId, pair: &WalletContractPair) -> Result<Option<Cell>> {
        let pipeline = self.inner.read().chain(chain)?.pipeline.clone();
        let pipeline = pipeline.lock().await;
        Ok(pipeline.book.get(pair).cloned())
    }

    /// Compares `balanceOf` at `at_block` with a replay of every Transfer
    /// log of the wallet up to that block.
    ///
    /// Disagreement is reported, not raised: it means the log history is
    /// incomplete or the token moves balances without Transfer events.
    pub async fn verify_balance(
        &self,
        chain: &ChainId,
        wallet: &str,
        token: &str,
        at_block: u64,
    ) -> Result<ConsistencyReport> {
        let pair = WalletContractPair::new(parse_address(wallet)?, parse_address(token)?);
        let adapter = self.adapter(chain)?;

        let via_call = self
            .inner
            .bounded(adapter.balance_of(pair.wallet, pair.contract, at_block))
            .await?;
        let history = self
            .inner
            .bounded(adapter.transfer_history(pair.wallet, pair.contract, at_block))
            .await?;
        let via_logs = match replay_balance(pair.wallet, &history) {
            Ok(balance) => Some(balance),
            Err(e) => {
                tracing::warn!(chain = %chain, pair = %pair, error = %e, "Log replay incomplete");
                None
            }
        };

        let report = ConsistencyReport {
            pair,
            block_number: at_block,
            via_call,
            via_logs,
        };
        if !report.is_consistent() {
            tracing::warn!(
                chain = %chain,
                pair = %pair,
                block = at_block,
                via_call = %via_call,
                via_logs = %via_logs.map_or_else(|| "n/a".to_string(), |v: U256| v.to_string()),
                "Consistency violation: balanceOf disagrees with log replay"
            );
        }
        Ok(report)
    }
}
