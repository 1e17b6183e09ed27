use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use alloy::primitives::Address;
use tokio::sync::Mutex;

use super::listener::{KindTag, Listener, ListenerId, Scope};
use super::pipeline::ChainPipeline;
use crate::adapter::ChainAdapter;
use crate::error::{HarvestError, Result};
use crate::store::PairRecord;
use crate::types::{
    BalanceUpdate, Block, ChainId, ContractKind, NftOwnershipDelta, StakeEvent, TokenTransferDiff,
    WalletContractPair,
};

/// Listeners of one event kind, in subscription order.
pub struct KindRegistry<P> {
    entries: BTreeMap<ListenerId, (Scope, Listener<P>)>,
}

impl<P> Default for KindRegistry<P> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<P> KindRegistry<P> {
    pub(crate) fn insert(&mut self, id: ListenerId, scope: Scope, listener: Listener<P>) {
        self.entries.insert(id, (scope, listener));
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub(crate) fn covering<'a>(
        &'a self,
        chain: &'a ChainId,
    ) -> impl Iterator<Item = (ListenerId, &'a Scope, &'a Listener<P>)> + 'a {
        self.entries
            .iter()
            .filter(move |(_, (scope, _))| scope.covers(chain))
            .map(|(id, (scope, listener))| (*id, scope, listener))
    }

    pub(crate) fn any_covering(&self, chain: &ChainId) -> bool {
        self.covering(chain).next().is_some()
    }
}

/// Tracking state of one wallet/contract pair.
#[derive(Debug, Clone, Default)]
pub(crate) struct TrackedPair {
    /// `None` for pairs only followed by block or stake listeners.
    pub cell: Option<ContractKind>,
    pub listeners: HashSet<ListenerId>,
    pub pinned: bool,
}

/// What a registry change means for the persisted pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PairChange {
    Unchanged,
    Upsert(PairRecord),
    Remove(WalletContractPair),
}

pub(crate) struct ChainEntry {
    pub adapter: Arc<dyn ChainAdapter>,
    pub pipeline: Arc<Mutex<ChainPipeline>>,
    pub stake_contract: Option<Address>,
    pub pairs: HashMap<WalletContractPair, TrackedPair>,
    /// Pairs whose balance cell must be initialised before the next block.
    pub pending: BTreeSet<WalletContractPair>,
    pub wallets: BTreeSet<Address>,
    pub token_contracts: BTreeSet<Address>,
    pub nft_contracts: BTreeSet<Address>,
}

impl ChainEntry {
    pub fn new(adapter: Arc<dyn ChainAdapter>, pipeline: ChainPipeline) -> Self {
        Self {
            stake_contract: adapter.stake_contract(),
            adapter,
            pipeline: Arc::new(Mutex::new(pipeline)),
            pairs: HashMap::new(),
            pending: BTreeSet::new(),
            wallets: BTreeSet::new(),
            token_contracts: BTreeSet::new(),
            nft_contracts: BTreeSet::new(),
        }
    }

    fn record(pair: WalletContractPair, tracked: &TrackedPair) -> PairChange {
        match tracked.cell {
            Some(kind) => PairChange::Upsert(PairRecord {
                pair,
                kind,
                pinned: tracked.pinned,
            }),
            None => PairChange::Unchanged,
        }
    }

    // A contract registered as NFT always gets an NFT cell.
    fn cell_for(&self, pair: &WalletContractPair, wanted: Option<ContractKind>) -> Option<ContractKind> {
        wanted.map(|kind| {
            if self.nft_contracts.contains(&pair.contract) {
                ContractKind::Nft
            } else {
                kind
            }
        })
    }

    fn track(&mut self, pair: WalletContractPair, cell: Option<ContractKind>) -> (&mut TrackedPair, bool) {
        let cell = self.cell_for(&pair, cell);
        let tracked = self.pairs.entry(pair).or_default();
        let mut changed = false;
        if tracked.cell.is_none() && cell.is_some() {
            tracked.cell = cell;
            self.pending.insert(pair);
            changed = true;
        }
        (tracked, changed)
    }

    pub fn attach(&mut self, pair: WalletContractPair, cell: Option<ContractKind>, id: ListenerId) -> PairChange {
        let (tracked, changed) = self.track(pair, cell);
        tracked.listeners.insert(id);
        if changed {
            Self::record(pair, tracked)
        } else {
            PairChange::Unchanged
        }
    }

    pub fn detach(&mut self, pair: &WalletContractPair, id: ListenerId) -> PairChange {
        let Some(tracked) = self.pairs.get_mut(pair) else {
            return PairChange::Unchanged;
        };
        tracked.listeners.remove(&id);
        self.release(pair)
    }

    pub fn pin(&mut self, pair: WalletContractPair, kind: ContractKind) -> PairChange {
        let (tracked, changed) = self.track(pair, Some(kind));
        if tracked.pinned && !changed {
            return PairChange::Unchanged;
        }
        tracked.pinned = true;
        Self::record(pair, tracked)
    }

    pub fn unpin(&mut self, pair: &WalletContractPair) -> PairChange {
        let Some(tracked) = self.pairs.get_mut(pair) else {
            return PairChange::Unchanged;
        };
        if !tracked.pinned {
            return PairChange::Unchanged;
        }
        tracked.pinned = false;
        match self.release(pair) {
            PairChange::Unchanged => {
                let tracked = &self.pairs[pair];
                Self::record(*pair, tracked)
            }
            change => change,
        }
    }

    // Untracks a pair nothing holds on to any more.
    fn release(&mut self, pair: &WalletContractPair) -> PairChange {
        let idle = self
            .pairs
            .get(pair)
            .is_some_and(|t| t.listeners.is_empty() && !t.pinned);
        if !idle {
            return PairChange::Unchanged;
        }
        let tracked = self.pairs.remove(pair);
        self.pending.remove(pair);
        match tracked.and_then(|t| t.cell) {
            Some(_) => PairChange::Remove(*pair),
            None => PairChange::Unchanged,
        }
    }

    /// Pairs with a balance cell, by kind.
    pub fn cells(&self) -> HashMap<WalletContractPair, ContractKind> {
        self.pairs
            .iter()
            .filter_map(|(pair, t)| t.cell.map(|kind| (*pair, kind)))
            .collect()
    }

    /// Removes `wanted` from the pending set, returning those still tracked.
    pub fn take_pending(&mut self, wanted: &[WalletContractPair]) -> Vec<(WalletContractPair, ContractKind)> {
        let mut taken = Vec::new();
        for pair in wanted {
            if !self.pending.remove(pair) {
                continue;
            }
            if let Some(kind) = self.pairs.get(pair).and_then(|t| t.cell) {
                taken.push((*pair, kind));
            }
        }
        taken
    }

    pub fn requeue(&mut self, pairs: impl IntoIterator<Item = WalletContractPair>) {
        for pair in pairs {
            if self.pairs.get(&pair).is_some_and(|t| t.cell.is_some()) {
                self.pending.insert(pair);
            }
        }
    }
}

/// Every listener and tracked pair of a harvester.
#[derive(Default)]
pub struct Registry {
    next_id: u64,
    pub(crate) chains: HashMap<ChainId, ChainEntry>,
    subscriptions: HashMap<ListenerId, (KindTag, Scope)>,
    pub(crate) new_block: KindRegistry<Block>,
    pub(crate) token_transfer: KindRegistry<TokenTransferDiff>,
    pub(crate) stake: KindRegistry<StakeEvent>,
    pub(crate) balance_change: KindRegistry<BalanceUpdate>,
    pub(crate) nft_ownership: KindRegistry<NftOwnershipDelta>,
}

impl Registry {
    pub(crate) fn next_id(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }

    pub(crate) fn chain(&self, chain: &ChainId) -> Result<&ChainEntry> {
        self.chains
            .get(chain)
            .ok_or_else(|| HarvestError::UnknownChain(chain.to_string()))
    }

    pub(crate) fn chain_mut(&mut self, chain: &ChainId) -> Result<&mut ChainEntry> {
        self.chains
            .get_mut(chain)
            .ok_or_else(|| HarvestError::UnknownChain(chain.to_string()))
    }

    pub(crate) fn record_subscription(&mut self, id: ListenerId, tag: KindTag, scope: Scope) {
        self.subscriptions.insert(id, (tag, scope));
    }

    /// Drops a listener from its kind and returns the scope it had.
    pub(crate) fn remove_listener(&mut self, id: ListenerId) -> Result<Scope> {
        let (tag, scope) = self
            .subscriptions
            .remove(&id)
            .ok_or_else(|| HarvestError::Subscription(format!("unknown {}", id)))?;
        match tag {
            KindTag::NewBlock => self.new_block.remove(id),
            KindTag::TokenTransfer => self.token_transfer.remove(id),
            KindTag::Stake => self.stake.remove(id),
            KindTag::BalanceChange => self.balance_change.remove(id),
            KindTag::NftOwnership => self.nft_ownership.remove(id),
        };
        Ok(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::evm::EvmAdapter;
    use crate::config::{HarvesterConfig, IngestionMode};
    use crate::testing::{chain_config, FakeChain};

    const WALLET: Address = Address::repeat_byte(0x42);
    const TOKEN: Address = Address::repeat_byte(0xaa);
    const NFT: Address = Address::repeat_byte(0x1f);

    fn entry() -> ChainEntry {
        let adapter = EvmAdapter::new(
            &chain_config("nova", IngestionMode::Pull),
            &HarvesterConfig::default(),
            Arc::new(FakeChain::new(0)),
        )
        .unwrap();
        ChainEntry::new(Arc::new(adapter), ChainPipeline::default())
    }

    #[test]
    fn test_attach_detach_lifecycle() {
        let mut entry = entry();
        let pair = WalletContractPair::new(WALLET, TOKEN);
        let (a, b) = (ListenerId(1), ListenerId(2));

        let change = entry.attach(pair, Some(ContractKind::Erc20), a);
        assert!(matches!(change, PairChange::Upsert(PairRecord { pinned: false, .. })));
        assert_eq!(entry.attach(pair, Some(ContractKind::Erc20), b), PairChange::Unchanged);
        assert!(entry.pending.contains(&pair));

        assert_eq!(entry.detach(&pair, a), PairChange::Unchanged);
        assert_eq!(entry.detach(&pair, b), PairChange::Remove(pair));
        assert!(entry.pairs.is_empty());
        assert!(entry.pending.is_empty());
    }

    #[test]
    fn test_block_listener_pair_has_no_cell() {
        let mut entry = entry();
        let pair = WalletContractPair::new(WALLET, TOKEN);
        assert_eq!(entry.attach(pair, None, ListenerId(1)), PairChange::Unchanged);
        assert!(entry.cells().is_empty());
        assert!(entry.pending.is_empty());

        // A later balance listener upgrades the pair.
        assert!(matches!(
            entry.attach(pair, Some(ContractKind::Erc20), ListenerId(2)),
            PairChange::Upsert(_)
        ));
        assert_eq!(entry.cells().get(&pair), Some(&ContractKind::Erc20));
    }

    #[test]
    fn test_registered_nft_contract_gets_nft_cell() {
        let mut entry = entry();
        entry.nft_contracts.insert(NFT);
        let pair = WalletContractPair::new(WALLET, NFT);
        entry.attach(pair, Some(ContractKind::Erc20), ListenerId(1));
        assert_eq!(entry.cells().get(&pair), Some(&ContractKind::Nft));
    }

    #[test]
    fn test_pinned_pair_survives_detach() {
        let mut entry = entry();
        let pair = WalletContractPair::new(WALLET, TOKEN);
        entry.pin(pair, ContractKind::Erc20);
        entry.attach(pair, Some(ContractKind::Erc20), ListenerId(1));
        assert_eq!(entry.detach(&pair, ListenerId(1)), PairChange::Unchanged);
        assert!(entry.pairs.contains_key(&pair));

        assert_eq!(entry.unpin(&pair), PairChange::Remove(pair));
        assert!(entry.pairs.is_empty());
    }

    #[test]
    fn test_unpin_keeps_pair_with_listeners() {
        let mut entry = entry();
        let pair = WalletContractPair::new(WALLET, TOKEN);
        entry.attach(pair, Some(ContractKind::Erc20), ListenerId(1));
        entry.pin(pair, ContractKind::Erc20);
        assert_eq!(
            entry.unpin(&pair),
            PairChange::Upsert(PairRecord {
                pair,
                kind: ContractKind::Erc20,
                pinned: false,
            })
        );
    }

    #[test]
    fn test_take_pending_only_wanted() {
        let mut entry = entry();
        let first = WalletContractPair::new(WALLET, TOKEN);
        let second = WalletContractPair::new(Address::repeat_byte(1), TOKEN);
        entry.pin(first, ContractKind::Erc20);
        entry.pin(second, ContractKind::Erc20);

        let taken = entry.take_pending(&[first]);
        assert_eq!(taken, vec![(first, ContractKind::Erc20)]);
        assert!(entry.pending.contains(&second));

        entry.requeue([first, WalletContractPair::new(WALLET, NFT)]);
        assert!(entry.pending.contains(&first));
        assert_eq!(entry.pending.len(), 2);
    }

    #[test]
    fn test_remove_unknown_listener() {
        let mut registry = Registry::default();
        assert!(matches!(
            registry.remove_listener(ListenerId(9)),
            Err(HarvestError::Subscription(_))
        ));
    }
}
