use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use tokio::sync::Mutex;

use super::dispatch::{deliveries, FanOut};
use super::listener::{BalanceChange, EventKind, NewBlock, NftOwnership, Stake, TokenTransfer};
use super::Inner;
use crate::adapter::connector::retry_rpc;
use crate::adapter::{ChainAdapter, Ingestion};
use crate::diff::transfers::{diffs_from_logs, filter_tracked};
use crate::diff::{BalanceBook, BlockChanges, Cell, StakeLedger};
use crate::error::{HarvestError, Result};
use crate::types::{
    BalanceUpdate, Block, ChainId, ContractKind, NftOwnershipDelta, StakeEvent, TokenTransferDiff,
    WalletContractPair,
};

/// Derived state of one chain, mutated only while a block is processed.
#[derive(Debug, Default)]
pub struct ChainPipeline {
    pub(crate) book: BalanceBook,
    pub(crate) stakes: StakeLedger,
    /// Last block fully processed, `None` before the first.
    pub(crate) cursor: Option<u64>,
    /// (block, log index) of the newest stake already delivered.
    pub(crate) stake_resume: Option<(u64, u64)>,
}

/// Counters of one processed ingestion event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestionResult {
    pub cells_initialised: u64,
    pub transfers: u64,
    pub balance_updates: u64,
    pub nft_updates: u64,
    pub stakes: u64,
    pub resyncs: u64,
    pub dispatch_failures: u64,
}

#[derive(Debug, Default)]
struct BlockEvents {
    transfers: Vec<TokenTransferDiff>,
    balances: Vec<BalanceUpdate>,
    ownership: Vec<NftOwnershipDelta>,
    stakes: Vec<StakeEvent>,
}

// What the registry looked like when the block arrived.
struct Snapshot {
    adapter: Arc<dyn ChainAdapter>,
    pipeline: Arc<Mutex<ChainPipeline>>,
    stake_contract: Option<Address>,
    cells: HashMap<WalletContractPair, ContractKind>,
    pending: Vec<WalletContractPair>,
    wants_stakes: bool,
}

impl Snapshot {
    fn pairs(&self, kind: ContractKind) -> HashSet<WalletContractPair> {
        self.cells
            .iter()
            .filter(|(_, k)| **k == kind)
            .map(|(pair, _)| *pair)
            .collect()
    }

    fn contracts(&self, kind: ContractKind) -> Vec<Address> {
        self.pairs(kind)
            .into_iter()
            .map(|pair| pair.contract)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl Inner {
    fn snapshot(&self, chain: &ChainId) -> Result<Snapshot> {
        let registry = self.read();
        let entry = registry.chain(chain)?;
        Ok(Snapshot {
            adapter: entry.adapter.clone(),
            pipeline: entry.pipeline.clone(),
            stake_contract: entry.stake_contract,
            cells: entry.cells(),
            pending: entry.pending.iter().copied().collect(),
            wants_stakes: entry.stake_contract.is_some() && registry.stake.any_covering(chain),
        })
    }

    // get_logs_recursively is bounded by depth only; this bounds it in time.
    pub(super) async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let ms = self.config.query_timeout_ms;
        tokio::time::timeout(Duration::from_millis(ms), fut)
            .await
            .map_err(|_| HarvestError::Timeout(ms))?
    }

    async fn init_cell(
        &self,
        adapter: &dyn ChainAdapter,
        pair: WalletContractPair,
        kind: ContractKind,
        at_block: u64,
    ) -> Result<Cell> {
        let attempts = self.config.init_retry_attempts;
        match kind {
            ContractKind::Erc20 => self
                .bounded(retry_rpc(attempts, || {
                    adapter.balance_of(pair.wallet, pair.contract, at_block)
                }))
                .await
                .map(Cell::Erc20),
            ContractKind::Nft => self
                .bounded(retry_rpc(attempts, || {
                    adapter.nft_holdings(pair.contract, pair.wallet, at_block)
                }))
                .await
                .map(|holdings| Cell::Nft(holdings.owned)),
        }
    }

    /// Turns one ingestion event into derived events and delivers them.
    ///
    /// Query failures are returned before any state changes, so a pull-mode
    /// range can be retried as a whole. Listener failures never fail the block.
    pub(crate) async fn process(&self, chain: &ChainId, ingestion: Ingestion) -> Result<IngestionResult> {
        let (from, to) = ingestion.range();
        let head = ingestion.block();
        let snapshot = self.snapshot(chain)?;
        let mut pipeline = snapshot.pipeline.lock().await;

        if pipeline.cursor.is_some_and(|cursor| to <= cursor) {
            tracing::debug!(chain = %chain, from, to, cursor = ?pipeline.cursor, "Range already processed");
            return Ok(IngestionResult::default());
        }

        // 1. Queries. Nothing is mutated until all of them succeed.
        let adapter = snapshot.adapter.as_ref();
        let transfers = match ingestion {
            Ingestion::Block { transfers, .. } => transfers,
            Ingestion::Head { .. } => {
                let contracts = snapshot.contracts(ContractKind::Erc20);
                diffs_from_logs(&self.bounded(adapter.token_logs(from, to, &contracts)).await?)
            }
        };
        let transfers = filter_tracked(transfers, &snapshot.pairs(ContractKind::Erc20));

        let nft_contracts = snapshot.contracts(ContractKind::Nft);
        let nft_logs = self.bounded(adapter.nft_logs(from, to, &nft_contracts)).await?;

        let stakes: Vec<StakeEvent> = if snapshot.wants_stakes {
            let resume = pipeline.stake_resume;
            self.bounded(adapter.stake_logs(from, to))
                .await?
                .into_iter()
                .filter(|s| resume.map_or(true, |pos| (s.block_number, s.log_index) > pos))
                .collect()
        } else {
            Vec::new()
        };

        // 2. Initialise cells of newly tracked pairs just before the range.
        let pending = self.write().chain_mut(chain)?.take_pending(&snapshot.pending);
        let tracked: HashSet<WalletContractPair> = snapshot.cells.keys().copied().collect();
        pipeline.book.retain_tracked(&tracked);

        let mut result = IngestionResult::default();
        let mut events: BTreeMap<u64, BlockEvents> = BTreeMap::new();
        let mut requeue = Vec::new();
        let at_block = from.saturating_sub(1);

        for (pair, kind) in pending {
            match self.init_cell(adapter, pair, kind, at_block).await {
                Ok(cell) => {
                    let slot = events.entry(at_block).or_default();
                    match &cell {
                        Cell::Erc20(amount) => slot.balances.push(BalanceUpdate {
                            pair,
                            block_number: at_block,
                            amount: *amount,
                        }),
                        Cell::Nft(owned) => slot.ownership.extend(owned.iter().map(|token_id| {
                            NftOwnershipDelta {
                                wallet: pair.wallet,
                                contract: pair.contract,
                                token_id: *token_id,
                                net_count: 1,
                                block_number: at_block,
                            }
                        })),
                    }
                    pipeline.book.insert(pair, cell);
                    result.cells_initialised += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        chain = %chain,
                        pair = %pair,
                        block = at_block,
                        error = %e,
                        "Failed to initialise balance, will retry next block"
                    );
                    requeue.push(pair);
                }
            }
        }

        // 3. Apply the range to the book and the stake ledger.
        let mut changes = BlockChanges::default();
        for (diff, _) in &transfers {
            pipeline.book.apply_transfer(diff, &mut changes);
        }
        for log in &nft_logs {
            pipeline.book.apply_nft(log, &mut changes);
        }
        for stake in &stakes {
            if let Err(e) = pipeline.stakes.apply(stake) {
                tracing::warn!(
                    chain = %chain,
                    wallet = %stake.user_wallet,
                    target = %stake.stake_target_id,
                    block = stake.block_number,
                    error = %e,
                    "Stake ledger out of sync with contract"
                );
            }
        }

        result.resyncs = changes.resync.len() as u64;
        requeue.extend(changes.resync.iter().copied());
        if let Some(last) = stakes.last() {
            pipeline.stake_resume = Some((last.block_number, last.log_index));
        }
        pipeline.cursor = Some(to);
        drop(pipeline);

        if !requeue.is_empty() {
            if let Ok(entry) = self.write().chain_mut(chain) {
                entry.requeue(requeue);
            }
        }

        for (diff, _) in transfers {
            events.entry(diff.block_number).or_default().transfers.push(diff);
        }
        for update in changes.balances {
            events.entry(update.block_number).or_default().balances.push(update);
        }
        for delta in changes.ownership {
            events.entry(delta.block_number).or_default().ownership.push(delta);
        }
        for stake in stakes {
            events.entry(stake.block_number).or_default().stakes.push(stake);
        }

        // 4. Deliver block by block, then announce the block itself.
        for (number, block_events) in &events {
            result.transfers += block_events.transfers.len() as u64;
            result.balance_updates += block_events.balances.len() as u64;
            result.nft_updates += block_events.ownership.len() as u64;
            result.stakes += block_events.stakes.len() as u64;
            result.dispatch_failures += self
                .deliver(chain, *number, snapshot.stake_contract, block_events)
                .await;
        }
        result.dispatch_failures += self.announce(chain, head).await;

        // 5. Persist what changed, cursor last.
        self.persist(chain, to, &events).await;

        if result == IngestionResult::default() {
            tracing::debug!(chain = %chain, from, to, "Processed blocks");
        } else {
            tracing::info!(
                chain = %chain,
                from,
                to,
                initialised = result.cells_initialised,
                transfers = result.transfers,
                balance_updates = result.balance_updates,
                nft_updates = result.nft_updates,
                stakes = result.stakes,
                resyncs = result.resyncs,
                dispatch_failures = result.dispatch_failures,
                "Processed blocks"
            );
        }
        Ok(result)
    }

    // Returns the number of failed deliveries.
    async fn deliver(
        &self,
        chain: &ChainId,
        number: u64,
        stake_contract: Option<Address>,
        events: &BlockEvents,
    ) -> u64 {
        let mut fan_out = FanOut::new(chain.clone(), number);
        {
            let registry = self.read();
            fan_out.spawn(
                TokenTransfer::NAME,
                deliveries::<TokenTransfer>(&registry, chain, stake_contract, &events.transfers),
            );
            fan_out.spawn(
                BalanceChange::NAME,
                deliveries::<BalanceChange>(&registry, chain, stake_contract, &events.balances),
            );
            fan_out.spawn(
                NftOwnership::NAME,
                deliveries::<NftOwnership>(&registry, chain, stake_contract, &events.ownership),
            );
            fan_out.spawn(
                Stake::NAME,
                deliveries::<Stake>(&registry, chain, stake_contract, &events.stakes),
            );
        }
        failures(fan_out).await
    }

    async fn announce(&self, chain: &ChainId, block: Block) -> u64 {
        let mut fan_out = FanOut::new(chain.clone(), block.number);
        {
            let registry = self.read();
            fan_out.spawn(
                NewBlock::NAME,
                deliveries::<NewBlock>(&registry, chain, None, &[block]),
            );
        }
        failures(fan_out).await
    }

    async fn persist(&self, chain: &ChainId, cursor: u64, events: &BTreeMap<u64, BlockEvents>) {
        let mut failed = 0u64;
        for block_events in events.values() {
            for update in &block_events.balances {
                if let Err(e) = self
                    .store
                    .upsert_balance_snapshot(chain, &update.pair, update.block_number, update.amount)
                    .await
                {
                    tracing::warn!(chain = %chain, pair = %update.pair, error = %e, "Failed to persist balance");
                    failed += 1;
                }
            }
            for delta in &block_events.ownership {
                if let Err(e) = self.store.upsert_nft_ownership(chain, delta).await {
                    tracing::warn!(chain = %chain, contract = %delta.contract, error = %e, "Failed to persist NFT ownership");
                    failed += 1;
                }
            }
            for stake in &block_events.stakes {
                if let Err(e) = self.store.upsert_stake(chain, stake).await {
                    tracing::warn!(chain = %chain, tx = %stake.tx_hash, error = %e, "Failed to persist stake");
                    failed += 1;
                }
            }
        }

        // A cursor past unsaved rows would skip them on restart.
        if failed > 0 {
            tracing::warn!(chain = %chain, failed, "Cursor not saved after persistence failures");
            return;
        }
        if let Err(e) = self.store.save_cursor(chain, cursor).await {
            tracing::warn!(chain = %chain, cursor, error = %e, "Failed to persist cursor");
        }
    }
}

async fn failures(fan_out: FanOut) -> u64 {
    if fan_out.is_empty() {
        return 0;
    }
    match fan_out.join().await {
        Ok(()) => 0,
        Err(HarvestError::Dispatch(failures)) => failures.len() as u64,
        Err(e) => {
            tracing::warn!(error = %e, "Dispatch failed");
            1
        }
    }
}
