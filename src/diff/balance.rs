use std::collections::{BTreeSet, HashMap, HashSet};

use alloy::primitives::{Address, B256, U256};

use crate::error::HarvestError;
use crate::types::{
    BalanceUpdate, NftOwnershipDelta, TokenTransferDiff, TransferErc20Log, TransferNftLog,
    WalletContractPair,
};

/// Derived state of one tracked pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Erc20(U256),
    Nft(BTreeSet<U256>),
}

/// What applying one block to the book produced.
#[derive(Debug, Default)]
pub struct BlockChanges {
    pub balances: Vec<BalanceUpdate>,
    pub ownership: Vec<NftOwnershipDelta>,
    /// Pairs whose cell became inconsistent and must be initialised again.
    pub resync: Vec<WalletContractPair>,
}

/// Balance cells of every initialised pair on one chain.
#[derive(Debug, Default)]
pub struct BalanceBook {
    cells: HashMap<WalletContractPair, Cell>,
}

impl BalanceBook {
    pub fn insert(&mut self, pair: WalletContractPair, cell: Cell) {
        self.cells.insert(pair, cell);
    }

    pub fn get(&self, pair: &WalletContractPair) -> Option<&Cell> {
        self.cells.get(pair)
    }

    pub fn remove(&mut self, pair: &WalletContractPair) -> Option<Cell> {
        self.cells.remove(pair)
    }

    /// Drops every cell whose pair is no longer tracked.
    pub fn retain_tracked(&mut self, tracked: &HashSet<WalletContractPair>) {
        self.cells.retain(|pair, _| tracked.contains(pair));
    }

    pub fn apply_transfer(&mut self, diff: &TokenTransferDiff, changes: &mut BlockChanges) {
        let debit = WalletContractPair::new(diff.from, diff.token);
        if let Some(Cell::Erc20(balance)) = self.cells.get_mut(&debit) {
            match balance.checked_sub(diff.amount) {
                Some(next) => {
                    *balance = next;
                    push_balance(changes, debit, diff.block_number, next);
                }
                None => {
                    tracing::warn!(
                        pair = %debit,
                        block = diff.block_number,
                        balance = %balance,
                        amount = %diff.amount,
                        "Consistency violation: balance would go negative, resyncing"
                    );
                    self.cells.remove(&debit);
                    changes.resync.push(debit);
                }
            }
        }

        let credit = WalletContractPair::new(diff.to, diff.token);
        if let Some(Cell::Erc20(balance)) = self.cells.get_mut(&credit) {
            *balance = balance.saturating_add(diff.amount);
            let next = *balance;
            push_balance(changes, credit, diff.block_number, next);
        }
    }

    pub fn apply_nft(&mut self, log: &TransferNftLog, changes: &mut BlockChanges) {
        let sender = WalletContractPair::new(log.from, log.contract);
        if let Some(Cell::Nft(owned)) = self.cells.get_mut(&sender) {
            if owned.remove(&log.token_id) {
                changes.ownership.push(ownership(sender, log, 0));
            } else {
                tracing::warn!(
                    pair = %sender,
                    token_id = %log.token_id,
                    block = log.block_number,
                    "Consistency violation: transfer of a token the wallet did not hold"
                );
                self.cells.remove(&sender);
                changes.resync.push(sender);
            }
        }

        let receiver = WalletContractPair::new(log.to, log.contract);
        if let Some(Cell::Nft(owned)) = self.cells.get_mut(&receiver) {
            owned.insert(log.token_id);
            changes.ownership.push(ownership(receiver, log, 1));
        }
    }
}

// One update per pair per block: later transfers in the block overwrite.
fn push_balance(changes: &mut BlockChanges, pair: WalletContractPair, block_number: u64, amount: U256) {
    if let Some(existing) = changes
        .balances
        .iter_mut()
        .find(|u| u.pair == pair && u.block_number == block_number)
    {
        existing.amount = amount;
        return;
    }
    changes.balances.push(BalanceUpdate {
        pair,
        block_number,
        amount,
    });
}

fn ownership(pair: WalletContractPair, log: &TransferNftLog, net_count: i8) -> NftOwnershipDelta {
    NftOwnershipDelta {
        wallet: pair.wallet,
        contract: pair.contract,
        token_id: log.token_id,
        net_count,
        block_number: log.block_number,
    }
}

/// Rebuilds a wallet's balance from every Transfer log touching it.
///
/// Logs may arrive twice (once as incoming, once as outgoing); duplicates
/// by (tx hash, log index) are replayed once.
pub fn replay_balance(wallet: Address, logs: &[TransferErc20Log]) -> Result<U256, HarvestError> {
    let mut ordered: Vec<&TransferErc20Log> = logs.iter().collect();
    ordered.sort_by_key(|l| (l.block_number, l.log_index));
    let mut seen: HashSet<(B256, u64)> = HashSet::new();

    let mut balance = U256::ZERO;
    for log in ordered {
        if !seen.insert((log.tx_hash, log.log_index)) {
            continue;
        }
        if log.from == wallet {
            balance = balance.checked_sub(log.value).ok_or_else(|| {
                HarvestError::Consistency(format!(
                    "replayed balance of {} goes negative at block {}",
                    wallet, log.block_number
                ))
            })?;
        }
        if log.to == wallet {
            balance = balance.saturating_add(log.value);
        }
    }
    Ok(balance)
}

/// Outcome of comparing a balance read via `balanceOf` with a log replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub pair: WalletContractPair,
    pub block_number: u64,
    pub via_call: U256,
    /// `None` when the replay itself went negative (missing history).
    pub via_logs: Option<U256>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.via_logs == Some(self.via_call)
    }
}
