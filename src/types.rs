use std::fmt;
use std::sync::Arc;

use alloy::primitives::{Address, B128, B256, U256};
use chrono::{DateTime, Utc};

/// Identifier of a configured blockchain, e.g. `"ethereum"` or `"arbitrum_nova"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(Arc<str>);

impl ChainId {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChainId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A block as observed by ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub number: u64,
    pub hash: B256,
}

/// Key of a tracked subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WalletContractPair {
    pub wallet: Address,
    pub contract: Address,
}

impl WalletContractPair {
    pub fn new(wallet: Address, contract: Address) -> Self {
        Self { wallet, contract }
    }
}

impl fmt::Display for WalletContractPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.wallet, self.contract)
    }
}

/// What a tracked contract holds for a wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractKind {
    Erc20,
    Nft,
}

impl ContractKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Erc20 => "erc20",
            Self::Nft => "nft",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "erc20" => Some(Self::Erc20),
            "nft" => Some(Self::Nft),
            _ => None,
        }
    }
}

/// A normalized ERC20 movement, derived from call data or a Transfer log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransferDiff {
    pub from: Address,
    pub to: Address,
    pub token: Address,
    pub amount: U256,
    pub block_number: u64,
    pub tx_hash: B256,
}

impl TokenTransferDiff {
    /// Returns `true` if either side of the transfer is `pair`.
    pub fn touches(&self, pair: &WalletContractPair) -> bool {
        self.token == pair.contract && (self.from == pair.wallet || self.to == pair.wallet)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StakeAction {
    Stake,
    Unstake,
}

impl StakeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stake => "stake",
            Self::Unstake => "unstake",
        }
    }
}

/// A change of a wallet's stake on a stake target, in base units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeEvent {
    pub action: StakeAction,
    pub tx_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
    pub user_wallet: Address,
    pub stake_target_id: B128,
    /// Token the stake is denominated in (0 and 1 on the reference staking contract).
    pub token_type: u8,
    pub amount_delta: U256,
    /// Total the contract reports as staked by the wallet on the target after this event.
    pub total_staked: U256,
    pub timestamp: Option<DateTime<Utc>>,
}

impl StakeEvent {
    /// Cursor comment stored with persisted stakes: `"<block>:<log_index>"`.
    pub fn comment(&self) -> String {
        format!("{}:{}", self.block_number, self.log_index)
    }
}

/// Ownership of one NFT token ID by one wallet after netting.
///
/// `net_count` is 1 when the wallet owns the token and 0 when it does not.
/// Any other value after netting from genesis is a consistency violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NftOwnershipDelta {
    pub wallet: Address,
    pub contract: Address,
    pub token_id: U256,
    pub net_count: i8,
    pub block_number: u64,
}

/// New value of a tracked ERC20 balance cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceUpdate {
    pub pair: WalletContractPair,
    pub block_number: u64,
    pub amount: U256,
}

// ============================================================
// Decoded logs
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferErc20Log {
    pub block_number: u64,
    pub contract: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub tx_hash: B256,
    pub log_index: u64,
}

impl TransferErc20Log {
    pub fn to_diff(&self) -> TokenTransferDiff {
        TokenTransferDiff {
            from: self.from,
            to: self.to,
            token: self.contract,
            amount: self.value,
            block_number: self.block_number,
            tx_hash: self.tx_hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferNftLog {
    pub block_number: u64,
    pub contract: Address,
    pub from: Address,
    pub to: Address,
    pub token_id: U256,
    pub tx_hash: B256,
    pub log_index: u64,
}

/// Stake or Unstake log of the staking contract. Both share one layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeLog {
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub user_wallet: Address,
    pub target: B128,
    pub amount: U256,
    pub token_type: u8,
    pub total_staked: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestakeLog {
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub user_wallet: Address,
    pub from_target: B128,
    pub to_target: B128,
    pub amount: U256,
    pub token_type: u8,
    pub total_staked_from: U256,
    pub total_staked_to: U256,
}

/// A log decoded once at the ABI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Erc20Transfer(TransferErc20Log),
    NftTransfer(TransferNftLog),
    Stake(StakeLog),
    Unstake(StakeLog),
    Restake(RestakeLog),
}

impl LogEvent {
    pub fn block_number(&self) -> u64 {
        match self {
            Self::Erc20Transfer(l) => l.block_number,
            Self::NftTransfer(l) => l.block_number,
            Self::Stake(l) | Self::Unstake(l) => l.block_number,
            Self::Restake(l) => l.block_number,
        }
    }
}
