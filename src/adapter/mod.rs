//! Chain adapters: wire access, ABI decoding and block ingestion per chain.

pub mod codec;
pub mod connector;
pub mod evm;
pub mod fetcher;

use std::future::Future;
use std::sync::Arc;

use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::Log;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

pub use crate::config::IngestionMode;
use crate::diff::NftHoldings;
use crate::error::{DecodeError, Result};
use crate::types::{Block, ChainId, StakeEvent, TokenTransferDiff, TransferErc20Log, TransferNftLog};
use codec::{AbiKind, DecodedCall};
use connector::LogQuery;

/// What an adapter hands to its block listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingestion {
    /// Push mode: one block with the transfer diffs decoded from its transactions.
    Block {
        block: Block,
        transfers: Vec<TokenTransferDiff>,
    },
    /// Pull mode: the head moved; blocks `from..=block.number` are new.
    Head { from: u64, block: Block },
}

impl Ingestion {
    /// Inclusive block range this event covers.
    pub fn range(&self) -> (u64, u64) {
        match self {
            Self::Block { block, .. } => (block.number, block.number),
            Self::Head { from, block } => (*from, block.number),
        }
    }

    pub fn block(&self) -> Block {
        match self {
            Self::Block { block, .. } | Self::Head { block, .. } => *block,
        }
    }
}

/// The single ingestion callback of an adapter.
///
/// In pull mode an error leaves the cursor where it was so the range is
/// retried on the next tick. In push mode the block is skipped.
pub type BlockListener = Arc<dyn Fn(ChainId, Ingestion) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wraps an async closure as a [`BlockListener`].
pub fn block_listener<F, Fut>(f: F) -> BlockListener
where
    F: Fn(ChainId, Ingestion) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |chain, ingestion| f(chain, ingestion).boxed())
}

/// Chain-agnostic operations of one configured blockchain.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain(&self) -> &ChainId;

    fn mode(&self) -> IngestionMode;

    /// Staking contract whose events `stake_logs` reports, if configured.
    fn stake_contract(&self) -> Option<Address>;

    /// Last block handed to the listener, `None` before the first one.
    fn cursor(&self) -> Option<u64>;

    /// Marks `block` as handled so ingestion continues at `block + 1`.
    fn resume_from(&self, block: u64);

    async fn last_block_number(&self) -> Result<u64>;

    /// `balanceOf(wallet)` on `token`, pinned to `at_block`.
    async fn balance_of(&self, wallet: Address, token: Address, at_block: u64) -> Result<U256>;

    fn decode_call_data(&self, abi: AbiKind, data: &[u8]) -> std::result::Result<DecodedCall, DecodeError>;

    async fn get_logs(
        &self,
        topic0: Option<B256>,
        topic1: Option<B256>,
        topic2: Option<B256>,
        addresses: &[Address],
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>>;

    async fn get_logs_recursively(&self, query: LogQuery, depth: u32) -> Result<Vec<Log>>;

    /// ERC20 Transfer logs of `contracts` in `[from, to]`.
    async fn token_logs(&self, from: u64, to: u64, contracts: &[Address]) -> Result<Vec<TransferErc20Log>>;

    /// ERC721 Transfer logs of `contracts` in `[from, to]`.
    async fn nft_logs(&self, from: u64, to: u64, contracts: &[Address]) -> Result<Vec<TransferNftLog>>;

    /// Token IDs of `contract` held by `wallet` at `at_block`, by netting
    /// its transfer history from genesis.
    async fn nft_holdings(&self, contract: Address, wallet: Address, at_block: u64) -> Result<NftHoldings>;

    /// Stake events of the configured staking contract in `[from, to]`.
    async fn stake_logs(&self, from: u64, to: u64) -> Result<Vec<StakeEvent>>;

    /// Every ERC20 Transfer of `token` sent or received by `wallet` up to `to`.
    async fn transfer_history(&self, wallet: Address, token: Address, to: u64) -> Result<Vec<TransferErc20Log>>;

    /// Replaces the ingestion callback.
    fn register_block_listener(&self, listener: BlockListener);

    /// Runs the ingestion loop until `shutdown` fires or the adapter fails.
    async fn run(&self, shutdown: CancellationToken) -> Result<()>;
}
