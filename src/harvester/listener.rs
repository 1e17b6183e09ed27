//! Typed subscriber callbacks and the event kinds they subscribe to.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use alloy::primitives::Address;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;

use super::registry::{KindRegistry, Registry};
use crate::types::{
    BalanceUpdate, Block, ChainId, ContractKind, NftOwnershipDelta, StakeEvent, TokenTransferDiff,
    WalletContractPair,
};

type Callback<P> = dyn Fn(ChainId, P) -> BoxFuture<'static, eyre::Result<()>> + Send + Sync;

/// A subscriber callback for payloads of type `P`.
///
/// Cloning shares the callback. Each subscription of a clone gets its own
/// [`ListenerId`], so one callback can be attached to several keys and
/// detached from each of them separately.
pub struct Listener<P> {
    callback: Arc<Callback<P>>,
}

impl<P> Clone for Listener<P> {
    fn clone(&self) -> Self {
        Self {
            callback: self.callback.clone(),
        }
    }
}

impl<P: Send + 'static> Listener<P> {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ChainId, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        Self {
            callback: Arc::new(move |chain, payload| f(chain, payload).boxed()),
        }
    }

    /// Forwards every payload into a bounded channel.
    ///
    /// A full channel holds up the block until the receiver catches up. A
    /// closed receiver fails the delivery.
    pub fn channel(tx: mpsc::Sender<(ChainId, P)>) -> Self {
        Self::new(move |chain, payload| {
            let tx = tx.clone();
            async move {
                tx.send((chain, payload))
                    .await
                    .map_err(|_| eyre::eyre!("listener channel closed"))
            }
        })
    }

    pub(crate) fn call(&self, chain: ChainId, payload: P) -> BoxFuture<'static, eyre::Result<()>> {
        (self.callback)(chain, payload)
    }
}

impl<P> fmt::Debug for Listener<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").finish_non_exhaustive()
    }
}

/// Handle of one subscription, returned by the subscribe calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Which events of a kind a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Chain(ChainId),
    Pair(ChainId, WalletContractPair),
}

impl Scope {
    pub fn chain(&self) -> Option<&ChainId> {
        match self {
            Self::All => None,
            Self::Chain(chain) | Self::Pair(chain, _) => Some(chain),
        }
    }

    pub fn covers(&self, chain: &ChainId) -> bool {
        self.chain().map_or(true, |c| c == chain)
    }
}

#[doc(hidden)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindTag {
    NewBlock,
    TokenTransfer,
    Stake,
    BalanceChange,
    NftOwnership,
}

/// An event kind listeners subscribe to, tying it to its payload type.
pub trait EventKind: Send + Sync + 'static {
    type Payload: Clone + Send + Sync + 'static;

    const NAME: &'static str;

    /// Balance cell a pair subscription of this kind needs, if any.
    const CELL: Option<ContractKind>;

    #[doc(hidden)]
    const TAG: KindTag;

    /// Whether `payload` concerns `pair`. `stake_contract` is the chain's
    /// staking contract.
    fn touches(payload: &Self::Payload, pair: &WalletContractPair, stake_contract: Option<Address>) -> bool;

    #[doc(hidden)]
    fn listeners(registry: &Registry) -> &KindRegistry<Self::Payload>;

    #[doc(hidden)]
    fn listeners_mut(registry: &mut Registry) -> &mut KindRegistry<Self::Payload>;
}

/// A block was ingested. Delivered after every other event of the block.
pub enum NewBlock {}

/// An ERC20 transfer touching a tracked pair.
pub enum TokenTransfer {}

/// A stake or unstake on the chain's staking contract.
pub enum Stake {}

/// A tracked ERC20 balance changed or was initialised.
pub enum BalanceChange {}

/// A tracked wallet gained or lost an NFT.
pub enum NftOwnership {}

impl EventKind for NewBlock {
    type Payload = Block;
    const NAME: &'static str = "new_block";
    const CELL: Option<ContractKind> = None;
    const TAG: KindTag = KindTag::NewBlock;

    fn touches(_: &Block, _: &WalletContractPair, _: Option<Address>) -> bool {
        true
    }

    fn listeners(registry: &Registry) -> &KindRegistry<Block> {
        &registry.new_block
    }

    fn listeners_mut(registry: &mut Registry) -> &mut KindRegistry<Block> {
        &mut registry.new_block
    }
}

impl EventKind for TokenTransfer {
    type Payload = TokenTransferDiff;
    const NAME: &'static str = "token_transfer";
    const CELL: Option<ContractKind> = Some(ContractKind::Erc20);
    const TAG: KindTag = KindTag::TokenTransfer;

    fn touches(diff: &TokenTransferDiff, pair: &WalletContractPair, _: Option<Address>) -> bool {
        diff.touches(pair)
    }

    fn listeners(registry: &Registry) -> &KindRegistry<TokenTransferDiff> {
        &registry.token_transfer
    }

    fn listeners_mut(registry: &mut Registry) -> &mut KindRegistry<TokenTransferDiff> {
        &mut registry.token_transfer
    }
}

impl EventKind for Stake {
    type Payload = StakeEvent;
    const NAME: &'static str = "stake";
    const CELL: Option<ContractKind> = None;
    const TAG: KindTag = KindTag::Stake;

    fn touches(event: &StakeEvent, pair: &WalletContractPair, stake_contract: Option<Address>) -> bool {
        event.user_wallet == pair.wallet && stake_contract == Some(pair.contract)
    }

    fn listeners(registry: &Registry) -> &KindRegistry<StakeEvent> {
        &registry.stake
    }

    fn listeners_mut(registry: &mut Registry) -> &mut KindRegistry<StakeEvent> {
        &mut registry.stake
    }
}

impl EventKind for BalanceChange {
    type Payload = BalanceUpdate;
    const NAME: &'static str = "balance_change";
    const CELL: Option<ContractKind> = Some(ContractKind::Erc20);
    const TAG: KindTag = KindTag::BalanceChange;

    fn touches(update: &BalanceUpdate, pair: &WalletContractPair, _: Option<Address>) -> bool {
        update.pair == *pair
    }

    fn listeners(registry: &Registry) -> &KindRegistry<BalanceUpdate> {
        &registry.balance_change
    }

    fn listeners_mut(registry: &mut Registry) -> &mut KindRegistry<BalanceUpdate> {
        &mut registry.balance_change
    }
}

impl EventKind for NftOwnership {
    type Payload = NftOwnershipDelta;
    const NAME: &'static str = "nft_ownership";
    const CELL: Option<ContractKind> = Some(ContractKind::Nft);
    const TAG: KindTag = KindTag::NftOwnership;

    fn touches(delta: &NftOwnershipDelta, pair: &WalletContractPair, _: Option<Address>) -> bool {
        delta.wallet == pair.wallet && delta.contract == pair.contract
    }

    fn listeners(registry: &Registry) -> &KindRegistry<NftOwnershipDelta> {
        &registry.nft_ownership
    }

    fn listeners_mut(registry: &mut Registry) -> &mut KindRegistry<NftOwnershipDelta> {
        &mut registry.nft_ownership
    }
}
