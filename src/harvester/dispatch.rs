//! Concurrent delivery of one block's events to listeners.

use alloy::primitives::Address;
use tokio::task::JoinHandle;

use super::listener::{EventKind, Listener, ListenerId, Scope};
use super::registry::Registry;
use crate::error::{HarvestError, Result};
use crate::types::ChainId;

/// Payloads bound for one listener, in delivery order.
pub(crate) struct Delivery<P> {
    id: ListenerId,
    listener: Listener<P>,
    payloads: Vec<P>,
}

/// Matches `payloads` of kind `K` against every listener covering `chain`.
pub(crate) fn deliveries<K: EventKind>(
    registry: &Registry,
    chain: &ChainId,
    stake_contract: Option<Address>,
    payloads: &[K::Payload],
) -> Vec<Delivery<K::Payload>> {
    if payloads.is_empty() {
        return Vec::new();
    }
    K::listeners(registry)
        .covering(chain)
        .filter_map(|(id, scope, listener)| {
            let matched: Vec<K::Payload> = match scope {
                Scope::All | Scope::Chain(_) => payloads.to_vec(),
                Scope::Pair(_, pair) => payloads
                    .iter()
                    .filter(|p| K::touches(p, pair, stake_contract))
                    .cloned()
                    .collect(),
            };
            (!matched.is_empty()).then(|| Delivery {
                id,
                listener: listener.clone(),
                payloads: matched,
            })
        })
        .collect()
}

/// In-flight deliveries of one block. Every listener runs in its own task;
/// a listener sees its payloads one at a time, in order.
pub(crate) struct FanOut {
    chain: ChainId,
    block: u64,
    handles: Vec<(String, JoinHandle<Vec<String>>)>,
}

impl FanOut {
    pub fn new(chain: ChainId, block: u64) -> Self {
        Self {
            chain,
            block,
            handles: Vec::new(),
        }
    }

    pub fn spawn<P: Send + 'static>(&mut self, kind: &'static str, deliveries: Vec<Delivery<P>>) {
        for delivery in deliveries {
            let label = format!("{} ({})", delivery.id, kind);
            let chain = self.chain.clone();
            let handle = tokio::spawn(async move {
                let mut errors = Vec::new();
                for payload in delivery.payloads {
                    if let Err(e) = delivery.listener.call(chain.clone(), payload).await {
                        errors.push(e.to_string());
                    }
                }
                errors
            });
            self.handles.push((label, handle));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every delivery. Failures and panics are collected into
    /// [`HarvestError::Dispatch`] once all listeners are done.
    pub async fn join(self) -> Result<()> {
        let mut failures = Vec::new();
        for (label, handle) in self.handles {
            match handle.await {
                Ok(errors) => {
                    for error in errors {
                        tracing::warn!(
                            chain = %self.chain,
                            block = self.block,
                            listener = %label,
                            error = %error,
                            "Listener failed"
                        );
                        failures.push(format!("{}: {}", label, error));
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        chain = %self.chain,
                        block = self.block,
                        listener = %label,
                        error = %e,
                        "Listener panicked"
                    );
                    failures.push(format!("{}: {}", label, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HarvestError::Dispatch(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvester::listener::{NewBlock, TokenTransfer};
    use crate::types::{Block, TokenTransferDiff, WalletContractPair};
    use alloy::primitives::{B256, U256};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const WALLET: Address = Address::repeat_byte(0x42);
    const TOKEN: Address = Address::repeat_byte(0xaa);

    fn diff(to: Address) -> TokenTransferDiff {
        TokenTransferDiff {
            from: Address::repeat_byte(1),
            to,
            token: TOKEN,
            amount: U256::from(1),
            block_number: 3,
            tx_hash: B256::ZERO,
        }
    }

    fn block(number: u64) -> Block {
        Block {
            number,
            hash: B256::ZERO,
        }
    }

    #[test]
    fn test_pair_scope_filters_payloads() {
        let nova = ChainId::new("nova");
        let mut registry = Registry::default();
        let pair = WalletContractPair::new(WALLET, TOKEN);
        let noop = Listener::<TokenTransferDiff>::new(|_, _| async { Ok(()) });
        registry
            .token_transfer
            .insert(ListenerId(1), Scope::Pair(nova.clone(), pair), noop.clone());
        registry.token_transfer.insert(ListenerId(2), Scope::All, noop.clone());
        registry
            .token_transfer
            .insert(ListenerId(3), Scope::Chain(ChainId::new("ethereum")), noop);

        let payloads = vec![diff(WALLET), diff(Address::repeat_byte(9))];
        let matched = deliveries::<TokenTransfer>(&registry, &nova, None, &payloads);
        let counts: Vec<(ListenerId, usize)> = matched.iter().map(|d| (d.id, d.payloads.len())).collect();
        assert_eq!(counts, vec![(ListenerId(1), 1), (ListenerId(2), 2)]);
    }

    #[tokio::test]
    async fn test_failures_are_isolated_and_aggregated() {
        let nova = ChainId::new("nova");
        let mut registry = Registry::default();
        let delivered = Arc::new(AtomicUsize::new(0));

        registry.new_block.insert(
            ListenerId(1),
            Scope::All,
            Listener::new(|_, _| async { Err(eyre::eyre!("listener refused")) }),
        );
        registry.new_block.insert(
            ListenerId(2),
            Scope::All,
            Listener::new(|_, b: Block| async move {
                if b.number == 1 {
                    panic!("listener bug");
                }
                Ok(())
            }),
        );
        registry.new_block.insert(
            ListenerId(3),
            Scope::All,
            Listener::new({
                let delivered = delivered.clone();
                move |_, _| {
                    let delivered = delivered.clone();
                    async move {
                        delivered.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }
            }),
        );

        let mut fan_out = FanOut::new(nova.clone(), 1);
        fan_out.spawn(
            "new_block",
            deliveries::<NewBlock>(&registry, &nova, None, &[block(1), block(2)]),
        );
        match fan_out.join().await {
            Err(HarvestError::Dispatch(failures)) => {
                assert_eq!(failures.len(), 3);
                assert!(failures.iter().any(|f| f.starts_with("listener#2")));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }
}
