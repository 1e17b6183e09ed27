use std::collections::{BTreeSet, HashMap};

use alloy::primitives::{Address, U256};

use crate::types::{NftOwnershipDelta, TransferNftLog};

/// Result of netting a wallet's NFT transfer history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NftHoldings {
    pub owned: BTreeSet<U256>,
    /// Token IDs whose net count fell outside {0, 1}.
    pub violations: Vec<NftOwnershipDelta>,
}

fn clamp(net: i64) -> i8 {
    net.clamp(i8::MIN as i64, i8::MAX as i64) as i8
}

/// Nets a wallet's incoming and outgoing Transfer logs of one contract.
///
/// A token is owned when incoming minus outgoing is exactly 1. Logs that
/// appear in both lists (self-transfers) cancel out.
pub fn net_holdings(
    contract: Address,
    wallet: Address,
    incoming: &[TransferNftLog],
    outgoing: &[TransferNftLog],
    at_block: u64,
) -> NftHoldings {
    let mut net: HashMap<U256, i64> = HashMap::new();
    for log in incoming.iter().filter(|l| l.to == wallet) {
        *net.entry(log.token_id).or_default() += 1;
    }
    for log in outgoing.iter().filter(|l| l.from == wallet) {
        *net.entry(log.token_id).or_default() -= 1;
    }

    let mut holdings = NftHoldings::default();
    for (token_id, count) in net {
        match count {
            1 => {
                holdings.owned.insert(token_id);
            }
            0 => {}
            other => holdings.violations.push(NftOwnershipDelta {
                wallet,
                contract,
                token_id,
                net_count: clamp(other),
                block_number: at_block,
            }),
        }
    }
    holdings.violations.sort_by_key(|v| v.token_id);
    holdings
}

/// Net transfer counts per (contract, token, wallet) over a replayed stream.
///
/// The zero address is the mint source and burn sink and is not counted.
#[derive(Debug, Default)]
pub struct NftLedger {
    counts: HashMap<(Address, U256), HashMap<Address, i64>>,
}

impl NftLedger {
    pub fn apply(&mut self, log: &TransferNftLog) {
        let wallets = self.counts.entry((log.contract, log.token_id)).or_default();
        if log.from != Address::ZERO {
            *wallets.entry(log.from).or_default() -= 1;
        }
        if log.to != Address::ZERO {
            *wallets.entry(log.to).or_default() += 1;
        }
    }

    pub fn net(&self, contract: Address, token_id: U256, wallet: Address) -> i64 {
        self.counts
            .get(&(contract, token_id))
            .and_then(|w| w.get(&wallet))
            .copied()
            .unwrap_or(0)
    }

    /// Wallets currently netting to 1 for a token.
    pub fn owners(&self, contract: Address, token_id: U256) -> Vec<Address> {
        let mut owners: Vec<Address> = self
            .counts
            .get(&(contract, token_id))
            .map(|w| {
                w.iter()
                    .filter(|(_, n)| **n == 1)
                    .map(|(a, _)| *a)
                    .collect()
            })
            .unwrap_or_default();
        owners.sort();
        owners
    }

    /// Every (wallet, token) whose count is outside {0, 1}, plus tokens
    /// with more than one owner.
    pub fn violations(&self, at_block: u64) -> Vec<NftOwnershipDelta> {
        let mut out = Vec::new();
        for ((contract, token_id), wallets) in &self.counts {
            let owners = wallets.values().filter(|n| **n == 1).count();
            for (wallet, net) in wallets {
                if !(0..=1).contains(net) || (owners > 1 && *net == 1) {
                    out.push(NftOwnershipDelta {
                        wallet: *wallet,
                        contract: *contract,
                        token_id: *token_id,
                        net_count: clamp(*net),
                        block_number: at_block,
                    });
                }
            }
        }
        out.sort_by_key(|v| (v.token_id, v.wallet));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;

    const CONTRACT: Address = Address::repeat_byte(0x1f);
    const A: Address = Address::repeat_byte(0x0a);
    const B: Address = Address::repeat_byte(0x0b);
    const C: Address = Address::repeat_byte(0x0c);

    fn transfer(from: Address, to: Address, block: u64) -> TransferNftLog {
        TransferNftLog {
            block_number: block,
            contract: CONTRACT,
            from,
            to,
            token_id: U256::from(77),
            tx_hash: B256::ZERO,
            log_index: 0,
        }
    }

    fn stream() -> Vec<TransferNftLog> {
        vec![
            transfer(Address::ZERO, A, 1),
            transfer(A, B, 2),
            transfer(B, C, 3),
        ]
    }

    #[test]
    fn test_full_replay_leaves_single_owner() {
        let mut ledger = NftLedger::default();
        for log in stream() {
            ledger.apply(&log);
        }
        let id = U256::from(77);
        assert_eq!(ledger.owners(CONTRACT, id), vec![C]);
        assert_eq!(ledger.net(CONTRACT, id, A), 0);
        assert_eq!(ledger.net(CONTRACT, id, B), 0);
        assert!(ledger.violations(3).is_empty());
    }

    #[test]
    fn test_partial_replay_owner_is_b() {
        let mut ledger = NftLedger::default();
        for log in stream().iter().take(2) {
            ledger.apply(log);
        }
        let id = U256::from(77);
        assert_eq!(ledger.net(CONTRACT, id, B), 1);
        assert_eq!(ledger.net(CONTRACT, id, A), 0);
        assert_eq!(ledger.net(CONTRACT, id, C), 0);
    }

    #[test]
    fn test_net_holdings_per_wallet() {
        let logs = stream();
        let incoming = |w: Address| -> Vec<_> { logs.iter().filter(|l| l.to == w).cloned().collect() };
        let outgoing = |w: Address| -> Vec<_> { logs.iter().filter(|l| l.from == w).cloned().collect() };

        let c = net_holdings(CONTRACT, C, &incoming(C), &outgoing(C), 3);
        assert_eq!(c.owned, [U256::from(77)].into());
        for wallet in [A, B] {
            let h = net_holdings(CONTRACT, wallet, &incoming(wallet), &outgoing(wallet), 3);
            assert!(h.owned.is_empty());
            assert!(h.violations.is_empty());
        }
    }

    #[test]
    fn test_missing_history_is_violation() {
        // B sends a token it was never seen receiving.
        let outgoing = vec![transfer(B, C, 10)];
        let h = net_holdings(CONTRACT, B, &[], &outgoing, 10);
        assert!(h.owned.is_empty());
        assert_eq!(h.violations.len(), 1);
        assert_eq!(h.violations[0].net_count, -1);
    }

    #[test]
    fn test_self_transfer_cancels() {
        let mut logs = stream();
        logs.push(transfer(C, C, 4));
        let incoming: Vec<_> = logs.iter().filter(|l| l.to == C).cloned().collect();
        let outgoing: Vec<_> = logs.iter().filter(|l| l.from == C).cloned().collect();
        let h = net_holdings(CONTRACT, C, &incoming, &outgoing, 4);
        assert_eq!(h.owned, [U256::from(77)].into());
    }

    #[test]
    fn test_double_owner_is_violation() {
        let mut ledger = NftLedger::default();
        ledger.apply(&transfer(Address::ZERO, A, 1));
        ledger.apply(&transfer(Address::ZERO, B, 2));
        let violations = ledger.violations(2);
        assert_eq!(violations.len(), 2);
    }
}
