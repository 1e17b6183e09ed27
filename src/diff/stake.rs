use std::collections::HashMap;

use alloy::primitives::{Address, B128, U256};
use chrono::{DateTime, Utc};

use crate::error::HarvestError;
use crate::types::{LogEvent, StakeAction, StakeEvent, StakeLog};

fn from_stake_log(action: StakeAction, log: &StakeLog, timestamp: Option<DateTime<Utc>>) -> StakeEvent {
    StakeEvent {
        action,
        tx_hash: log.tx_hash,
        log_index: log.log_index,
        block_number: log.block_number,
        user_wallet: log.user_wallet,
        stake_target_id: log.target,
        token_type: log.token_type,
        amount_delta: log.amount,
        total_staked: log.total_staked,
        timestamp,
    }
}

/// Stake events carried by a decoded log.
///
/// A restake moves stake between targets and becomes an unstake from the
/// source followed by a stake into the destination.
pub fn stake_events(log: &LogEvent, timestamp: Option<DateTime<Utc>>) -> Vec<StakeEvent> {
    match log {
        LogEvent::Stake(s) => vec![from_stake_log(StakeAction::Stake, s, timestamp)],
        LogEvent::Unstake(s) => vec![from_stake_log(StakeAction::Unstake, s, timestamp)],
        LogEvent::Restake(r) => {
            let leg = |action, target, total| StakeEvent {
                action,
                tx_hash: r.tx_hash,
                log_index: r.log_index,
                block_number: r.block_number,
                user_wallet: r.user_wallet,
                stake_target_id: target,
                token_type: r.token_type,
                amount_delta: r.amount,
                total_staked: total,
                timestamp,
            };
            vec![
                leg(StakeAction::Unstake, r.from_target, r.total_staked_from),
                leg(StakeAction::Stake, r.to_target, r.total_staked_to),
            ]
        }
        LogEvent::Erc20Transfer(_) | LogEvent::NftTransfer(_) => vec![],
    }
}

/// Running stake totals per (target, wallet, token type).
#[derive(Debug, Default)]
pub struct StakeLedger {
    totals: HashMap<(B128, Address, u8), U256>,
}

impl StakeLedger {
    pub fn total(&self, target: B128, wallet: Address, token_type: u8) -> Option<U256> {
        self.totals.get(&(target, wallet, token_type)).copied()
    }

    /// Applies a delta and checks it against the total the contract reports.
    ///
    /// The first event of a key seeds it from the reported total. On a
    /// mismatch the ledger adopts the reported total and returns
    /// [`HarvestError::Consistency`].
    pub fn apply(&mut self, event: &StakeEvent) -> Result<(), HarvestError> {
        let key = (event.stake_target_id, event.user_wallet, event.token_type);
        let Some(current) = self.totals.insert(key, event.total_staked) else {
            return Ok(());
        };

        let derived = match event.action {
            StakeAction::Stake => current.checked_add(event.amount_delta),
            StakeAction::Unstake => current.checked_sub(event.amount_delta),
        };

        if derived != Some(event.total_staked) {
            return Err(HarvestError::Consistency(format!(
                "stake total for {} on {} is {} on chain, derived {}",
                event.user_wallet,
                event.stake_target_id,
                event.total_staked,
                derived.map_or_else(|| "underflow".to_string(), |d| d.to_string()),
            )));
        }
        Ok(())
    }
}
