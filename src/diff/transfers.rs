use std::collections::HashSet;

use crate::adapter::codec::AbiCodec;
use crate::adapter::connector::{BlockBody, RawTransaction};
use crate::error::DecodeError;
use crate::types::{TokenTransferDiff, TransferErc20Log, WalletContractPair};

/// Derives a transfer diff from one transaction's call data.
///
/// `transfer` debits the recovered sender, `transferFrom` the `_from`
/// argument. Any other recognised method yields `None`.
pub fn diff_from_transaction(
    codec: &AbiCodec,
    tx: &RawTransaction,
    block_number: u64,
) -> Result<Option<TokenTransferDiff>, DecodeError> {
    let Some(token) = tx.to else {
        return Ok(None);
    };

    let call = codec.decode_call_data(&tx.input)?;
    let (from, to, amount) = match call.method.as_str() {
        "transfer" => (tx.sender, call.address("_to")?, call.uint("_value")?),
        "transferFrom" => (
            call.address("_from")?,
            call.address("_to")?,
            call.uint("_value")?,
        ),
        _ => return Ok(None),
    };

    Ok(Some(TokenTransferDiff {
        from,
        to,
        token,
        amount,
        block_number,
        tx_hash: tx.hash,
    }))
}

/// Diffs of every decodable token call in a block. Undecodable
/// transactions are skipped.
pub fn diffs_from_block(codec: &AbiCodec, body: &BlockBody) -> Vec<TokenTransferDiff> {
    let mut diffs = Vec::new();
    for tx in &body.transactions {
        if tx.input.is_empty() {
            continue;
        }
        match diff_from_transaction(codec, tx, body.block.number) {
            Ok(Some(diff)) => diffs.push(diff),
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(
                    block = body.block.number,
                    tx = %tx.hash,
                    error = %e,
                    "Skipping undecodable transaction"
                );
            }
        }
    }
    diffs
}

pub fn diffs_from_logs(logs: &[TransferErc20Log]) -> Vec<TokenTransferDiff> {
    logs.iter().map(TransferErc20Log::to_diff).collect()
}

/// Keeps the diffs touching a tracked pair, paired with the pairs they touch.
pub fn filter_tracked(
    diffs: Vec<TokenTransferDiff>,
    tracked: &HashSet<WalletContractPair>,
) -> Vec<(TokenTransferDiff, Vec<WalletContractPair>)> {
    diffs
        .into_iter()
        .filter_map(|diff| {
            let mut pairs = Vec::with_capacity(2);
            for wallet in [diff.from, diff.to] {
                let pair = WalletContractPair::new(wallet, diff.token);
                if tracked.contains(&pair) && !pairs.contains(&pair) {
                    pairs.push(pair);
                }
            }
            (!pairs.is_empty()).then_some((diff, pairs))
        })
        .collect()
}
