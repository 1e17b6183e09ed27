use crate::config::ChainConfig;
use crate::error::{HarvestError, Result};
use crate::harvester::Harvester;
use crate::types::ChainId;

/// Counts of one seeding pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedSummary {
    pub tokens: usize,
    pub nft_contracts: usize,
    pub wallets: usize,
    pub skipped: usize,
}

/// Seeds the wallet/contract matrix of one chain from config (idempotent).
///
/// Entries already tracked, e.g. restored from the store, are left alone.
/// Invalid addresses are logged and skipped.
pub async fn seed_matrix(harvester: &Harvester, config: &ChainConfig) -> Result<SeedSummary> {
    let chain = ChainId::new(&config.name);
    let mut summary = SeedSummary::default();

    for token in &config.tokens {
        let added = harvester.add_token_contract(&chain, &token.address).await;
        if seeded(&chain, "token", &token.address, Some(&token.symbol), added, &mut summary)? {
            summary.tokens += 1;
        }
    }

    for contract in &config.nft_contracts {
        let added = harvester.add_nft_contract(&chain, contract).await;
        if seeded(&chain, "nft_contract", contract, None, added, &mut summary)? {
            summary.nft_contracts += 1;
        }
    }

    for wallet in &config.wallets {
        let added = harvester.add_wallet(&chain, wallet).await;
        if seeded(&chain, "wallet", wallet, None, added, &mut summary)? {
            summary.wallets += 1;
        }
    }

    tracing::info!(
        chain = %chain,
        tokens = summary.tokens,
        nft_contracts = summary.nft_contracts,
        wallets = summary.wallets,
        skipped = summary.skipped,
        "Tracking matrix seeded"
    );
    Ok(summary)
}

// Ok(true) when the entry was added, Ok(false) when it was skipped.
fn seeded(
    chain: &ChainId,
    kind: &str,
    address: &str,
    symbol: Option<&str>,
    result: Result<()>,
    summary: &mut SeedSummary,
) -> Result<bool> {
    match result {
        Ok(()) => {
            tracing::debug!(chain = %chain, kind, address, symbol, "Seeded");
            Ok(true)
        }
        Err(HarvestError::InvalidAddress(_)) => {
            tracing::error!(
                chain = %chain,
                kind,
                address,
                symbol,
                "Invalid address in config, skipping"
            );
            summary.skipped += 1;
            Ok(false)
        }
        Err(HarvestError::Subscription(reason)) => {
            tracing::debug!(chain = %chain, kind, address, reason = %reason, "Already tracked");
            summary.skipped += 1;
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
