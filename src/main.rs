use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use chain_harvester::adapter::evm::EvmAdapter;
use chain_harvester::adapter::ChainAdapter;
use chain_harvester::config::Config;
use chain_harvester::harvester::{BalanceChange, Harvester, Listener, NftOwnership, Stake};
use chain_harvester::store::{MemoryStore, Persistence, PgStore};
use chain_harvester::tokens::registry::seed_matrix;
use chain_harvester::types::{BalanceUpdate, NftOwnershipDelta, StakeEvent};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    // Initialize structured logging (set RUST_LOG=debug for per-block output)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    tracing::info!("Chain harvester starting");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path)?;
    tracing::info!(
        chains = config.chains.len(),
        "Configuration loaded from {}",
        config_path
    );

    let store: Arc<dyn Persistence> = match &config.database {
        Some(database) => {
            let store = PgStore::connect(database)
                .await
                .map_err(|e| eyre::eyre!("Failed to open store: {}", e))?;
            tracing::info!("Connected to PostgreSQL, migrations complete");
            Arc::new(store)
        }
        None => {
            tracing::warn!("No database configured, state is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let harvester = Harvester::new(store, config.harvester.clone());
    subscribe_log_listeners(&harvester)?;

    let mut adapters: Vec<Arc<dyn ChainAdapter>> = Vec::new();
    for chain_config in &config.chains {
        let adapter = EvmAdapter::connect(chain_config, &config.harvester)
            .await
            .map_err(|e| eyre::eyre!("Failed to connect to chain '{}': {}", chain_config.name, e))?;
        let adapter: Arc<dyn ChainAdapter> = Arc::new(adapter);

        harvester.register_adapter(adapter.clone()).await?;
        seed_matrix(&harvester, chain_config).await?;
        adapters.push(adapter);
    }

    let shutdown = CancellationToken::new();
    let (fatal_tx, mut fatal_rx) = mpsc::channel(adapters.len().max(1));

    // Spawn one ingestion loop per chain
    let mut handles = Vec::new();
    for adapter in adapters {
        let shutdown = shutdown.clone();
        let fatal_tx = fatal_tx.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = adapter.run(shutdown).await {
                let _ = fatal_tx.send((adapter.chain().clone(), e)).await;
            }
        });

        handles.push(handle);
    }
    drop(fatal_tx);

    tracing::info!("All chain adapters started. Press Ctrl+C to stop.");

    let fatal = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Shutdown signal received, stopping all adapters...");
            None
        }
        Some((chain, e)) = fatal_rx.recv() => {
            tracing::error!(chain = %chain, error = %e, "Adapter failed, stopping all adapters...");
            Some((chain, e))
        }
    };
    shutdown.cancel();

    for handle in handles {
        let _ = handle.await;
    }

    match fatal {
        Some((chain, e)) => Err(eyre::eyre!("Adapter for '{}' failed: {}", chain, e)),
        None => {
            tracing::info!("Chain harvester stopped gracefully");
            Ok(())
        }
    }
}

/// Logs every derived event at info level.
fn subscribe_log_listeners(harvester: &Harvester) -> eyre::Result<()> {
    harvester.subscribe::<BalanceChange>(
        None,
        Listener::new(|chain, update: BalanceUpdate| async move {
            tracing::info!(
                chain = %chain,
                pair = %update.pair,
                block = update.block_number,
                amount = %update.amount,
                "Balance changed"
            );
            Ok(())
        }),
    )?;
    harvester.subscribe::<NftOwnership>(
        None,
        Listener::new(|chain, delta: NftOwnershipDelta| async move {
            tracing::info!(
                chain = %chain,
                wallet = %delta.wallet,
                contract = %delta.contract,
                token_id = %delta.token_id,
                owned = delta.net_count == 1,
                block = delta.block_number,
                "NFT ownership changed"
            );
            Ok(())
        }),
    )?;
    harvester.subscribe::<Stake>(
        None,
        Listener::new(|chain, stake: StakeEvent| async move {
            tracing::info!(
                chain = %chain,
                wallet = %stake.user_wallet,
                target = %stake.stake_target_id,
                action = ?stake.action,
                amount = %stake.amount_delta,
                total = %stake.total_staked,
                "Stake"
            );
            Ok(())
        }),
    )?;
    Ok(())
}
