use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use alloy::primitives::{Address, B128, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::codec::{self, AbiKind, AbiRegistry, DecodedCall, Transfer};
use super::connector::{AlloyConnector, ChainConnector, LogQuery};
use super::fetcher::LogRangeFetcher;
use super::{BlockListener, ChainAdapter, Ingestion, IngestionMode};
use crate::config::{parse_stake_target, ChainConfig, HarvesterConfig};
use crate::diff::nft::net_holdings;
use crate::diff::stake::stake_events;
use crate::diff::transfers::diffs_from_block;
use crate::diff::NftHoldings;
use crate::error::{DecodeError, HarvestError, Result};
use crate::types::{ChainId, LogEvent, StakeEvent, TransferErc20Log, TransferNftLog};

/// The one adapter implementation for EVM JSON-RPC chains, in either
/// ingestion mode.
pub struct EvmAdapter<C> {
    chain: ChainId,
    mode: IngestionMode,
    poll_interval: Duration,
    confirmations: u64,
    stake_contract: Option<Address>,
    skip_stake_targets: HashSet<B128>,
    max_split_depth: u32,
    batch_size: u64,
    connector: Arc<C>,
    fetcher: LogRangeFetcher<C>,
    abis: AbiRegistry,
    /// First block not yet handed to the listener. Unset until a start
    /// block, a restored cursor or the first head fixes it.
    next_block: Mutex<Option<u64>>,
    listener: Mutex<Option<BlockListener>>,
}

impl EvmAdapter<AlloyConnector> {
    /// Connects to the configured node. Fails if the node is unreachable.
    pub async fn connect(config: &ChainConfig, harvester: &HarvesterConfig) -> Result<Self> {
        let connector = AlloyConnector::connect(config).await?;
        Self::new(config, harvester, Arc::new(connector))
    }
}

impl<C: ChainConnector> EvmAdapter<C> {
    pub fn new(config: &ChainConfig, harvester: &HarvesterConfig, connector: Arc<C>) -> Result<Self> {
        let stake_contract = config
            .stake_contract
            .as_deref()
            .map(|s| Address::from_str(s).map_err(|_| HarvestError::InvalidAddress(s.to_string())))
            .transpose()?;

        let mut skip_stake_targets = HashSet::new();
        for target in &config.skip_stake_targets {
            match parse_stake_target(target) {
                Some(id) => {
                    skip_stake_targets.insert(id);
                }
                None => {
                    tracing::error!(
                        chain = %config.name,
                        target = %target,
                        "Invalid stake target in config, skipping"
                    );
                }
            }
        }

        Ok(Self {
            chain: ChainId::new(&config.name),
            mode: config.mode,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            confirmations: config.confirmations,
            stake_contract,
            skip_stake_targets,
            max_split_depth: harvester.max_split_depth,
            batch_size: config.batch_size.max(1),
            fetcher: LogRangeFetcher::new(connector.clone()),
            connector,
            abis: AbiRegistry::load()?,
            next_block: Mutex::new(config.start_block),
            listener: Mutex::new(None),
        })
    }

    fn listener(&self) -> Option<BlockListener> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn emit(&self, ingestion: Ingestion) -> Result<()> {
        match self.listener() {
            Some(listener) => listener(self.chain.clone(), ingestion).await,
            None => {
                tracing::debug!(chain = %self.chain, "No block listener registered");
                Ok(())
            }
        }
    }

    fn next_block(&self) -> Option<u64> {
        *self.next_block.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance_past(&self, block: u64) {
        *self.next_block.lock().unwrap_or_else(PoisonError::into_inner) = Some(block.saturating_add(1));
    }

    /// First block to ingest when the confirmed head is `target`, if any.
    /// Without a start block ingestion begins at the first head seen.
    fn next_range_start(&self, target: u64) -> Option<u64> {
        match self.next_block() {
            None => Some(target),
            Some(next) if next > target => None,
            Some(next) => Some(next),
        }
    }

    async fn run_pull(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            chain = %self.chain,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            cursor = ?self.cursor(),
            batch_size = self.batch_size,
            "HTTP polling active"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return Ok(()),
            }

            tokio::select! {
                result = self.poll_once() => {
                    if let Err(e) = result {
                        tracing::warn!(
                            chain = %self.chain,
                            cursor = ?self.cursor(),
                            error = %e,
                            "Poll failed, retrying next tick"
                        );
                    }
                }
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }

    async fn poll_once(&self) -> Result<()> {
        let head = self.connector.block_number().await?;
        let target = head.saturating_sub(self.confirmations);

        // A backlog goes out in batch_size ranges so each one fits the query timeout.
        while let Some(from) = self.next_range_start(target) {
            let to = target.min(from.saturating_add(self.batch_size - 1));
            if to < target {
                tracing::debug!(chain = %self.chain, from, to, target, "Catching up");
            }

            let header = self
                .connector
                .block_header(to)
                .await?
                .ok_or_else(|| HarvestError::Rpc(format!("block {} not found", to)))?;

            self.emit(Ingestion::Head {
                from,
                block: header.block,
            })
            .await?;
            self.advance_past(to);
        }
        Ok(())
    }

    async fn run_push(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut heads = self.connector.subscribe_heads().await?;

        loop {
            let head = tokio::select! {
                next = heads.next() => match next {
                    Some(head) => head,
                    None => {
                        return Err(HarvestError::Connection(format!(
                            "block subscription of '{}' closed",
                            self.chain
                        )));
                    }
                },
                _ = shutdown.cancelled() => return Ok(()),
            };

            let target = head.number.saturating_sub(self.confirmations);
            let Some(from) = self.next_range_start(target) else {
                continue;
            };

            for number in from..=target {
                tokio::select! {
                    _ = self.ingest_block(number) => {}
                    _ = shutdown.cancelled() => return Ok(()),
                }
                self.advance_past(number);
            }
        }
    }

    // Failures here skip the block; they never stop the loop.
    async fn ingest_block(&self, number: u64) {
        let body = match self.connector.block_with_transactions(number).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                tracing::warn!(chain = %self.chain, block = number, "Block not found, skipping");
                return;
            }
            Err(e) => {
                tracing::warn!(
                    chain = %self.chain,
                    block = number,
                    error = %e,
                    "Failed to fetch block, skipping"
                );
                return;
            }
        };

        let transfers = diffs_from_block(self.abis.get(AbiKind::Erc20), &body);
        tracing::debug!(
            chain = %self.chain,
            block = number,
            txs = body.transactions.len(),
            transfers = transfers.len(),
            "Decoded block"
        );

        if let Err(e) = self
            .emit(Ingestion::Block {
                block: body.block,
                transfers,
            })
            .await
        {
            tracing::warn!(
                chain = %self.chain,
                block = number,
                error = %e,
                "Block processing failed, skipping"
            );
        }
    }

    fn transfer_query(&self, addresses: Vec<Address>, from: u64, to: u64) -> LogQuery {
        LogQuery {
            addresses,
            topic0: Some(Transfer::SIGNATURE_HASH),
            from,
            to,
            ..Default::default()
        }
    }

    async fn decoded_logs(&self, query: LogQuery) -> Result<Vec<LogEvent>> {
        let logs = self
            .fetcher
            .get_logs_recursively(query, self.max_split_depth)
            .await?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match codec::decode_log(log) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        chain = %self.chain,
                        block = log.block_number,
                        tx = ?log.transaction_hash,
                        error = %e,
                        "Skipping undecodable log"
                    );
                }
            }
        }
        Ok(events)
    }

    async fn block_timestamp(&self, number: u64) -> Option<DateTime<Utc>> {
        match self.connector.block_header(number).await {
            Ok(Some(header)) => DateTime::from_timestamp(header.timestamp as i64, 0),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    chain = %self.chain,
                    block = number,
                    error = %e,
                    "Failed to fetch block timestamp"
                );
                None
            }
        }
    }
}

#[async_trait]
impl<C: ChainConnector> ChainAdapter for EvmAdapter<C> {
    fn chain(&self) -> &ChainId {
        &self.chain
    }

    fn mode(&self) -> IngestionMode {
        self.mode
    }

    fn stake_contract(&self) -> Option<Address> {
        self.stake_contract
    }

    fn cursor(&self) -> Option<u64> {
        self.next_block().and_then(|next| next.checked_sub(1))
    }

    fn resume_from(&self, block: u64) {
        self.advance_past(block);
    }

    async fn last_block_number(&self) -> Result<u64> {
        self.connector.block_number().await
    }

    async fn balance_of(&self, wallet: Address, token: Address, at_block: u64) -> Result<U256> {
        let raw = self
            .connector
            .eth_call(token, codec::encode_balance_of(wallet), at_block)
            .await?;
        Ok(codec::decode_padded_uint(&raw)?)
    }

    fn decode_call_data(&self, abi: AbiKind, data: &[u8]) -> std::result::Result<DecodedCall, DecodeError> {
        self.abis.get(abi).decode_call_data(data)
    }

    async fn get_logs(
        &self,
        topic0: Option<B256>,
        topic1: Option<B256>,
        topic2: Option<B256>,
        addresses: &[Address],
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>> {
        self.fetcher
            .get_logs(topic0, topic1, topic2, addresses, from, to)
            .await
    }

    async fn get_logs_recursively(&self, query: LogQuery, depth: u32) -> Result<Vec<Log>> {
        self.fetcher.get_logs_recursively(query, depth).await
    }

    async fn token_logs(&self, from: u64, to: u64, contracts: &[Address]) -> Result<Vec<TransferErc20Log>> {
        if contracts.is_empty() {
            return Ok(Vec::new());
        }
        let events = self
            .decoded_logs(self.transfer_query(contracts.to_vec(), from, to))
            .await?;

        let mut transfers = Vec::new();
        for event in events {
            match event {
                LogEvent::Erc20Transfer(t) => transfers.push(t),
                LogEvent::NftTransfer(n) => {
                    tracing::warn!(
                        chain = %self.chain,
                        contract = %n.contract,
                        block = n.block_number,
                        "NFT transfer returned for a token contract, skipping"
                    );
                }
                _ => {}
            }
        }
        Ok(transfers)
    }

    async fn nft_logs(&self, from: u64, to: u64, contracts: &[Address]) -> Result<Vec<TransferNftLog>> {
        if contracts.is_empty() {
            return Ok(Vec::new());
        }
        let events = self
            .decoded_logs(self.transfer_query(contracts.to_vec(), from, to))
            .await?;

        let mut transfers = Vec::new();
        for event in events {
            match event {
                LogEvent::NftTransfer(n) => transfers.push(n),
                LogEvent::Erc20Transfer(t) => {
                    tracing::warn!(
                        chain = %self.chain,
                        contract = %t.contract,
                        block = t.block_number,
                        "ERC20 transfer returned for an NFT contract, skipping"
                    );
                }
                _ => {}
            }
        }
        Ok(transfers)
    }

    async fn nft_holdings(&self, contract: Address, wallet: Address, at_block: u64) -> Result<NftHoldings> {
        let base = self.transfer_query(vec![contract], 0, at_block);
        let outgoing = LogQuery {
            topic1: Some(wallet.into_word()),
            ..base.clone()
        };
        let incoming = LogQuery {
            topic2: Some(wallet.into_word()),
            ..base
        };

        let nft = |events: Vec<LogEvent>| -> Vec<TransferNftLog> {
            events
                .into_iter()
                .filter_map(|e| match e {
                    LogEvent::NftTransfer(n) => Some(n),
                    _ => None,
                })
                .collect()
        };
        let outgoing = nft(self.decoded_logs(outgoing).await?);
        let incoming = nft(self.decoded_logs(incoming).await?);

        let holdings = net_holdings(contract, wallet, &incoming, &outgoing, at_block);
        for violation in &holdings.violations {
            tracing::warn!(
                chain = %self.chain,
                wallet = %wallet,
                contract = %contract,
                token_id = %violation.token_id,
                net = violation.net_count,
                "Consistency violation: NFT net count outside {{0, 1}}"
            );
        }
        Ok(holdings)
    }

    async fn stake_logs(&self, from: u64, to: u64) -> Result<Vec<StakeEvent>> {
        let Some(stake_contract) = self.stake_contract else {
            return Ok(Vec::new());
        };
        let query = LogQuery {
            addresses: vec![stake_contract],
            from,
            to,
            ..Default::default()
        };
        let events: Vec<LogEvent> = self
            .decoded_logs(query)
            .await?
            .into_iter()
            .filter(|e| matches!(e, LogEvent::Stake(_) | LogEvent::Unstake(_) | LogEvent::Restake(_)))
            .collect();

        let mut timestamps = BTreeMap::new();
        for event in &events {
            let number = event.block_number();
            if !timestamps.contains_key(&number) {
                let ts = self.block_timestamp(number).await;
                timestamps.insert(number, ts);
            }
        }

        let mut stakes = Vec::new();
        for event in &events {
            let ts = timestamps.get(&event.block_number()).copied().flatten();
            for stake in stake_events(event, ts) {
                if self.skip_stake_targets.contains(&stake.stake_target_id) {
                    tracing::debug!(
                        chain = %self.chain,
                        target = %stake.stake_target_id,
                        "Skipping stake on excluded target"
                    );
                    continue;
                }
                stakes.push(stake);
            }
        }
        Ok(stakes)
    }

    async fn transfer_history(&self, wallet: Address, token: Address, to: u64) -> Result<Vec<TransferErc20Log>> {
        let base = self.transfer_query(vec![token], 0, to);
        let mut history = Vec::new();
        for query in [
            LogQuery {
                topic1: Some(wallet.into_word()),
                ..base.clone()
            },
            LogQuery {
                topic2: Some(wallet.into_word()),
                ..base
            },
        ] {
            for event in self.decoded_logs(query).await? {
                if let LogEvent::Erc20Transfer(t) = event {
                    history.push(t);
                }
            }
        }
        Ok(history)
    }

    fn register_block_listener(&self, listener: BlockListener) {
        *self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(chain = %self.chain, mode = ?self.mode, "Starting ingestion");
        let result = match self.mode {
            IngestionMode::Pull => self.run_pull(&shutdown).await,
            IngestionMode::Push => self.run_push(&shutdown).await,
        };
        match &result {
            Ok(()) => tracing::info!(chain = %self.chain, cursor = ?self.cursor(), "Ingestion stopped"),
            Err(e) => tracing::error!(chain = %self.chain, error = %e, "Ingestion failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::connector::{BlockBody, RawTransaction};
    use crate::testing::{
        block_hash, chain_config, erc20_transfer, make_log, nft_transfer, padded_hex, stake_data,
        FakeChain,
    };
    use crate::types::{Block, StakeAction};
    use alloy::primitives::{address, Bytes};
    use alloy::sol_types::SolCall;
    use crate::adapter::block_listener;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::mpsc;

    const WALLET: Address = address!("e2148ee53c0755215df69b2616e552154edc584f");
    const CONTRACT: Address = address!("7f85fb7f42a0c0d40431cc0f7dfdf88be6495e67");
    const STAKING: Address = address!("047c0e8bc4d2cb2b7f3a2c4b0d0c9d51b2e5f3c1");

    fn adapter(chain: Arc<FakeChain>, mode: IngestionMode) -> Arc<EvmAdapter<FakeChain>> {
        let mut config = chain_config("nova", mode);
        config.stake_contract = Some(STAKING.to_string());
        config.skip_stake_targets = vec![format!("0x{}", "99".repeat(16))];
        Arc::new(EvmAdapter::new(&config, &HarvesterConfig::default(), chain).unwrap())
    }

    fn recorder(adapter: &EvmAdapter<FakeChain>) -> mpsc::UnboundedReceiver<Ingestion> {
        let (tx, rx) = mpsc::unbounded_channel();
        adapter.register_block_listener(block_listener(move |_, ingestion| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(ingestion);
                Ok(())
            }
        }));
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Ingestion>) -> Ingestion {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("ingestion within 5s")
            .expect("listener alive")
    }

    #[tokio::test]
    async fn test_token_logs_scenario() {
        let chain = Arc::new(FakeChain::new(200));
        let other = Address::repeat_byte(0x01);
        chain.push_log(erc20_transfer(CONTRACT, other, WALLET, 5, 93, 0));
        chain.push_log(erc20_transfer(CONTRACT, other, WALLET, 1, 100, 0));
        chain.push_log(nft_transfer(CONTRACT, other, WALLET, 4, 101, 0));
        chain.push_log(erc20_transfer(Address::repeat_byte(0xbb), other, WALLET, 9, 102, 0));
        chain.push_log(erc20_transfer(CONTRACT, other, WALLET, 5, 106, 0));

        let adapter = adapter(chain, IngestionMode::Pull);
        let logs = adapter.token_logs(94, 105, &[CONTRACT]).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number, 100);
        assert_eq!(logs[0].contract, CONTRACT);
        assert_eq!(logs[0].to, WALLET);
        assert_eq!(logs[0].value, U256::from(1));
    }

    #[tokio::test]
    async fn test_token_logs_with_provider_limit() {
        let chain = Arc::new(FakeChain::new(200));
        for block in [1u64, 50, 51, 120, 199] {
            chain.push_log(erc20_transfer(CONTRACT, WALLET, Address::repeat_byte(2), block, block, 0));
        }
        chain.set_max_range(Some(16));
        let adapter = adapter(chain, IngestionMode::Pull);
        let logs = adapter.token_logs(0, 200, &[CONTRACT]).await.unwrap();
        let blocks: Vec<u64> = logs.iter().map(|l| l.block_number).collect();
        assert_eq!(blocks, vec![1, 50, 51, 120, 199]);
    }

    #[tokio::test]
    async fn test_balance_of_decodes_padding() {
        let chain = Arc::new(FakeChain::new(10));
        chain.set_balance(CONTRACT, WALLET, padded_hex(500));
        let adapter = adapter(chain, IngestionMode::Pull);
        assert_eq!(adapter.balance_of(WALLET, CONTRACT, 10).await.unwrap(), U256::from(500));
        assert_eq!(
            adapter.balance_of(Address::repeat_byte(7), CONTRACT, 10).await.unwrap(),
            U256::ZERO
        );
    }

    #[tokio::test]
    async fn test_nft_holdings_nets_history() {
        let chain = Arc::new(FakeChain::new(50));
        let a = Address::repeat_byte(0x0a);
        chain.push_log(nft_transfer(CONTRACT, Address::ZERO, WALLET, 1, 10, 0));
        chain.push_log(nft_transfer(CONTRACT, Address::ZERO, WALLET, 2, 11, 0));
        chain.push_log(nft_transfer(CONTRACT, WALLET, a, 1, 12, 0));
        chain.push_log(nft_transfer(CONTRACT, a, WALLET, 3, 40, 0));

        let adapter = adapter(chain, IngestionMode::Pull);
        let at_30 = adapter.nft_holdings(CONTRACT, WALLET, 30).await.unwrap();
        assert_eq!(at_30.owned, [U256::from(2)].into());
        let at_50 = adapter.nft_holdings(CONTRACT, WALLET, 50).await.unwrap();
        assert_eq!(at_50.owned, [U256::from(2), U256::from(3)].into());
        assert!(at_50.violations.is_empty());
    }

    #[tokio::test]
    async fn test_stake_logs_expand_and_skip() {
        let chain = Arc::new(FakeChain::new(50));
        let target = B256::left_padding_from(&[0x77; 16]);
        let skipped = B256::left_padding_from(&[0x99; 16]);
        chain.push_log(make_log(
            STAKING,
            vec![codec::Stake::SIGNATURE_HASH, WALLET.into_word(), target],
            stake_data(&[100, 0, 100]),
            20,
            0,
        ));
        chain.push_log(make_log(
            STAKING,
            vec![codec::Stake::SIGNATURE_HASH, WALLET.into_word(), skipped],
            stake_data(&[5, 0, 5]),
            20,
            1,
        ));
        chain.push_log(make_log(
            STAKING,
            vec![codec::Restake::SIGNATURE_HASH, WALLET.into_word(), target, skipped],
            stake_data(&[40, 0, 60, 45]),
            21,
            0,
        ));

        let adapter = adapter(chain, IngestionMode::Pull);
        let stakes = adapter.stake_logs(0, 50).await.unwrap();
        assert_eq!(stakes.len(), 2);
        assert_eq!(stakes[0].action, StakeAction::Stake);
        assert_eq!(stakes[0].amount_delta, U256::from(100));
        assert_eq!(
            stakes[0].timestamp,
            DateTime::from_timestamp(1_700_000_000 + 20 * 12, 0)
        );
        assert_eq!(stakes[1].action, StakeAction::Unstake);
        assert_eq!(stakes[1].total_staked, U256::from(60));
        assert_eq!(stakes[1].comment(), "21:0");
    }

    #[tokio::test]
    async fn test_pull_loop_emits_ranges() {
        let chain = Arc::new(FakeChain::new(10));
        let mut config = chain_config("nova", IngestionMode::Pull);
        config.poll_interval_ms = 10;
        config.confirmations = 2;
        let adapter = Arc::new(EvmAdapter::new(&config, &HarvesterConfig::default(), chain.clone()).unwrap());
        let mut rx = recorder(&adapter);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let adapter = adapter.clone();
            let shutdown = shutdown.clone();
            async move { adapter.run(shutdown).await }
        });

        assert_eq!(
            next(&mut rx).await,
            Ingestion::Head {
                from: 8,
                block: Block { number: 8, hash: block_hash(8) }
            }
        );
        chain.set_head(15);
        assert_eq!(next(&mut rx).await.range(), (9, 13));

        shutdown.cancel();
        assert!(handle.await.unwrap().is_ok());
        assert_eq!(adapter.cursor(), Some(13));
    }

    #[tokio::test]
    async fn test_pull_loop_retries_without_advancing() {
        let chain = Arc::new(FakeChain::new(10));
        let mut config = chain_config("nova", IngestionMode::Pull);
        config.poll_interval_ms = 10;
        let adapter = Arc::new(EvmAdapter::new(&config, &HarvesterConfig::default(), chain.clone()).unwrap());
        adapter.resume_from(5);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicU64::new(0));
        adapter.register_block_listener(block_listener({
            let calls = calls.clone();
            move |_, ingestion| {
                let tx = tx.clone();
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    let _ = tx.send(ingestion);
                    if attempt == 0 {
                        Err(HarvestError::Rpc("provider busy".into()))
                    } else {
                        Ok(())
                    }
                }
            }
        }));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let adapter = adapter.clone();
            let shutdown = shutdown.clone();
            async move { adapter.run(shutdown).await }
        });

        assert_eq!(next(&mut rx).await.range(), (6, 10));
        assert_eq!(next(&mut rx).await.range(), (6, 10));
        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(adapter.cursor(), Some(10));
    }

    async fn run_pull_until(adapter: &Arc<EvmAdapter<FakeChain>>, ranges: usize) -> Vec<(u64, u64)> {
        let mut rx = recorder(adapter);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let adapter = adapter.clone();
            let shutdown = shutdown.clone();
            async move { adapter.run(shutdown).await }
        });

        let mut seen = Vec::new();
        while seen.len() < ranges {
            seen.push(next(&mut rx).await.range());
        }
        shutdown.cancel();
        handle.await.unwrap().unwrap();
        seen
    }

    #[tokio::test]
    async fn test_pull_backlog_is_split_into_batches() {
        let chain = Arc::new(FakeChain::new(1_000));
        let mut config = chain_config("nova", IngestionMode::Pull);
        config.batch_size = 100;
        let adapter = Arc::new(EvmAdapter::new(&config, &HarvesterConfig::default(), chain).unwrap());
        adapter.resume_from(100);

        let ranges = run_pull_until(&adapter, 9).await;
        let expected: Vec<(u64, u64)> = (1..10).map(|i| (i * 100 + 1, (i + 1) * 100)).collect();
        assert_eq!(ranges, expected);
        assert_eq!(adapter.cursor(), Some(1_000));
    }

    #[tokio::test]
    async fn test_pull_honors_low_start_block() {
        for start in [0u64, 1] {
            let chain = Arc::new(FakeChain::new(10));
            let mut config = chain_config("nova", IngestionMode::Pull);
            config.start_block = Some(start);
            let adapter = Arc::new(EvmAdapter::new(&config, &HarvesterConfig::default(), chain).unwrap());
            assert_eq!(adapter.cursor(), start.checked_sub(1));

            assert_eq!(run_pull_until(&adapter, 1).await, vec![(start, 10)]);
            assert_eq!(adapter.cursor(), Some(10));
        }
    }

    #[tokio::test]
    async fn test_start_block_range_respects_batch_size() {
        let chain = Arc::new(FakeChain::new(10));
        let mut config = chain_config("nova", IngestionMode::Pull);
        config.start_block = Some(1);
        config.batch_size = 4;
        let adapter = Arc::new(EvmAdapter::new(&config, &HarvesterConfig::default(), chain).unwrap());

        assert_eq!(run_pull_until(&adapter, 3).await, vec![(1, 4), (5, 8), (9, 10)]);
    }

    fn body(number: u64, transfers: &[(Address, u64)]) -> BlockBody {
        BlockBody {
            block: Block {
                number,
                hash: block_hash(number),
            },
            transactions: transfers
                .iter()
                .map(|(to, value)| RawTransaction {
                    hash: B256::repeat_byte(number as u8),
                    sender: WALLET,
                    to: Some(CONTRACT),
                    input: Bytes::from(
                        codec::transferCall {
                            _to: *to,
                            _value: U256::from(*value),
                        }
                        .abi_encode(),
                    ),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_push_loop_fills_gaps_in_order() {
        let chain = Arc::new(FakeChain::new(0));
        let bob = Address::repeat_byte(0x0b);
        chain.set_body(body(5, &[(bob, 1)]));
        chain.set_body(body(6, &[(bob, 2)]));
        chain.set_body(body(8, &[(bob, 4)]));

        let adapter = adapter(chain.clone(), IngestionMode::Push);
        let mut rx = recorder(&adapter);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let adapter = adapter.clone();
            let shutdown = shutdown.clone();
            async move { adapter.run(shutdown).await }
        });

        chain.announce(5);
        match next(&mut rx).await {
            Ingestion::Block { block, transfers } => {
                assert_eq!(block.number, 5);
                assert_eq!(transfers.len(), 1);
                assert_eq!(transfers[0].from, WALLET);
                assert_eq!(transfers[0].to, bob);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Block 7 has no body and is skipped; 6 and 8 arrive in order.
        chain.announce(8);
        assert_eq!(next(&mut rx).await.block().number, 6);
        assert_eq!(next(&mut rx).await.block().number, 8);

        // A stale head is ignored.
        chain.announce(4);

        chain.drop_subscription();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(HarvestError::Connection(_))));
        assert_eq!(adapter.cursor(), Some(8));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_register_listener_replaces() {
        let chain = Arc::new(FakeChain::new(0));
        let adapter = adapter(chain, IngestionMode::Pull);
        let mut first = recorder(&adapter);
        let mut second = recorder(&adapter);
        adapter
            .emit(Ingestion::Head {
                from: 1,
                block: Block { number: 1, hash: block_hash(1) },
            })
            .await
            .unwrap();
        assert!(second.try_recv().is_ok());
        assert!(first.try_recv().is_err());
    }
}
