//! Scripted in-memory chain used by unit tests in place of a node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, LogData, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::adapter::codec::Transfer;
use crate::adapter::connector::{BlockBody, BlockHeader, ChainConnector, LogQuery};
use crate::config::{ChainConfig, IngestionMode};
use crate::error::{HarvestError, Result};
use crate::types::Block;

pub fn make_log(
    address: Address,
    topics: Vec<B256>,
    data: Vec<u8>,
    block_number: u64,
    log_index: u64,
) -> Log {
    Log {
        inner: alloy::primitives::Log {
            address,
            data: LogData::new_unchecked(topics, data.into()),
        },
        block_number: Some(block_number),
        block_hash: Some(block_hash(block_number)),
        transaction_hash: Some(B256::left_padding_from(&[
            (block_number % 256) as u8,
            (log_index % 256) as u8,
            0x7c,
        ])),
        log_index: Some(log_index),
        ..Default::default()
    }
}

pub fn topic_of(value: U256) -> B256 {
    B256::from(value.to_be_bytes::<32>())
}

pub fn block_hash(number: u64) -> B256 {
    B256::left_padding_from(&number.to_be_bytes())
}

pub fn erc20_transfer(
    token: Address,
    from: Address,
    to: Address,
    value: u64,
    block_number: u64,
    log_index: u64,
) -> Log {
    make_log(
        token,
        vec![Transfer::SIGNATURE_HASH, from.into_word(), to.into_word()],
        U256::from(value).to_be_bytes::<32>().to_vec(),
        block_number,
        log_index,
    )
}

pub fn nft_transfer(
    contract: Address,
    from: Address,
    to: Address,
    token_id: u64,
    block_number: u64,
    log_index: u64,
) -> Log {
    make_log(
        contract,
        vec![
            Transfer::SIGNATURE_HASH,
            from.into_word(),
            to.into_word(),
            topic_of(U256::from(token_id)),
        ],
        vec![],
        block_number,
        log_index,
    )
}

pub fn chain_config(name: &str, mode: IngestionMode) -> ChainConfig {
    ChainConfig {
        name: name.to_string(),
        chain_id: 42170,
        rpc_http: "http://localhost:8545".to_string(),
        rpc_ws: Some("ws://localhost:8546".to_string()),
        mode,
        poll_interval_ms: 10,
        confirmations: 0,
        batch_size: 1000,
        rpc_timeout_ms: 1000,
        start_block: None,
        tokens: vec![],
        nft_contracts: vec![],
        stake_contract: None,
        wallets: vec![],
        skip_stake_targets: vec![],
    }
}

/// Log data made of 32-byte big-endian words.
pub fn stake_data(words: &[u64]) -> Vec<u8> {
    words
        .iter()
        .flat_map(|w| U256::from(*w).to_be_bytes::<32>())
        .collect()
}

pub fn padded_hex(value: u64) -> String {
    format!("0x{:064x}", value)
}

#[derive(Default)]
struct FakeState {
    head: u64,
    logs: Vec<Log>,
    balances: HashMap<(Address, Address), String>,
    bodies: HashMap<u64, BlockBody>,
    /// Log queries wider than this many blocks are refused.
    max_range: Option<u64>,
    log_queries: Vec<(u64, u64)>,
    /// Log queries hang this long before answering.
    log_delay: Option<Duration>,
}

pub struct FakeChain {
    state: Mutex<FakeState>,
    failures: AtomicU32,
    heads_tx: Mutex<Option<mpsc::UnboundedSender<Block>>>,
    heads_rx: Mutex<Option<mpsc::UnboundedReceiver<Block>>>,
}

impl FakeChain {
    pub fn new(head: u64) -> Self {
        let (heads_tx, heads_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(FakeState {
                head,
                ..Default::default()
            }),
            failures: AtomicU32::new(0),
            heads_tx: Mutex::new(Some(heads_tx)),
            heads_rx: Mutex::new(Some(heads_rx)),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_head(&self, head: u64) {
        self.state().head = head;
    }

    pub fn push_log(&self, log: Log) {
        self.state().logs.push(log);
    }

    pub fn set_balance(&self, token: Address, wallet: Address, raw: String) {
        self.state().balances.insert((token, wallet), raw);
    }

    pub fn set_body(&self, body: BlockBody) {
        self.state().bodies.insert(body.block.number, body);
    }

    pub fn set_max_range(&self, max_range: Option<u64>) {
        self.state().max_range = max_range;
    }

    pub fn set_log_delay(&self, delay: Option<Duration>) {
        self.state().log_delay = delay;
    }

    /// The next `count` RPC calls fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn announce(&self, number: u64) {
        if let Some(tx) = self.heads_tx.lock().unwrap().as_ref() {
            let _ = tx.send(Block {
                number,
                hash: block_hash(number),
            });
        }
    }

    /// Closes the head subscription as a dropped socket would.
    pub fn drop_subscription(&self) {
        self.heads_tx.lock().unwrap().take();
    }

    pub fn log_queries(&self) -> Vec<(u64, u64)> {
        self.state().log_queries.clone()
    }

    fn maybe_fail(&self) -> Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(HarvestError::Rpc("scripted failure".into()));
        }
        Ok(())
    }
}

fn matches(log: &Log, query: &LogQuery) -> bool {
    let Some(number) = log.block_number else {
        return false;
    };
    if number < query.from || number > query.to {
        return false;
    }
    if !query.addresses.is_empty() && !query.addresses.contains(&log.inner.address) {
        return false;
    }
    let topics = log.inner.data.topics();
    [query.topic0, query.topic1, query.topic2]
        .iter()
        .enumerate()
        .all(|(i, wanted)| match wanted {
            Some(topic) => topics.get(i) == Some(topic),
            None => true,
        })
}

#[async_trait]
impl ChainConnector for FakeChain {
    async fn block_number(&self) -> Result<u64> {
        self.maybe_fail()?;
        Ok(self.state().head)
    }

    async fn eth_call(&self, to: Address, data: Bytes, _block: u64) -> Result<String> {
        self.maybe_fail()?;
        let wallet = Address::from_slice(&data[16..36]);
        Ok(self
            .state()
            .balances
            .get(&(to, wallet))
            .cloned()
            .unwrap_or_else(|| padded_hex(0)))
    }

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>> {
        self.maybe_fail()?;
        let delay = self.state().log_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        state.log_queries.push((query.from, query.to));
        if let Some(max) = state.max_range {
            if query.to - query.from + 1 > max {
                return Err(HarvestError::ProviderLimit {
                    from: query.from,
                    to: query.to,
                    reason: "query returned more than 10000 results".into(),
                });
            }
        }
        let mut logs: Vec<Log> = state
            .logs
            .iter()
            .filter(|log| matches(log, query))
            .cloned()
            .collect();
        logs.sort_by_key(|l| (l.block_number, l.log_index));
        Ok(logs)
    }

    async fn block_with_transactions(&self, number: u64) -> Result<Option<BlockBody>> {
        self.maybe_fail()?;
        Ok(self.state().bodies.get(&number).cloned())
    }

    async fn block_header(&self, number: u64) -> Result<Option<BlockHeader>> {
        self.maybe_fail()?;
        Ok(Some(BlockHeader {
            block: Block {
                number,
                hash: block_hash(number),
            },
            timestamp: 1_700_000_000 + number * 12,
        }))
    }

    async fn subscribe_heads(&self) -> Result<BoxStream<'static, Block>> {
        let rx = self
            .heads_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| HarvestError::Subscription("already subscribed".into()))?;
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|b| (b, rx)) }).boxed())
    }
}
