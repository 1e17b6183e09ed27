use std::future::{Future, IntoFuture};
use std::time::Duration;

use alloy::consensus::transaction::SignerRecoverable;
use alloy::consensus::Transaction as _;
use alloy::eips::BlockNumberOrTag;
use alloy::network::TransactionResponse;
use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::config::ChainConfig;
use crate::error::{HarvestError, Result};
use crate::types::Block;

/// Filter for a single `eth_getLogs` round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogQuery {
    pub addresses: Vec<Address>,
    pub topic0: Option<B256>,
    pub topic1: Option<B256>,
    pub topic2: Option<B256>,
    pub from: u64,
    pub to: u64,
}

impl LogQuery {
    /// Same filter over a different block range.
    pub fn with_range(&self, from: u64, to: u64) -> Self {
        Self {
            from,
            to,
            ..self.clone()
        }
    }
}

/// A transaction of a fetched block body, with its sender already recovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransaction {
    pub hash: B256,
    pub sender: Address,
    pub to: Option<Address>,
    pub input: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub block: Block,
    /// Unix seconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBody {
    pub block: Block,
    pub transactions: Vec<RawTransaction>,
}

/// Wire-level access to one chain. No business logic lives here.
#[async_trait]
pub trait ChainConnector: Send + Sync + 'static {
    /// `eth_blockNumber`.
    async fn block_number(&self) -> Result<u64>;

    /// `eth_call` pinned to `block`, returning the raw hex result.
    async fn eth_call(&self, to: Address, data: Bytes, block: u64) -> Result<String>;

    /// `eth_getLogs`. A provider refusal for size is `HarvestError::ProviderLimit`.
    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>>;

    async fn block_with_transactions(&self, number: u64) -> Result<Option<BlockBody>>;

    async fn block_header(&self, number: u64) -> Result<Option<BlockHeader>>;

    /// Stream of new heads. The stream ending means the subscription is lost.
    async fn subscribe_heads(&self) -> Result<BoxStream<'static, Block>>;
}

/// Error messages providers use when a log query is too wide or too large.
const PROVIDER_LIMIT_MARKERS: &[&str] = &[
    "query returned more than",
    "block range too wide",
    "block range exceeds",
    "range is too large",
    "response size",
    "too many results",
    "exceed maximum",
    "limit exceeded",
    "log response size exceeded",
];

pub(crate) fn is_provider_limit_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    PROVIDER_LIMIT_MARKERS.iter().any(|m| message.contains(m))
}

/// JSON-RPC connector backed by alloy providers.
///
/// The HTTP provider serves every request. The WebSocket provider is opened
/// at connect time when configured and only serves the head subscription.
pub struct AlloyConnector {
    chain: String,
    http: DynProvider,
    ws: Option<DynProvider>,
    timeout: Duration,
}

impl AlloyConnector {
    /// Opens the configured transports and probes the node once.
    pub async fn connect(config: &ChainConfig) -> Result<Self> {
        let url = config.rpc_http.parse().map_err(|e| {
            HarvestError::Connection(format!("invalid RPC URL '{}': {}", config.rpc_http, e))
        })?;
        let http = ProviderBuilder::new().connect_http(url).erased();

        let head = http.get_block_number().await.map_err(|e| {
            HarvestError::Connection(format!("{} unreachable: {}", config.rpc_http, e))
        })?;

        match http.get_chain_id().await {
            Ok(id) if id != config.chain_id => {
                tracing::warn!(
                    chain = %config.name,
                    configured = config.chain_id,
                    reported = id,
                    "Node reports a different chain id"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(chain = %config.name, error = %e, "Failed to read chain id");
            }
        }

        let ws = match &config.rpc_ws {
            Some(ws_url) => {
                let provider = ProviderBuilder::new()
                    .connect_ws(WsConnect::new(ws_url.as_str()))
                    .await
                    .map_err(|e| {
                        HarvestError::Connection(format!("{} unreachable: {}", ws_url, e))
                    })?;
                Some(provider.erased())
            }
            None => None,
        };

        tracing::info!(
            chain = %config.name,
            head,
            websocket = ws.is_some(),
            "Connected to chain"
        );

        Ok(Self {
            chain: config.name.clone(),
            http,
            ws,
            timeout: Duration::from_millis(config.rpc_timeout_ms),
        })
    }

    async fn timed<T, E, F>(&self, fut: F) -> Result<T>
    where
        F: IntoFuture<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(HarvestError::Rpc(e.to_string())),
            Err(_) => Err(HarvestError::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}

#[async_trait]
impl ChainConnector for AlloyConnector {
    async fn block_number(&self) -> Result<u64> {
        self.timed(self.http.get_block_number()).await
    }

    async fn eth_call(&self, to: Address, data: Bytes, block: u64) -> Result<String> {
        let params = serde_json::json!([
            { "to": to, "data": data },
            BlockNumberOrTag::Number(block),
        ]);
        self.timed(self.http.raw_request::<_, String>("eth_call".into(), params))
            .await
    }

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>> {
        let mut filter = Filter::new()
            .address(query.addresses.clone())
            .from_block(query.from)
            .to_block(query.to);
        if let Some(topic) = query.topic0 {
            filter = filter.event_signature(topic);
        }
        if let Some(topic) = query.topic1 {
            filter = filter.topic1(topic);
        }
        if let Some(topic) = query.topic2 {
            filter = filter.topic2(topic);
        }

        match self.timed(self.http.get_logs(&filter)).await {
            Err(HarvestError::Rpc(message)) if is_provider_limit_message(&message) => {
                Err(HarvestError::ProviderLimit {
                    from: query.from,
                    to: query.to,
                    reason: message,
                })
            }
            other => other,
        }
    }

    async fn block_with_transactions(&self, number: u64) -> Result<Option<BlockBody>> {
        let block = self
            .timed(
                self.http
                    .get_block_by_number(BlockNumberOrTag::Number(number))
                    .full(),
            )
            .await?;

        let Some(block) = block else {
            return Ok(None);
        };

        let mut transactions = Vec::with_capacity(block.transactions.len());
        for tx in block.transactions.txns() {
            let hash = tx.tx_hash();
            let sender = match tx.inner.inner().recover_signer() {
                Ok(sender) => sender,
                Err(e) => {
                    tracing::debug!(
                        chain = %self.chain,
                        tx = %hash,
                        error = %e,
                        "Signature recovery failed, skipping transaction"
                    );
                    continue;
                }
            };
            transactions.push(RawTransaction {
                hash,
                sender,
                to: tx.to(),
                input: tx.input().clone(),
            });
        }

        Ok(Some(BlockBody {
            block: Block {
                number: block.header.number,
                hash: block.header.hash,
            },
            transactions,
        }))
    }

    async fn block_header(&self, number: u64) -> Result<Option<BlockHeader>> {
        let block = self
            .timed(self.http.get_block_by_number(BlockNumberOrTag::Number(number)))
            .await?;
        Ok(block.map(|b| BlockHeader {
            block: Block {
                number: b.header.number,
                hash: b.header.hash,
            },
            timestamp: b.header.timestamp,
        }))
    }

    async fn subscribe_heads(&self) -> Result<BoxStream<'static, Block>> {
        let ws = self.ws.as_ref().ok_or_else(|| {
            HarvestError::Connection(format!("chain '{}' has no WebSocket endpoint", self.chain))
        })?;
        let sub = ws
            .subscribe_blocks()
            .await
            .map_err(|e| HarvestError::Subscription(e.to_string()))?;

        tracing::info!(chain = %self.chain, "WebSocket block subscription active");

        let stream = sub.into_stream().map(|header| Block {
            number: header.number,
            hash: header.hash,
        });
        Ok(stream.boxed())
    }
}

/// Retry a transient RPC call with exponential backoff.
///
/// Non-transient errors are returned immediately.
pub async fn retry_rpc<F, Fut, T>(max_retries: u32, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(500);
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries && e.is_transient() => {
                attempt += 1;
                tracing::warn!(
                    attempt,
                    max_retries,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "RPC call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_provider_limit_messages() {
        assert!(is_provider_limit_message(
            "query returned more than 10000 results"
        ));
        assert!(is_provider_limit_message(
            "eth_getLogs block range is too large, max is 1k blocks"
        ));
        assert!(is_provider_limit_message("Log response size exceeded."));
        assert!(is_provider_limit_message("block range too wide (max 2000)"));
        assert!(!is_provider_limit_message("connection reset by peer"));
        assert!(!is_provider_limit_message("invalid block range: from > to"));
        assert!(!is_provider_limit_message("block range extends beyond current head block"));
    }

    #[test]
    fn test_query_with_range_keeps_filter() {
        let query = LogQuery {
            addresses: vec![Address::repeat_byte(1)],
            topic0: Some(B256::repeat_byte(2)),
            from: 0,
            to: 100,
            ..Default::default()
        };
        let narrowed = query.with_range(10, 20);
        assert_eq!(narrowed.addresses, query.addresses);
        assert_eq!(narrowed.topic0, query.topic0);
        assert_eq!((narrowed.from, narrowed.to), (10, 20));
    }

    #[tokio::test]
    async fn test_retry_rpc_recovers_from_transient() {
        let calls = AtomicU32::new(0);
        let result = retry_rpc(3, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 1 {
                Err(HarvestError::Rpc("busy".into()))
            } else {
                Ok(7u64)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_rpc_stops_on_fatal() {
        let calls = AtomicU32::new(0);
        let result: Result<u64> = retry_rpc(3, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(HarvestError::InvalidAddress("0x".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
