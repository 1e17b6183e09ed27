use std::sync::Arc;

use alloy::primitives::{Address, B256};
use alloy::rpc::types::Log;
use futures::future::BoxFuture;
use futures::FutureExt;

use super::connector::{ChainConnector, LogQuery};
use crate::error::{HarvestError, Result};

/// Log queries over a connector, splitting ranges the provider refuses.
pub struct LogRangeFetcher<C> {
    connector: Arc<C>,
}

impl<C: ChainConnector> LogRangeFetcher<C> {
    pub fn new(connector: Arc<C>) -> Self {
        Self { connector }
    }

    /// One `eth_getLogs` round trip, no splitting.
    pub async fn get_logs(
        &self,
        topic0: Option<B256>,
        topic1: Option<B256>,
        topic2: Option<B256>,
        addresses: &[Address],
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>> {
        let query = LogQuery {
            addresses: addresses.to_vec(),
            topic0,
            topic1,
            topic2,
            from,
            to,
        };
        self.connector.get_logs(&query).await
    }

    /// Fetches `query`, halving the range whenever the provider rejects it
    /// for size. The result equals what a single unsplit call would return.
    ///
    /// A rejected single-block range is a [`HarvestError::Range`]. Once
    /// `depth` is exhausted the provider error is returned unchanged.
    pub fn get_logs_recursively(
        &self,
        query: LogQuery,
        depth: u32,
    ) -> BoxFuture<'_, Result<Vec<Log>>> {
        async move {
            let error = match self.connector.get_logs(&query).await {
                Ok(logs) => return Ok(logs),
                Err(e) if e.is_provider_limit() => e,
                Err(e) => return Err(e),
            };

            if query.from >= query.to {
                return Err(HarvestError::Range {
                    from: query.from,
                    to: query.to,
                    reason: error.to_string(),
                });
            }
            if depth == 0 {
                return Err(error);
            }

            let mid = query.from + (query.to - query.from) / 2;
            tracing::debug!(
                from = query.from,
                mid,
                to = query.to,
                depth,
                "Log range rejected, splitting"
            );

            let mut logs = self
                .get_logs_recursively(query.with_range(query.from, mid), depth - 1)
                .await?;
            let upper = self
                .get_logs_recursively(query.with_range(mid + 1, query.to), depth - 1)
                .await?;
            logs.extend(upper);
            Ok(logs)
        }
        .boxed()
    }
}
