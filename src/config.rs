use serde::Deserialize;
use std::collections::HashSet;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Postgres store. Without it the harvester keeps its state in memory.
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub harvester: HarvesterConfig,
    pub chains: Vec<ChainConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

/// How an adapter learns about new blocks.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IngestionMode {
    /// Subscribe to new heads over WebSocket and decode full block bodies.
    Push,
    /// Poll the head over HTTP and query logs for the new range.
    Pull,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_http: String,
    pub rpc_ws: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: IngestionMode,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Blocks to stay behind the head before a block is ingested.
    #[serde(default)]
    pub confirmations: u64,
    /// Widest block range a pull tick hands to the pipeline at once.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    pub start_block: Option<u64>,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
    #[serde(default)]
    pub nft_contracts: Vec<String>,
    pub stake_contract: Option<String>,
    /// Wallets tracked against every token and NFT contract of the chain.
    #[serde(default)]
    pub wallets: Vec<String>,
    /// Stake target IDs whose events are dropped.
    #[serde(default)]
    pub skip_stake_targets: Vec<String>,
}

fn default_mode() -> IngestionMode {
    IngestionMode::Pull
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_batch_size() -> u64 {
    1000
}

fn default_rpc_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenConfig {
    pub symbol: String,
    pub address: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HarvesterConfig {
    /// Bound on how often a rejected log range is halved.
    #[serde(default = "default_max_split_depth")]
    pub max_split_depth: u32,
    /// Wall-clock bound on one log query, splits included.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_init_retry_attempts")]
    pub init_retry_attempts: u32,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            max_split_depth: default_max_split_depth(),
            query_timeout_ms: default_query_timeout_ms(),
            init_retry_attempts: default_init_retry_attempts(),
        }
    }
}

fn default_max_split_depth() -> u32 {
    12
}

fn default_query_timeout_ms() -> u64 {
    60_000
}

fn default_init_retry_attempts() -> u32 {
    3
}

fn is_address(value: &str) -> bool {
    value.len() == 42
        && value.starts_with("0x")
        && value[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Parses a stake target ID: 32 hex digits, optionally `0x`-prefixed or hyphenated.
pub fn parse_stake_target(value: &str) -> Option<alloy::primitives::B128> {
    let digits: String = value
        .trim_start_matches("0x")
        .chars()
        .filter(|c| *c != '-')
        .collect();
    let bytes = hex::decode(digits).ok()?;
    (bytes.len() == 16).then(|| alloy::primitives::B128::from_slice(&bytes))
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("Failed to read config file '{}': {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("Failed to parse config file '{}': {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> eyre::Result<()> {
        if self.chains.is_empty() {
            return Err(eyre::eyre!("At least one chain must be configured"));
        }

        let mut names = HashSet::new();
        for chain in &self.chains {
            if !names.insert(chain.name.as_str()) {
                return Err(eyre::eyre!("Chain '{}' is configured twice", chain.name));
            }
            if chain.mode == IngestionMode::Push && chain.rpc_ws.is_none() {
                return Err(eyre::eyre!(
                    "Chain '{}' uses push mode but has no rpc_ws endpoint",
                    chain.name
                ));
            }
            if chain.batch_size == 0 {
                return Err(eyre::eyre!("Chain '{}' has a batch_size of 0", chain.name));
            }

            for token in &chain.tokens {
                if !is_address(&token.address) {
                    return Err(eyre::eyre!(
                        "Invalid token address '{}' for {} on chain '{}'",
                        token.address,
                        token.symbol,
                        chain.name
                    ));
                }
            }

            let others = chain
                .nft_contracts
                .iter()
                .chain(chain.wallets.iter())
                .chain(chain.stake_contract.iter());
            for address in others {
                if !is_address(address) {
                    return Err(eyre::eyre!(
                        "Invalid address '{}' on chain '{}'",
                        address,
                        chain.name
                    ));
                }
            }

            for target in &chain.skip_stake_targets {
                if parse_stake_target(target).is_none() {
                    return Err(eyre::eyre!(
                        "Invalid stake target '{}' on chain '{}'",
                        target,
                        chain.name
                    ));
                }
            }
        }
        Ok(())
    }
}
