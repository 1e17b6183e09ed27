use std::collections::{BTreeMap, HashMap};

use alloy::dyn_abi::{DynSolType, DynSolValue, Specifier};
use alloy::json_abi::{Function, JsonAbi};
use alloy::primitives::{Address, Bytes, Selector, B128, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent};

use crate::error::DecodeError;
use crate::types::{LogEvent, RestakeLog, StakeLog, TransferErc20Log, TransferNftLog};

// Typed declarations give us selectors, topic hashes and call encoding.
// Argument names follow the deployed contracts so decoded maps match them.
sol! {
    function transfer(address _to, uint256 _value) external returns (bool);
    function transferFrom(address _from, address _to, uint256 _value) external returns (bool);
    function balanceOf(address _owner) external view returns (uint256 balance);

    event Transfer(address indexed from, address indexed to, uint256 value);

    event Stake(address indexed user, uint256 indexed odyssey, uint256 amount_staked, uint8 token, uint256 total_staked);
    event Unstake(address indexed user, uint256 indexed odyssey, uint256 amount_unstaked, uint8 token, uint256 total_staked);
    event Restake(address indexed user, uint256 indexed odyssey_from, uint256 indexed odyssey_to, uint256 amount, uint8 token, uint256 total_staked_from, uint256 total_staked_to);
}

const ERC20_ABI: &str = include_str!("../../abi/erc20.json");
const ERC721_ABI: &str = include_str!("../../abi/nft.json");
const STAKING_ABI: &str = include_str!("../../abi/staking.json");

/// Contract families the harvester knows how to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiKind {
    Erc20,
    Erc721,
    Staking,
}

/// A contract call decoded against an ABI.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCall {
    pub method: String,
    pub args: BTreeMap<String, DynSolValue>,
}

impl DecodedCall {
    pub fn address(&self, name: &str) -> Result<Address, DecodeError> {
        match self.args.get(name) {
            Some(DynSolValue::Address(address)) => Ok(*address),
            _ => Err(self.missing(name, "address")),
        }
    }

    pub fn uint(&self, name: &str) -> Result<U256, DecodeError> {
        match self.args.get(name) {
            Some(DynSolValue::Uint(value, _)) => Ok(*value),
            _ => Err(self.missing(name, "uint")),
        }
    }

    fn missing(&self, name: &str, ty: &str) -> DecodeError {
        DecodeError::Malformed {
            method: self.method.clone(),
            reason: format!("no {} argument '{}'", ty, name),
        }
    }
}

/// Call-data decoder for one contract ABI, indexed by selector.
#[derive(Debug, Clone)]
pub struct AbiCodec {
    functions: HashMap<Selector, Function>,
}

impl AbiCodec {
    pub fn from_json(json: &str) -> Result<Self, DecodeError> {
        let abi: JsonAbi = serde_json::from_str(json).map_err(|e| DecodeError::Malformed {
            method: "<abi>".to_string(),
            reason: e.to_string(),
        })?;
        let functions = abi
            .functions()
            .map(|f| (f.selector(), f.clone()))
            .collect();
        Ok(Self { functions })
    }

    /// Unpacks the arguments of the method selected by the first four bytes.
    pub fn decode_call_data(&self, data: &[u8]) -> Result<DecodedCall, DecodeError> {
        if data.len() < 4 {
            return Err(DecodeError::ShortInput(data.len()));
        }
        let selector = Selector::from_slice(&data[..4]);
        let function = self
            .functions
            .get(&selector)
            .ok_or(DecodeError::UnknownSelector(selector))?;

        let malformed = |reason: String| DecodeError::Malformed {
            method: function.name.clone(),
            reason,
        };

        let types = function
            .inputs
            .iter()
            .map(|p| p.resolve())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| malformed(e.to_string()))?;

        let values = match DynSolType::Tuple(types)
            .abi_decode_params(&data[4..])
            .map_err(|e| malformed(e.to_string()))?
        {
            DynSolValue::Tuple(values) => values,
            other => vec![other],
        };

        let args = function
            .inputs
            .iter()
            .map(|p| p.name.clone())
            .zip(values)
            .collect();

        Ok(DecodedCall {
            method: function.name.clone(),
            args,
        })
    }
}

/// The ABIs an adapter decodes against.
#[derive(Debug, Clone)]
pub struct AbiRegistry {
    erc20: AbiCodec,
    erc721: AbiCodec,
    staking: AbiCodec,
}

impl AbiRegistry {
    /// Loads the ABI files embedded in the binary.
    pub fn load() -> Result<Self, DecodeError> {
        Ok(Self {
            erc20: AbiCodec::from_json(ERC20_ABI)?,
            erc721: AbiCodec::from_json(ERC721_ABI)?,
            staking: AbiCodec::from_json(STAKING_ABI)?,
        })
    }

    pub fn get(&self, kind: AbiKind) -> &AbiCodec {
        match kind {
            AbiKind::Erc20 => &self.erc20,
            AbiKind::Erc721 => &self.erc721,
            AbiKind::Staking => &self.staking,
        }
    }
}

/// Call data for `balanceOf(wallet)`.
pub fn encode_balance_of(wallet: Address) -> Bytes {
    balanceOfCall { _owner: wallet }.abi_encode().into()
}

/// Parses a hex-encoded, zero-padded unsigned integer as returned by `eth_call`.
///
/// Leading zero nibbles are stripped first; an all-zero word is 0.
pub fn decode_padded_uint(raw: &str) -> Result<U256, DecodeError> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    if digits.is_empty() {
        return Err(DecodeError::InvalidHex(raw.to_string()));
    }

    let significant = digits.trim_start_matches('0');
    if significant.is_empty() {
        return Ok(U256::ZERO);
    }

    U256::from_str_radix(significant, 16).map_err(|_| DecodeError::InvalidHex(raw.to_string()))
}

struct LogMeta {
    block_number: u64,
    tx_hash: B256,
    log_index: u64,
}

fn word(data: &[u8], index: usize) -> Option<U256> {
    let start = index * 32;
    data.get(start..start + 32).map(U256::from_be_slice)
}

fn malformed(event: &str, reason: &str) -> DecodeError {
    DecodeError::Malformed {
        method: event.to_string(),
        reason: reason.to_string(),
    }
}

fn expect_topics(topics: &[B256], expected: usize) -> Result<(), DecodeError> {
    if topics.len() != expected {
        return Err(DecodeError::UnexpectedTopics {
            expected,
            actual: topics.len(),
        });
    }
    Ok(())
}

fn token_type(event: &str, word: U256) -> Result<u8, DecodeError> {
    if word > U256::from(u8::MAX) {
        return Err(malformed(event, "token type overflows uint8"));
    }
    Ok(word.as_limbs()[0] as u8)
}

/// Stake target IDs are 16-byte UUIDs stored in the low half of the topic.
fn target_from_topic(topic: &B256) -> B128 {
    B128::from_slice(&topic[16..])
}

/// Decodes a log of any known event into a typed [`LogEvent`].
///
/// Returns `Ok(None)` for logs removed by a reorg and for events we do not
/// know. A known event with the wrong shape is a [`DecodeError`].
pub fn decode_log(log: &Log) -> Result<Option<LogEvent>, DecodeError> {
    if log.removed {
        return Ok(None);
    }

    let inner = &log.inner;
    let topics = inner.data.topics();
    let data = inner.data.data.as_ref();
    let Some(signature) = topics.first() else {
        return Ok(None);
    };

    let meta = LogMeta {
        block_number: log.block_number.unwrap_or(0),
        tx_hash: log.transaction_hash.unwrap_or_default(),
        log_index: log.log_index.unwrap_or(0),
    };

    let event = if *signature == Transfer::SIGNATURE_HASH {
        decode_transfer(inner.address, topics, data, meta)?
    } else if *signature == Stake::SIGNATURE_HASH {
        LogEvent::Stake(decode_stake("Stake", topics, data, meta)?)
    } else if *signature == Unstake::SIGNATURE_HASH {
        LogEvent::Unstake(decode_stake("Unstake", topics, data, meta)?)
    } else if *signature == Restake::SIGNATURE_HASH {
        decode_restake(topics, data, meta)?
    } else {
        return Ok(None);
    };

    Ok(Some(event))
}

// ERC20 and ERC721 share the Transfer signature; only the topic count differs.
fn decode_transfer(
    contract: Address,
    topics: &[B256],
    data: &[u8],
    meta: LogMeta,
) -> Result<LogEvent, DecodeError> {
    match topics.len() {
        3 => {
            let value = word(data, 0).ok_or_else(|| malformed("Transfer", "missing value"))?;
            Ok(LogEvent::Erc20Transfer(TransferErc20Log {
                block_number: meta.block_number,
                contract,
                from: Address::from_word(topics[1]),
                to: Address::from_word(topics[2]),
                value,
                tx_hash: meta.tx_hash,
                log_index: meta.log_index,
            }))
        }
        4 => Ok(LogEvent::NftTransfer(TransferNftLog {
            block_number: meta.block_number,
            contract,
            from: Address::from_word(topics[1]),
            to: Address::from_word(topics[2]),
            token_id: U256::from_be_slice(topics[3].as_slice()),
            tx_hash: meta.tx_hash,
            log_index: meta.log_index,
        })),
        actual => Err(DecodeError::UnexpectedTopics {
            expected: 3,
            actual,
        }),
    }
}

fn decode_stake(
    event: &str,
    topics: &[B256],
    data: &[u8],
    meta: LogMeta,
) -> Result<StakeLog, DecodeError> {
    expect_topics(topics, 3)?;
    let (Some(amount), Some(token), Some(total)) = (word(data, 0), word(data, 1), word(data, 2))
    else {
        return Err(malformed(event, "data shorter than three words"));
    };
    let token_type = token_type(event, token)?;

    Ok(StakeLog {
        block_number: meta.block_number,
        tx_hash: meta.tx_hash,
        log_index: meta.log_index,
        user_wallet: Address::from_word(topics[1]),
        target: target_from_topic(&topics[2]),
        amount,
        token_type,
        total_staked: total,
    })
}

fn decode_restake(topics: &[B256], data: &[u8], meta: LogMeta) -> Result<LogEvent, DecodeError> {
    expect_topics(topics, 4)?;
    let (Some(amount), Some(token), Some(total_from), Some(total_to)) =
        (word(data, 0), word(data, 1), word(data, 2), word(data, 3))
    else {
        return Err(malformed("Restake", "data shorter than four words"));
    };
    let token_type = token_type("Restake", token)?;

    Ok(LogEvent::Restake(RestakeLog {
        block_number: meta.block_number,
        tx_hash: meta.tx_hash,
        log_index: meta.log_index,
        user_wallet: Address::from_word(topics[1]),
        from_target: target_from_topic(&topics[2]),
        to_target: target_from_topic(&topics[3]),
        amount,
        token_type,
        total_staked_from: total_from,
        total_staked_to: total_to,
    }))
}
