//! Swap contract and ERC-20 ABI codec.
//!
//! Field orderings are fixed by the deployed contract. Every lock event is
//! declared without indexed parameters, so all fields live in the log data.

use swap_common::{event_topic, recompute_lock_id, selector, Address, LockEvent, LockKind, TimestampSource, H256, U256};
use thiserror::Error;
use web3::ethabi::{self, ParamType, Token};

use crate::provider::ChainLog;

/// One 32-byte ABI word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Word {
    Address,
    Bytes32,
    Uint,
}

impl Word {
    fn param_type(self) -> ParamType {
        match self {
            Word::Address => ParamType::Address,
            Word::Bytes32 => ParamType::FixedBytes(32),
            Word::Uint => ParamType::Uint(256),
        }
    }

    fn canonical(self) -> &'static str {
        match self {
            Word::Address => "address",
            Word::Bytes32 => "bytes32",
            Word::Uint => "uint256",
        }
    }
}

/// Fixed shape of one lock event
#[derive(Debug, Clone, Copy)]
pub struct EventSchema {
    pub kind: LockKind,
    pub fields: &'static [(&'static str, Word)],
}

const LOCK_BUY: EventSchema = EventSchema {
    kind: LockKind::OpenAsBuyer,
    fields: &[
        ("token", Word::Address),
        ("creator", Word::Address),
        ("recipient", Word::Address),
        ("hashedSecret", Word::Bytes32),
        ("timeout", Word::Uint),
        ("value", Word::Uint),
        ("sellAssetId", Word::Bytes32),
        ("sellPrice", Word::Uint),
        ("lockId", Word::Bytes32),
    ],
};

const LOCK_SELL: EventSchema = EventSchema {
    kind: LockKind::OpenAsSeller,
    fields: &[
        ("token", Word::Address),
        ("creator", Word::Address),
        ("recipient", Word::Address),
        ("hashedSecret", Word::Bytes32),
        ("timeout", Word::Uint),
        ("value", Word::Uint),
        ("buyAssetId", Word::Bytes32),
        ("buyLockId", Word::Bytes32),
    ],
};

const UNLOCK: EventSchema = EventSchema {
    kind: LockKind::Unlocked,
    fields: &[
        ("token", Word::Address),
        ("creator", Word::Address),
        ("recipient", Word::Address),
        ("lockId", Word::Bytes32),
        ("secret", Word::Bytes32),
    ],
};

const RETRIEVE: EventSchema = EventSchema {
    kind: LockKind::Retrieved,
    fields: &[
        ("token", Word::Address),
        ("creator", Word::Address),
        ("recipient", Word::Address),
        ("lockId", Word::Bytes32),
    ],
};

const DECLINE: EventSchema = EventSchema {
    kind: LockKind::Declined,
    fields: &[
        ("token", Word::Address),
        ("creator", Word::Address),
        ("recipient", Word::Address),
        ("lockId", Word::Bytes32),
    ],
};

impl EventSchema {
    pub fn for_kind(kind: LockKind) -> &'static EventSchema {
        match kind {
            LockKind::OpenAsBuyer => &LOCK_BUY,
            LockKind::OpenAsSeller => &LOCK_SELL,
            LockKind::Unlocked => &UNLOCK,
            LockKind::Retrieved => &RETRIEVE,
            LockKind::Declined => &DECLINE,
        }
    }

    /// Canonical signature, e.g. `Retrieve(address,address,address,bytes32)`
    pub fn signature(&self) -> String {
        let types: Vec<&str> = self.fields.iter().map(|(_, word)| word.canonical()).collect();
        format!("{}({})", self.kind.event_name(), types.join(","))
    }

    pub fn topic(&self) -> H256 {
        event_topic(&self.signature())
    }

    fn param_types(&self) -> Vec<ParamType> {
        self.fields.iter().map(|(_, word)| word.param_type()).collect()
    }
}

/// Topic-0 of each lock event kind
pub fn lock_topic(kind: LockKind) -> H256 {
    EventSchema::for_kind(kind).topic()
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AbiError {
    #[error("Log has no topics")]
    MissingTopic,

    #[error("Log topic {0:?} is not a lock event")]
    UnknownTopic(H256),

    #[error("Log was removed by a reorg")]
    Removed,

    #[error("Malformed {kind} log: {reason}")]
    Malformed { kind: LockKind, reason: String },

    #[error("Malformed return data: {0}")]
    Output(String),
}

/// Decoded field values of one log, addressed by name
struct Fields<'a> {
    schema: &'a EventSchema,
    tokens: Vec<Token>,
}

impl<'a> Fields<'a> {
    fn token(&self, name: &str) -> Result<&Token, AbiError> {
        self.schema
            .fields
            .iter()
            .position(|(field, _)| *field == name)
            .and_then(|index| self.tokens.get(index))
            .ok_or_else(|| self.malformed(format!("missing field {}", name)))
    }

    fn address(&self, name: &str) -> Result<Address, AbiError> {
        match self.token(name)? {
            Token::Address(address) => Ok(*address),
            other => Err(self.malformed(format!("{} is not an address: {:?}", name, other))),
        }
    }

    fn bytes32(&self, name: &str) -> Result<H256, AbiError> {
        match self.token(name)? {
            Token::FixedBytes(bytes) if bytes.len() == 32 => Ok(H256::from_slice(bytes)),
            other => Err(self.malformed(format!("{} is not bytes32: {:?}", name, other))),
        }
    }

    fn uint(&self, name: &str) -> Result<U256, AbiError> {
        match self.token(name)? {
            Token::Uint(value) => Ok(*value),
            other => Err(self.malformed(format!("{} is not uint256: {:?}", name, other))),
        }
    }

    fn timeout(&self) -> Result<u64, AbiError> {
        let timeout = self.uint("timeout")?;
        if timeout > U256::from(u64::MAX) {
            return Err(self.malformed(format!("timeout {} out of range", timeout)));
        }
        Ok(timeout.as_u64())
    }

    fn malformed(&self, reason: String) -> AbiError {
        AbiError::Malformed { kind: self.schema.kind, reason }
    }
}

/// Decode a swap contract log into a [`LockEvent`].
///
/// `observed_at` is provisional; callers overwrite it when a block timestamp
/// is available. `LockSell` logs carry no lock id, so it is recomputed from
/// `(token, creator, hashedSecret, timeout)`.
pub fn decode_lock_log(log: &ChainLog, observed_at: u64) -> Result<LockEvent, AbiError> {
    if log.removed {
        return Err(AbiError::Removed);
    }
    let topic = *log.topics.first().ok_or(AbiError::MissingTopic)?;
    let schema = LockKind::ALL
        .iter()
        .map(|kind| EventSchema::for_kind(*kind))
        .find(|schema| schema.topic() == topic)
        .ok_or(AbiError::UnknownTopic(topic))?;

    let tokens = ethabi::decode(&schema.param_types(), &log.data).map_err(|e| AbiError::Malformed {
        kind: schema.kind,
        reason: e.to_string(),
    })?;
    let fields = Fields { schema, tokens };

    let token = fields.address("token")?;
    let creator = fields.address("creator")?;
    let recipient = fields.address("recipient")?;

    let mut event = match schema.kind {
        LockKind::OpenAsBuyer => {
            let mut event = LockEvent::new(schema.kind, token, creator, recipient, fields.bytes32("lockId")?, observed_at);
            event.hashed_secret = Some(fields.bytes32("hashedSecret")?);
            event.timeout_epoch_seconds = Some(fields.timeout()?);
            event.value = Some(fields.uint("value")?);
            event.counterparty_asset_id = Some(fields.bytes32("sellAssetId")?);
            event.price = Some(fields.uint("sellPrice")?);
            event
        }
        LockKind::OpenAsSeller => {
            let hashed_secret = fields.bytes32("hashedSecret")?;
            let timeout = fields.timeout()?;
            let lock_id = recompute_lock_id(&token, &creator, &hashed_secret, timeout);
            let mut event = LockEvent::new(schema.kind, token, creator, recipient, lock_id, observed_at);
            event.hashed_secret = Some(hashed_secret);
            event.timeout_epoch_seconds = Some(timeout);
            event.value = Some(fields.uint("value")?);
            event.counterparty_asset_id = Some(fields.bytes32("buyAssetId")?);
            event.counterparty_lock_id = Some(fields.bytes32("buyLockId")?);
            event
        }
        LockKind::Unlocked => {
            let mut event = LockEvent::new(schema.kind, token, creator, recipient, fields.bytes32("lockId")?, observed_at);
            event.secret = Some(fields.bytes32("secret")?);
            event
        }
        LockKind::Retrieved | LockKind::Declined => {
            LockEvent::new(schema.kind, token, creator, recipient, fields.bytes32("lockId")?, observed_at)
        }
    };

    event.timestamp_source = TimestampSource::Ingestion;
    event.block_number = log.block_number;
    event.tx_hash = log.transaction_hash;
    event.log_index = log.log_index;
    Ok(event)
}

/// Encode a lock event as the contract would emit it
pub fn encode_lock_log(event: &LockEvent, contract: Address) -> ChainLog {
    let schema = EventSchema::for_kind(event.kind);
    let tokens: Vec<Token> = schema
        .fields
        .iter()
        .map(|(name, _)| match *name {
            "token" => Token::Address(event.token),
            "creator" => Token::Address(event.creator),
            "recipient" => Token::Address(event.recipient),
            "lockId" => bytes32_token(event.lock_id),
            "hashedSecret" => bytes32_token(event.hashed_secret.unwrap_or_default()),
            "timeout" => Token::Uint(U256::from(event.timeout_epoch_seconds.unwrap_or_default())),
            "value" => Token::Uint(event.value.unwrap_or_default()),
            "sellPrice" => Token::Uint(event.price.unwrap_or_default()),
            "sellAssetId" | "buyAssetId" => bytes32_token(event.counterparty_asset_id.unwrap_or_default()),
            "buyLockId" => bytes32_token(event.counterparty_lock_id.unwrap_or_default()),
            "secret" => bytes32_token(event.secret.unwrap_or_default()),
            _ => Token::Uint(U256::zero()),
        })
        .collect();

    ChainLog {
        address: contract,
        topics: vec![schema.topic()],
        data: ethabi::encode(&tokens),
        block_number: event.block_number,
        transaction_hash: event.tx_hash,
        log_index: event.log_index,
        removed: false,
    }
}

fn bytes32_token(value: H256) -> Token {
    Token::FixedBytes(value.as_bytes().to_vec())
}

/// Mutating and read calls on the swap contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapCall {
    LockBuy {
        token: Address,
        recipient: Address,
        hashed_secret: H256,
        timeout: u64,
        value: U256,
        sell_asset_id: H256,
        sell_price: U256,
    },
    LockSell {
        token: Address,
        recipient: Address,
        hashed_secret: H256,
        timeout: u64,
        value: U256,
        buy_asset_id: H256,
        buy_lock_id: H256,
    },
    Unlock {
        token: Address,
        creator: Address,
        secret: H256,
        timeout: u64,
    },
    Retrieve {
        token: Address,
        recipient: Address,
        hashed_secret: H256,
        timeout: u64,
    },
    Decline {
        token: Address,
        creator: Address,
        hashed_secret: H256,
        timeout: u64,
    },
    GetLockValue {
        lock_id: H256,
    },
}

const LOCK_BUY_FN: &str = "lockBuy(address,address,bytes32,uint256,uint256,bytes32,uint256)";
const LOCK_SELL_FN: &str = "lockSell(address,address,bytes32,uint256,uint256,bytes32,bytes32)";
const UNLOCK_FN: &str = "unlock(address,address,bytes32,uint256)";
const RETRIEVE_FN: &str = "retrieve(address,address,bytes32,uint256)";
const DECLINE_FN: &str = "decline(address,address,bytes32,uint256)";
const GET_LOCK_VALUE_FN: &str = "getLockValue(bytes32)";

impl SwapCall {
    pub fn signature(&self) -> &'static str {
        match self {
            SwapCall::LockBuy { .. } => LOCK_BUY_FN,
            SwapCall::LockSell { .. } => LOCK_SELL_FN,
            SwapCall::Unlock { .. } => UNLOCK_FN,
            SwapCall::Retrieve { .. } => RETRIEVE_FN,
            SwapCall::Decline { .. } => DECLINE_FN,
            SwapCall::GetLockValue { .. } => GET_LOCK_VALUE_FN,
        }
    }

    fn tokens(&self) -> Vec<Token> {
        match self {
            SwapCall::LockBuy { token, recipient, hashed_secret, timeout, value, sell_asset_id, sell_price } => vec![
                Token::Address(*token),
                Token::Address(*recipient),
                bytes32_token(*hashed_secret),
                Token::Uint(U256::from(*timeout)),
                Token::Uint(*value),
                bytes32_token(*sell_asset_id),
                Token::Uint(*sell_price),
            ],
            SwapCall::LockSell { token, recipient, hashed_secret, timeout, value, buy_asset_id, buy_lock_id } => vec![
                Token::Address(*token),
                Token::Address(*recipient),
                bytes32_token(*hashed_secret),
                Token::Uint(U256::from(*timeout)),
                Token::Uint(*value),
                bytes32_token(*buy_asset_id),
                bytes32_token(*buy_lock_id),
            ],
            SwapCall::Unlock { token, creator, secret, timeout } => vec![
                Token::Address(*token),
                Token::Address(*creator),
                bytes32_token(*secret),
                Token::Uint(U256::from(*timeout)),
            ],
            SwapCall::Retrieve { token, recipient, hashed_secret, timeout } => vec![
                Token::Address(*token),
                Token::Address(*recipient),
                bytes32_token(*hashed_secret),
                Token::Uint(U256::from(*timeout)),
            ],
            SwapCall::Decline { token, creator, hashed_secret, timeout } => vec![
                Token::Address(*token),
                Token::Address(*creator),
                bytes32_token(*hashed_secret),
                Token::Uint(U256::from(*timeout)),
            ],
            SwapCall::GetLockValue { lock_id } => vec![bytes32_token(*lock_id)],
        }
    }

    /// Selector-prefixed calldata
    pub fn encode(&self) -> Vec<u8> {
        with_selector(self.signature(), &self.tokens())
    }

    /// Decode calldata produced by [`SwapCall::encode`]
    pub fn decode(data: &[u8]) -> Option<SwapCall> {
        let (head, body) = split_selector(data)?;
        let word = |words: &[Word]| -> Option<Vec<Token>> {
            let types: Vec<ParamType> = words.iter().map(|w| w.param_type()).collect();
            ethabi::decode(&types, body).ok()
        };
        use Word::{Address as A, Bytes32 as B, Uint as U};

        if head == selector(LOCK_BUY_FN) {
            let t = word(&[A, A, B, U, U, B, U])?;
            Some(SwapCall::LockBuy {
                token: t[0].clone().into_address()?,
                recipient: t[1].clone().into_address()?,
                hashed_secret: h256(&t[2])?,
                timeout: u64_of(&t[3])?,
                value: t[4].clone().into_uint()?,
                sell_asset_id: h256(&t[5])?,
                sell_price: t[6].clone().into_uint()?,
            })
        } else if head == selector(LOCK_SELL_FN) {
            let t = word(&[A, A, B, U, U, B, B])?;
            Some(SwapCall::LockSell {
                token: t[0].clone().into_address()?,
                recipient: t[1].clone().into_address()?,
                hashed_secret: h256(&t[2])?,
                timeout: u64_of(&t[3])?,
                value: t[4].clone().into_uint()?,
                buy_asset_id: h256(&t[5])?,
                buy_lock_id: h256(&t[6])?,
            })
        } else if head == selector(UNLOCK_FN) {
            let t = word(&[A, A, B, U])?;
            Some(SwapCall::Unlock {
                token: t[0].clone().into_address()?,
                creator: t[1].clone().into_address()?,
                secret: h256(&t[2])?,
                timeout: u64_of(&t[3])?,
            })
        } else if head == selector(RETRIEVE_FN) {
            let t = word(&[A, A, B, U])?;
            Some(SwapCall::Retrieve {
                token: t[0].clone().into_address()?,
                recipient: t[1].clone().into_address()?,
                hashed_secret: h256(&t[2])?,
                timeout: u64_of(&t[3])?,
            })
        } else if head == selector(DECLINE_FN) {
            let t = word(&[A, A, B, U])?;
            Some(SwapCall::Decline {
                token: t[0].clone().into_address()?,
                creator: t[1].clone().into_address()?,
                hashed_secret: h256(&t[2])?,
                timeout: u64_of(&t[3])?,
            })
        } else if head == selector(GET_LOCK_VALUE_FN) {
            let t = word(&[B])?;
            Some(SwapCall::GetLockValue { lock_id: h256(&t[0])? })
        } else {
            None
        }
    }
}

/// Standard fungible-token calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Erc20Call {
    BalanceOf { owner: Address },
    Allowance { owner: Address, spender: Address },
    Approve { spender: Address, amount: U256 },
    Decimals,
    Symbol,
}

const BALANCE_OF_FN: &str = "balanceOf(address)";
const ALLOWANCE_FN: &str = "allowance(address,address)";
const APPROVE_FN: &str = "approve(address,uint256)";
const DECIMALS_FN: &str = "decimals()";
const SYMBOL_FN: &str = "symbol()";

impl Erc20Call {
    pub fn signature(&self) -> &'static str {
        match self {
            Erc20Call::BalanceOf { .. } => BALANCE_OF_FN,
            Erc20Call::Allowance { .. } => ALLOWANCE_FN,
            Erc20Call::Approve { .. } => APPROVE_FN,
            Erc20Call::Decimals => DECIMALS_FN,
            Erc20Call::Symbol => SYMBOL_FN,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let tokens = match self {
            Erc20Call::BalanceOf { owner } => vec![Token::Address(*owner)],
            Erc20Call::Allowance { owner, spender } => vec![Token::Address(*owner), Token::Address(*spender)],
            Erc20Call::Approve { spender, amount } => vec![Token::Address(*spender), Token::Uint(*amount)],
            Erc20Call::Decimals | Erc20Call::Symbol => vec![],
        };
        with_selector(self.signature(), &tokens)
    }

    pub fn decode(data: &[u8]) -> Option<Erc20Call> {
        let (head, body) = split_selector(data)?;
        if head == selector(BALANCE_OF_FN) {
            let t = ethabi::decode(&[ParamType::Address], body).ok()?;
            Some(Erc20Call::BalanceOf { owner: t[0].clone().into_address()? })
        } else if head == selector(ALLOWANCE_FN) {
            let t = ethabi::decode(&[ParamType::Address, ParamType::Address], body).ok()?;
            Some(Erc20Call::Allowance {
                owner: t[0].clone().into_address()?,
                spender: t[1].clone().into_address()?,
            })
        } else if head == selector(APPROVE_FN) {
            let t = ethabi::decode(&[ParamType::Address, ParamType::Uint(256)], body).ok()?;
            Some(Erc20Call::Approve {
                spender: t[0].clone().into_address()?,
                amount: t[1].clone().into_uint()?,
            })
        } else if head == selector(DECIMALS_FN) {
            Some(Erc20Call::Decimals)
        } else if head == selector(SYMBOL_FN) {
            Some(Erc20Call::Symbol)
        } else {
            None
        }
    }
}

fn with_selector(signature: &str, tokens: &[Token]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    data.extend_from_slice(&ethabi::encode(tokens));
    data
}

fn split_selector(data: &[u8]) -> Option<([u8; 4], &[u8])> {
    if data.len() < 4 {
        return None;
    }
    let mut head = [0u8; 4];
    head.copy_from_slice(&data[..4]);
    Some((head, &data[4..]))
}

fn h256(token: &Token) -> Option<H256> {
    match token {
        Token::FixedBytes(bytes) if bytes.len() == 32 => Some(H256::from_slice(bytes)),
        _ => None,
    }
}

fn u64_of(token: &Token) -> Option<u64> {
    let value = token.clone().into_uint()?;
    (value <= U256::from(u64::MAX)).then(|| value.as_u64())
}

/// Decode a single `uint256` return value
pub fn decode_uint(output: &[u8]) -> Result<U256, AbiError> {
    ethabi::decode(&[ParamType::Uint(256)], output)
        .map_err(|e| AbiError::Output(e.to_string()))?
        .pop()
        .and_then(Token::into_uint)
        .ok_or_else(|| AbiError::Output("expected uint256".to_string()))
}

/// Decode an ERC-20 `symbol()` result; accepts both `string` and legacy `bytes32`
pub fn decode_symbol(output: &[u8]) -> Result<String, AbiError> {
    if let Ok(mut tokens) = ethabi::decode(&[ParamType::String], output) {
        if let Some(Token::String(symbol)) = tokens.pop() {
            return Ok(symbol);
        }
    }
    if output.len() == 32 {
        let trimmed: Vec<u8> = output.iter().copied().take_while(|b| *b != 0).collect();
        if let Ok(symbol) = String::from_utf8(trimmed) {
            return Ok(symbol);
        }
    }
    Err(AbiError::Output("expected string or bytes32 symbol".to_string()))
}

/// Encode a single return value, as a node would
pub fn encode_output(token: Token) -> Vec<u8> {
    ethabi::encode(&[token])
}

const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

/// Best-effort decoding of a revert payload (`Error(string)` or `Panic(uint256)`)
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    let (head, body) = split_selector(data)?;
    if head == ERROR_STRING_SELECTOR {
        match ethabi::decode(&[ParamType::String], body).ok()?.pop()? {
            Token::String(reason) => Some(reason),
            _ => None,
        }
    } else if head == PANIC_SELECTOR {
        let code = ethabi::decode(&[ParamType::Uint(256)], body).ok()?.pop()?.into_uint()?;
        Some(format!("panic code {:#x}", code))
    } else {
        None
    }
}

/// Encode an `Error(string)` revert payload
pub fn encode_revert_reason(reason: &str) -> Vec<u8> {
    let mut data = ERROR_STRING_SELECTOR.to_vec();
    data.extend_from_slice(&ethabi::encode(&[Token::String(reason.to_string())]));
    data
}

/// Parse hex revert data as carried by JSON-RPC errors
pub fn revert_bytes(data: &str) -> Option<Vec<u8>> {
    let trimmed = data.trim().trim_matches('"');
    hex::decode(trimmed.strip_prefix("0x").unwrap_or(trimmed)).ok()
}
