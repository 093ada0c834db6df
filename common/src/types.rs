use std::fmt;
use std::str::FromStr;

use ethereum_types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

use crate::error::{SwapError, SwapResult};

/// Lifecycle event kinds emitted by the swap contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockKind {
    OpenAsBuyer,
    OpenAsSeller,
    Unlocked,
    Retrieved,
    Declined,
}

impl LockKind {
    /// All kinds, in subscription order
    pub const ALL: [LockKind; 5] = [
        LockKind::OpenAsBuyer,
        LockKind::OpenAsSeller,
        LockKind::Unlocked,
        LockKind::Retrieved,
        LockKind::Declined,
    ];

    /// Event name as declared by the contract
    pub fn event_name(&self) -> &'static str {
        match self {
            LockKind::OpenAsBuyer => "LockBuy",
            LockKind::OpenAsSeller => "LockSell",
            LockKind::Unlocked => "Unlock",
            LockKind::Retrieved => "Retrieve",
            LockKind::Declined => "Decline",
        }
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

/// Where an event's `observed_at` came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampSource {
    /// Timestamp of the block that included the event
    Block,
    /// Local time the event was ingested; used when the provider cannot
    /// resolve block timestamps, so historical events appear newer than they are
    Ingestion,
}

/// Immutable record of one lock lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockEvent {
    pub kind: LockKind,
    pub token: Address,
    pub creator: Address,
    pub recipient: Address,
    pub lock_id: H256,
    pub hashed_secret: Option<H256>,
    pub timeout_epoch_seconds: Option<u64>,
    pub value: Option<U256>,
    /// Buyer's asking price (LockBuy `sellPrice`)
    pub price: Option<U256>,
    pub counterparty_asset_id: Option<H256>,
    pub counterparty_lock_id: Option<H256>,
    pub secret: Option<H256>,
    /// Unix milliseconds
    pub observed_at: u64,
    pub timestamp_source: TimestampSource,
    pub block_number: Option<u64>,
    pub tx_hash: Option<H256>,
    pub log_index: Option<u64>,
}

impl LockEvent {
    /// Bare event with only identity fields populated
    pub fn new(
        kind: LockKind,
        token: Address,
        creator: Address,
        recipient: Address,
        lock_id: H256,
        observed_at: u64,
    ) -> Self {
        Self {
            kind,
            token,
            creator,
            recipient,
            lock_id,
            hashed_secret: None,
            timeout_epoch_seconds: None,
            value: None,
            price: None,
            counterparty_asset_id: None,
            counterparty_lock_id: None,
            secret: None,
            observed_at,
            timestamp_source: TimestampSource::Ingestion,
            block_number: None,
            tx_hash: None,
            log_index: None,
        }
    }

    /// Deduplication key
    pub fn identity(&self) -> IdentityKey {
        IdentityKey {
            kind: self.kind,
            lock_id: self.lock_id,
            token: self.token,
            creator: self.creator,
            recipient: self.recipient,
        }
    }

    /// Whether `account` is the creator or recipient of this event
    pub fn involves(&self, account: &Address) -> bool {
        self.creator == *account || self.recipient == *account
    }
}

/// `(kind, lockId, token, creator, recipient)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub kind: LockKind,
    pub lock_id: H256,
    pub token: Address,
    pub creator: Address,
    pub recipient: Address,
}

/// Wallet connection identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub account: Option<Address>,
    pub chain_id: Option<U256>,
    pub is_connected: bool,
}

impl ConnectionState {
    pub fn connected(account: Address, chain_id: U256) -> Self {
        Self {
            account: Some(account),
            chain_id: Some(chain_id),
            is_connected: true,
        }
    }
}

/// Parse a `0x`-prefixed (or bare) hex address. Checksum casing is ignored.
pub fn parse_address(input: &str) -> SwapResult<Address> {
    let trimmed = input.trim();
    let hex_part = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")).unwrap_or(trimmed);
    if hex_part.len() != 40 {
        return Err(SwapError::InvalidInput(format!("Invalid address: {}", input)));
    }
    Address::from_str(&hex_part.to_ascii_lowercase())
        .map_err(|_| SwapError::InvalidInput(format!("Invalid address: {}", input)))
}

/// Parse a 32-byte hex value
pub fn parse_h256(input: &str) -> SwapResult<H256> {
    let trimmed = input.trim();
    let hex_part = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")).unwrap_or(trimmed);
    if hex_part.len() != 64 {
        return Err(SwapError::InvalidInput(format!("Invalid 32-byte hex value: {}", input)));
    }
    H256::from_str(&hex_part.to_ascii_lowercase())
        .map_err(|_| SwapError::InvalidInput(format!("Invalid 32-byte hex value: {}", input)))
}

/// Case-insensitive comparison of two textual addresses
pub fn addresses_match(a: &str, b: &str) -> bool {
    match (parse_address(a), parse_address(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.trim().eq_ignore_ascii_case(b.trim()),
    }
}

/// Full lowercase hex rendering (`Address`'s `Display` abbreviates)
pub fn address_hex(address: &Address) -> String {
    format!("{:?}", address)
}

/// Shortened `0x1234…abcd` rendering for log lines
pub fn short_hash(hash: &H256) -> String {
    let full = format!("{:?}", hash);
    format!("{}…", &full[..10])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_ignores_case() {
        let lower = parse_address("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        let upper = parse_address("0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
        assert_eq!(lower, upper);
        assert!(addresses_match(
            "0x52908400098527886E0F7030069857D2E4169EE7",
            "0x52908400098527886e0f7030069857d2e4169ee7"
        ));
    }

    #[test]
    fn test_parse_address_rejects_garbage() {
        assert!(matches!(parse_address("0x1234"), Err(SwapError::InvalidInput(_))));
        assert!(matches!(
            parse_address("0xzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"),
            Err(SwapError::InvalidInput(_))
        ));
        assert!(parse_h256("0x12").is_err());
    }

    #[test]
    fn test_identity_ignores_observed_at() {
        let a = LockEvent::new(
            LockKind::Retrieved,
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            Address::repeat_byte(3),
            H256::repeat_byte(9),
            5,
        );
        let mut b = a.clone();
        b.observed_at = 1_000;
        b.block_number = Some(42);
        assert_eq!(a.identity(), b.identity());

        let mut c = a.clone();
        c.kind = LockKind::Declined;
        assert_ne!(a.identity(), c.identity());
    }

    #[test]
    fn test_involves() {
        let event = LockEvent::new(
            LockKind::OpenAsBuyer,
            Address::repeat_byte(1),
            Address::repeat_byte(0xaa),
            Address::repeat_byte(0xbb),
            H256::zero(),
            0,
        );
        assert!(event.involves(&Address::repeat_byte(0xaa)));
        assert!(event.involves(&Address::repeat_byte(0xbb)));
        assert!(!event.involves(&Address::repeat_byte(0xcc)));
    }
}
