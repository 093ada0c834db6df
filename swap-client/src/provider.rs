//! Chain provider boundary.
//!
//! Everything the client needs from a wallet-backed node goes through
//! [`ChainProvider`]. Implementations may leave any capability unsupported by
//! returning [`ProviderError::Unsupported`]; callers degrade instead of failing.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use swap_common::{Address, ProviderError, H256, U256};
use tokio::sync::broadcast;

/// Result type of provider calls
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Live log feed returned by [`ChainProvider::subscribe_logs`]
pub type LogStream = Pin<Box<dyn Stream<Item = ProviderResult<ChainLog>> + Send>>;

/// A raw contract log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLog {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<H256>,
    pub log_index: Option<u64>,
    /// Dropped by a reorg
    pub removed: bool,
}

/// Block range of a log query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRange {
    /// Let the provider pick its default window
    ProviderDefault,
    Bounded { from: u64, to: u64 },
}

/// Log filter: one contract, one event signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub address: Address,
    pub topic0: H256,
    pub range: BlockRange,
}

/// Transaction to be signed and sent by the wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub from: Address,
    pub to: Address,
    pub data: Vec<u8>,
    pub gas: Option<U256>,
}

/// Read-only contract call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Option<Address>,
    pub to: Address,
    pub data: Vec<u8>,
}

/// Outcome of a mined transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    pub success: bool,
    pub logs: Vec<ChainLog>,
}

/// Notifications pushed by the wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    AccountsChanged(Vec<Address>),
    ChainChanged(U256),
    Disconnected,
}

/// Wallet-backed chain access
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Raw JSON-RPC request, used for capability checks
    async fn request(&self, method: &str, params: Vec<Value>) -> ProviderResult<Value>;

    /// Accounts currently exposed by the wallet, primary first
    async fn accounts(&self) -> ProviderResult<Vec<Address>>;

    async fn chain_id(&self) -> ProviderResult<U256>;

    async fn block_number(&self) -> ProviderResult<u64>;

    /// Block timestamp in seconds; `None` if the block is unknown
    async fn block_timestamp(&self, block_number: u64) -> ProviderResult<Option<u64>>;

    async fn logs(&self, query: LogQuery) -> ProviderResult<Vec<ChainLog>>;

    /// Register a live listener for logs matching `query`
    async fn subscribe_logs(&self, query: LogQuery) -> ProviderResult<LogStream>;

    async fn send_transaction(&self, tx: TxRequest) -> ProviderResult<H256>;

    /// Wait until `tx_hash` is mined with `confirmations` blocks on top
    async fn wait_for_confirmation(&self, tx_hash: H256, confirmations: usize) -> ProviderResult<TxReceipt>;

    async fn call(&self, call: CallRequest, block: Option<u64>) -> ProviderResult<Vec<u8>>;

    /// Push notifications for account and chain switches
    fn wallet_events(&self) -> ProviderResult<broadcast::Receiver<WalletEvent>>;
}

/// Parse the address list returned by `eth_requestAccounts` / `eth_accounts`
pub fn accounts_from_value(value: &Value) -> ProviderResult<Vec<Address>> {
    let entries = value
        .as_array()
        .ok_or_else(|| ProviderError::Decode(format!("Expected account list, got {}", value)))?;
    entries
        .iter()
        .map(|entry| {
            let text = entry
                .as_str()
                .ok_or_else(|| ProviderError::Decode(format!("Expected address string, got {}", entry)))?;
            swap_common::parse_address(text).map_err(|e| ProviderError::Decode(e.to_string()))
        })
        .collect()
}
