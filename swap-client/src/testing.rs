//! In-memory chain for exercising the client without a node.
//!
//! [`InMemoryChain`] implements [`ChainProvider`] with:
//! - accounts, chain id and wallet push notifications
//! - blocks with timestamps, one block per transaction or emitted event
//! - log storage, ranged log queries and live log streams
//! - ERC-20 balances, allowances and metadata
//! - the swap contract's lock actions and `getLockValue`
//! - fault toggles for every degraded path the client handles

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use swap_common::{
    hash_secret, keccak256, recompute_lock_id, Address, LockEvent, LockKind, ProviderError, H256, RPC_METHOD_NOT_FOUND,
    RPC_USER_REJECTED, U256,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use web3::ethabi::Token;

use crate::abi::{encode_lock_log, encode_output, encode_revert_reason, Erc20Call, SwapCall};
use crate::provider::{
    BlockRange, CallRequest, ChainLog, ChainProvider, LogQuery, LogStream, ProviderResult, TxReceipt, TxRequest,
    WalletEvent,
};

const GENESIS_TIMESTAMP: u64 = 1_700_000_000;
const BLOCK_TIME_SECS: u64 = 12;
const INITIAL_BLOCKS: u64 = 10;

/// Transaction as submitted by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTransaction {
    pub hash: H256,
    pub from: Address,
    pub to: Address,
    pub data: Vec<u8>,
    pub gas: Option<U256>,
}

impl SentTransaction {
    pub fn swap_call(&self) -> Option<SwapCall> {
        SwapCall::decode(&self.data)
    }

    pub fn erc20_call(&self) -> Option<Erc20Call> {
        Erc20Call::decode(&self.data)
    }
}

#[derive(Debug, Clone, Default)]
struct TokenState {
    balances: HashMap<Address, U256>,
    allowances: HashMap<(Address, Address), U256>,
    decimals: Option<u8>,
    symbol: Option<String>,
}

#[derive(Debug, Clone)]
struct LockRecord {
    token: Address,
    recipient: Address,
    value: U256,
}

#[derive(Debug)]
struct Faults {
    block_number_available: bool,
    block_timestamps_available: bool,
    logs_available: bool,
    subscriptions_available: bool,
    wallet_events_supported: bool,
    reads_failing: bool,
    hold_confirmations: bool,
    ranged_log_failures: u32,
    chain_id_failures: u32,
    reject_account_requests: bool,
    unsupported_methods: HashSet<String>,
    revert_next: Option<String>,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            block_number_available: true,
            block_timestamps_available: true,
            logs_available: true,
            subscriptions_available: true,
            wallet_events_supported: true,
            reads_failing: false,
            hold_confirmations: false,
            ranged_log_failures: 0,
            chain_id_failures: 0,
            reject_account_requests: false,
            unsupported_methods: HashSet::new(),
            revert_next: None,
        }
    }
}

struct ChainState {
    accounts: Vec<Address>,
    chain_id: U256,
    /// Timestamp per block number
    blocks: Vec<u64>,
    logs: Vec<ChainLog>,
    tokens: HashMap<Address, TokenState>,
    locks: HashMap<H256, LockRecord>,
    sent: Vec<SentTransaction>,
    receipts: HashMap<H256, TxReceipt>,
    requests: Vec<String>,
    nonce: u64,
    faults: Faults,
}

/// Scriptable [`ChainProvider`]
pub struct InMemoryChain {
    state: Mutex<ChainState>,
    live_logs: broadcast::Sender<ChainLog>,
    wallet: broadcast::Sender<WalletEvent>,
}

impl Default for InMemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChain {
    /// Address the swap contract is deployed at
    pub const SWAP_CONTRACT: Address = Address::repeat_byte(0x5a);

    pub const DEFAULT_CHAIN_ID: u64 = 31_337;

    pub fn new() -> Self {
        let (live_logs, _) = broadcast::channel(1024);
        let (wallet, _) = broadcast::channel(64);
        let blocks = (0..INITIAL_BLOCKS)
            .map(|n| GENESIS_TIMESTAMP + n * BLOCK_TIME_SECS)
            .collect();
        Self {
            state: Mutex::new(ChainState {
                accounts: Vec::new(),
                chain_id: U256::from(Self::DEFAULT_CHAIN_ID),
                blocks,
                logs: Vec::new(),
                tokens: HashMap::new(),
                locks: HashMap::new(),
                sent: Vec::new(),
                receipts: HashMap::new(),
                requests: Vec::new(),
                nonce: 0,
                faults: Faults::default(),
            }),
            live_logs,
            wallet,
        }
    }

    /// Chain with `accounts` exposed by the wallet
    pub fn with_accounts(accounts: Vec<Address>) -> Self {
        let chain = Self::new();
        chain.set_accounts(accounts);
        chain
    }

    // Wallet

    /// Change the exposed accounts without notifying
    pub fn set_accounts(&self, accounts: Vec<Address>) {
        self.state.lock().accounts = accounts;
    }

    /// Change the exposed accounts and push `accountsChanged`
    pub fn switch_accounts(&self, accounts: Vec<Address>) {
        self.set_accounts(accounts.clone());
        let _ = self.wallet.send(WalletEvent::AccountsChanged(accounts));
    }

    pub fn set_chain_id(&self, chain_id: u64) {
        self.state.lock().chain_id = U256::from(chain_id);
    }

    /// Change the chain and push `chainChanged`
    pub fn switch_chain(&self, chain_id: u64) {
        self.set_chain_id(chain_id);
        let _ = self.wallet.send(WalletEvent::ChainChanged(U256::from(chain_id)));
    }

    pub fn push_wallet_event(&self, event: WalletEvent) {
        let _ = self.wallet.send(event);
    }

    /// JSON-RPC methods seen by [`ChainProvider::request`], in order
    pub fn requests(&self) -> Vec<String> {
        self.state.lock().requests.clone()
    }

    // Tokens

    pub fn set_token(&self, token: Address, decimals: u8, symbol: &str) {
        let mut state = self.state.lock();
        let entry = state.tokens.entry(token).or_default();
        entry.decimals = Some(decimals);
        entry.symbol = Some(symbol.to_string());
    }

    pub fn mint(&self, token: Address, owner: Address, amount: U256) {
        let mut state = self.state.lock();
        let balance = state.tokens.entry(token).or_default().balances.entry(owner).or_default();
        *balance += amount;
    }

    pub fn balance_of(&self, token: Address, owner: Address) -> U256 {
        self.state
            .lock()
            .tokens
            .get(&token)
            .and_then(|t| t.balances.get(&owner).copied())
            .unwrap_or_default()
    }

    pub fn allowance_of(&self, token: Address, owner: Address, spender: Address) -> U256 {
        self.state
            .lock()
            .tokens
            .get(&token)
            .and_then(|t| t.allowances.get(&(owner, spender)).copied())
            .unwrap_or_default()
    }

    // Blocks and logs

    pub fn head(&self) -> u64 {
        self.state.lock().blocks.len() as u64 - 1
    }

    /// Mine `count` empty blocks
    pub fn mine(&self, count: u64) {
        let mut state = self.state.lock();
        for _ in 0..count {
            mine_block(&mut state);
        }
    }

    /// Emit `event` from the swap contract in a new block
    pub fn emit(&self, event: LockEvent) -> ChainLog {
        let mut state = self.state.lock();
        let block = mine_block(&mut state);
        let tx_hash = next_hash(&mut state);
        let log = store_log(&mut state, event, block, tx_hash, 0);
        let _ = self.live_logs.send(log.clone());
        log
    }

    pub fn sent_transactions(&self) -> Vec<SentTransaction> {
        self.state.lock().sent.clone()
    }

    // Faults

    pub fn set_block_number_available(&self, available: bool) {
        self.state.lock().faults.block_number_available = available;
    }

    pub fn set_block_timestamps_available(&self, available: bool) {
        self.state.lock().faults.block_timestamps_available = available;
    }

    pub fn set_logs_available(&self, available: bool) {
        self.state.lock().faults.logs_available = available;
    }

    pub fn set_subscriptions_available(&self, available: bool) {
        self.state.lock().faults.subscriptions_available = available;
    }

    pub fn set_wallet_events_supported(&self, supported: bool) {
        self.state.lock().faults.wallet_events_supported = supported;
    }

    /// Make every read-only call fail
    pub fn set_reads_failing(&self, failing: bool) {
        self.state.lock().faults.reads_failing = failing;
    }

    /// Never confirm submitted transactions
    pub fn set_hold_confirmations(&self, hold: bool) {
        self.state.lock().faults.hold_confirmations = hold;
    }

    /// Fail the next `count` ranged log queries
    pub fn fail_ranged_logs(&self, count: u32) {
        self.state.lock().faults.ranged_log_failures = count;
    }

    /// Fail the next `count` chain id queries
    pub fn fail_chain_id(&self, count: u32) {
        self.state.lock().faults.chain_id_failures = count;
    }

    pub fn set_reject_account_requests(&self, reject: bool) {
        self.state.lock().faults.reject_account_requests = reject;
    }

    /// Answer `method` with JSON-RPC "method not found"
    pub fn set_method_unsupported(&self, method: &str) {
        self.state.lock().faults.unsupported_methods.insert(method.to_string());
    }

    /// Revert the next submitted transaction with `reason`
    pub fn revert_next_transaction(&self, reason: &str) {
        self.state.lock().faults.revert_next = Some(reason.to_string());
    }
}

fn mine_block(state: &mut ChainState) -> u64 {
    let number = state.blocks.len() as u64;
    state.blocks.push(GENESIS_TIMESTAMP + number * BLOCK_TIME_SECS);
    number
}

fn next_hash(state: &mut ChainState) -> H256 {
    state.nonce += 1;
    keccak256(&state.nonce.to_be_bytes())
}

fn store_log(state: &mut ChainState, mut event: LockEvent, block: u64, tx_hash: H256, log_index: u64) -> ChainLog {
    event.block_number = Some(block);
    event.tx_hash = Some(tx_hash);
    event.log_index = Some(log_index);
    let log = encode_lock_log(&event, InMemoryChain::SWAP_CONTRACT);
    state.logs.push(log.clone());
    log
}

fn revert(reason: &str) -> ProviderError {
    ProviderError::Rpc {
        code: 3,
        message: format!("execution reverted: {}", reason),
        data: Some(format!("0x{}", hex::encode(encode_revert_reason(reason)))),
    }
}

/// Pull `value` of `token` from `owner` into the swap contract
fn collect(state: &mut ChainState, token: Address, owner: Address, value: U256) -> Result<(), String> {
    let entry = state.tokens.entry(token).or_default();
    let allowance = entry
        .allowances
        .get(&(owner, InMemoryChain::SWAP_CONTRACT))
        .copied()
        .unwrap_or_default();
    if allowance < value {
        return Err("ERC20: insufficient allowance".to_string());
    }
    let balance = entry.balances.get(&owner).copied().unwrap_or_default();
    if balance < value {
        return Err("ERC20: transfer amount exceeds balance".to_string());
    }
    entry.allowances.insert((owner, InMemoryChain::SWAP_CONTRACT), allowance - value);
    entry.balances.insert(owner, balance - value);
    Ok(())
}

fn pay(state: &mut ChainState, token: Address, to: Address, value: U256) {
    *state.tokens.entry(token).or_default().balances.entry(to).or_default() += value;
}

/// Execute a swap contract call from `from`, returning the emitted event
fn execute_swap(state: &mut ChainState, from: Address, call: SwapCall) -> Result<Option<LockEvent>, String> {
    let event = match call {
        SwapCall::LockBuy { token, recipient, hashed_secret, timeout, value, sell_asset_id, sell_price } => {
            let lock_id = recompute_lock_id(&token, &from, &hashed_secret, timeout);
            if state.locks.contains_key(&lock_id) {
                return Err("Lock already exists".to_string());
            }
            collect(state, token, from, value)?;
            state.locks.insert(lock_id, LockRecord { token, recipient, value });

            let mut event = LockEvent::new(LockKind::OpenAsBuyer, token, from, recipient, lock_id, 0);
            event.hashed_secret = Some(hashed_secret);
            event.timeout_epoch_seconds = Some(timeout);
            event.value = Some(value);
            event.counterparty_asset_id = Some(sell_asset_id);
            event.price = Some(sell_price);
            event
        }
        SwapCall::LockSell { token, recipient, hashed_secret, timeout, value, buy_asset_id, buy_lock_id } => {
            let lock_id = recompute_lock_id(&token, &from, &hashed_secret, timeout);
            if state.locks.contains_key(&lock_id) {
                return Err("Lock already exists".to_string());
            }
            collect(state, token, from, value)?;
            state.locks.insert(lock_id, LockRecord { token, recipient, value });

            let mut event = LockEvent::new(LockKind::OpenAsSeller, token, from, recipient, lock_id, 0);
            event.hashed_secret = Some(hashed_secret);
            event.timeout_epoch_seconds = Some(timeout);
            event.value = Some(value);
            event.counterparty_asset_id = Some(buy_asset_id);
            event.counterparty_lock_id = Some(buy_lock_id);
            event
        }
        SwapCall::Unlock { token, creator, secret, timeout } => {
            let lock_id = recompute_lock_id(&token, &creator, &hash_secret(&secret), timeout);
            let lock = state.locks.get(&lock_id).cloned().ok_or("Lock not found")?;
            if lock.recipient != from {
                return Err("Only the recipient can unlock".to_string());
            }
            state.locks.remove(&lock_id);
            pay(state, lock.token, from, lock.value);

            let mut event = LockEvent::new(LockKind::Unlocked, token, creator, from, lock_id, 0);
            event.secret = Some(secret);
            event
        }
        SwapCall::Retrieve { token, recipient, hashed_secret, timeout } => {
            let lock_id = recompute_lock_id(&token, &from, &hashed_secret, timeout);
            let lock = state.locks.remove(&lock_id).ok_or("Lock not found")?;
            pay(state, lock.token, from, lock.value);
            LockEvent::new(LockKind::Retrieved, token, from, recipient, lock_id, 0)
        }
        SwapCall::Decline { token, creator, hashed_secret, timeout } => {
            let lock_id = recompute_lock_id(&token, &creator, &hashed_secret, timeout);
            let lock = state.locks.get(&lock_id).cloned().ok_or("Lock not found")?;
            if lock.recipient != from {
                return Err("Only the recipient can decline".to_string());
            }
            state.locks.remove(&lock_id);
            pay(state, lock.token, creator, lock.value);
            LockEvent::new(LockKind::Declined, token, creator, from, lock_id, 0)
        }
        SwapCall::GetLockValue { .. } => return Ok(None),
    };
    Ok(Some(event))
}

/// Dry-run of a call against a copy of the relevant state
fn simulate(state: &ChainState, from: Address, to: Address, data: &[u8]) -> Result<Vec<u8>, String> {
    if let Some(call) = Erc20Call::decode(data) {
        let token = state.tokens.get(&to);
        return match call {
            Erc20Call::BalanceOf { owner } => Ok(encode_output(Token::Uint(
                token.and_then(|t| t.balances.get(&owner).copied()).unwrap_or_default(),
            ))),
            Erc20Call::Allowance { owner, spender } => Ok(encode_output(Token::Uint(
                token
                    .and_then(|t| t.allowances.get(&(owner, spender)).copied())
                    .unwrap_or_default(),
            ))),
            Erc20Call::Decimals => token
                .and_then(|t| t.decimals)
                .map(|d| encode_output(Token::Uint(U256::from(d))))
                .ok_or_else(|| "decimals() not implemented".to_string()),
            Erc20Call::Symbol => token
                .and_then(|t| t.symbol.clone())
                .map(|s| encode_output(Token::String(s)))
                .ok_or_else(|| "symbol() not implemented".to_string()),
            Erc20Call::Approve { .. } => Ok(encode_output(Token::Bool(true))),
        };
    }

    match SwapCall::decode(data) {
        Some(SwapCall::GetLockValue { lock_id }) => Ok(encode_output(Token::Uint(
            state.locks.get(&lock_id).map(|l| l.value).unwrap_or_default(),
        ))),
        Some(call) if to == InMemoryChain::SWAP_CONTRACT => {
            let mut scratch = ChainState {
                accounts: Vec::new(),
                chain_id: state.chain_id,
                blocks: Vec::new(),
                logs: Vec::new(),
                tokens: state.tokens.clone(),
                locks: state.locks.clone(),
                sent: Vec::new(),
                receipts: HashMap::new(),
                requests: Vec::new(),
                nonce: 0,
                faults: Faults::default(),
            };
            execute_swap(&mut scratch, from, call).map(|_| Vec::new())
        }
        _ => Err("unknown function".to_string()),
    }
}

#[async_trait]
impl ChainProvider for InMemoryChain {
    async fn request(&self, method: &str, _params: Vec<Value>) -> ProviderResult<Value> {
        let mut state = self.state.lock();
        state.requests.push(method.to_string());
        if state.faults.unsupported_methods.contains(method) {
            return Err(ProviderError::Rpc {
                code: RPC_METHOD_NOT_FOUND,
                message: format!("the method {} does not exist/is not available", method),
                data: None,
            });
        }
        match method {
            "eth_requestAccounts" if state.faults.reject_account_requests => Err(ProviderError::Rpc {
                code: RPC_USER_REJECTED,
                message: "User rejected the request.".to_string(),
                data: None,
            }),
            "eth_requestAccounts" | "eth_accounts" => Ok(json!(state
                .accounts
                .iter()
                .map(|a| format!("{:?}", a))
                .collect::<Vec<_>>())),
            "eth_chainId" => Ok(json!(format!("{:#x}", state.chain_id))),
            "wallet_revokePermissions" | "wallet_disconnect" => Ok(Value::Null),
            other => Err(ProviderError::Rpc {
                code: RPC_METHOD_NOT_FOUND,
                message: format!("the method {} does not exist/is not available", other),
                data: None,
            }),
        }
    }

    async fn accounts(&self) -> ProviderResult<Vec<Address>> {
        Ok(self.state.lock().accounts.clone())
    }

    async fn chain_id(&self) -> ProviderResult<U256> {
        let mut state = self.state.lock();
        if state.faults.chain_id_failures > 0 {
            state.faults.chain_id_failures -= 1;
            return Err(ProviderError::Transport("eth_chainId timed out".to_string()));
        }
        Ok(state.chain_id)
    }

    async fn block_number(&self) -> ProviderResult<u64> {
        let state = self.state.lock();
        if !state.faults.block_number_available {
            return Err(ProviderError::Unsupported("eth_blockNumber".to_string()));
        }
        Ok(state.blocks.len() as u64 - 1)
    }

    async fn block_timestamp(&self, block_number: u64) -> ProviderResult<Option<u64>> {
        let state = self.state.lock();
        if !state.faults.block_timestamps_available {
            return Err(ProviderError::Unsupported("eth_getBlockByNumber".to_string()));
        }
        Ok(state.blocks.get(block_number as usize).copied())
    }

    async fn logs(&self, query: LogQuery) -> ProviderResult<Vec<ChainLog>> {
        let mut state = self.state.lock();
        if !state.faults.logs_available {
            return Err(ProviderError::Unsupported("eth_getLogs".to_string()));
        }
        if let BlockRange::Bounded { .. } = query.range {
            if state.faults.ranged_log_failures > 0 {
                state.faults.ranged_log_failures -= 1;
                return Err(ProviderError::Transport("query timeout exceeded".to_string()));
            }
        }
        Ok(state
            .logs
            .iter()
            .filter(|log| log.address == query.address && log.topics.first() == Some(&query.topic0))
            .filter(|log| match (query.range, log.block_number) {
                (BlockRange::Bounded { from, to }, Some(block)) => block >= from && block <= to,
                _ => true,
            })
            .cloned()
            .collect())
    }

    async fn subscribe_logs(&self, query: LogQuery) -> ProviderResult<LogStream> {
        if !self.state.lock().faults.subscriptions_available {
            return Err(ProviderError::Unsupported("eth_newFilter".to_string()));
        }
        let receiver = self.live_logs.subscribe();
        let stream = futures::stream::unfold(receiver, move |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(log) if log.address == query.address && log.topics.first() == Some(&query.topic0) => {
                        return Some((Ok(log), receiver));
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn send_transaction(&self, tx: TxRequest) -> ProviderResult<H256> {
        let mut state = self.state.lock();
        let hash = next_hash(&mut state);
        state.sent.push(SentTransaction {
            hash,
            from: tx.from,
            to: tx.to,
            data: tx.data.clone(),
            gas: tx.gas,
        });

        let block = mine_block(&mut state);
        let outcome = match state.faults.revert_next.take() {
            Some(reason) => Err(reason),
            None => match (Erc20Call::decode(&tx.data), SwapCall::decode(&tx.data)) {
                (Some(Erc20Call::Approve { spender, amount }), _) => {
                    state
                        .tokens
                        .entry(tx.to)
                        .or_default()
                        .allowances
                        .insert((tx.from, spender), amount);
                    Ok(None)
                }
                (_, Some(call)) if tx.to == InMemoryChain::SWAP_CONTRACT => execute_swap(&mut state, tx.from, call),
                _ => Err("unknown function".to_string()),
            },
        };

        let (success, logs) = match outcome {
            Ok(Some(event)) => {
                let log = store_log(&mut state, event, block, hash, 0);
                let _ = self.live_logs.send(log.clone());
                (true, vec![log])
            }
            Ok(None) => (true, Vec::new()),
            Err(_) => (false, Vec::new()),
        };
        state.receipts.insert(
            hash,
            TxReceipt {
                tx_hash: hash,
                block_number: Some(block),
                success,
                logs,
            },
        );
        Ok(hash)
    }

    async fn wait_for_confirmation(&self, tx_hash: H256, _confirmations: usize) -> ProviderResult<TxReceipt> {
        let (hold, receipt) = {
            let state = self.state.lock();
            (state.faults.hold_confirmations, state.receipts.get(&tx_hash).cloned())
        };
        if hold {
            futures::future::pending::<()>().await;
        }
        receipt.ok_or_else(|| ProviderError::Rpc {
            code: -32000,
            message: format!("unknown transaction {:?}", tx_hash),
            data: None,
        })
    }

    async fn call(&self, call: CallRequest, _block: Option<u64>) -> ProviderResult<Vec<u8>> {
        let state = self.state.lock();
        if state.faults.reads_failing {
            return Err(ProviderError::Transport("connection refused".to_string()));
        }
        simulate(&state, call.from.unwrap_or_default(), call.to, &call.data).map_err(|reason| revert(&reason))
    }

    fn wallet_events(&self) -> ProviderResult<broadcast::Receiver<WalletEvent>> {
        if !self.state.lock().faults.wallet_events_supported {
            return Err(ProviderError::Unsupported("wallet push notifications".to_string()));
        }
        Ok(self.wallet.subscribe())
    }
}
