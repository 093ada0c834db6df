//! Lock action gateway.
//!
//! Typed wrapper over the swap contract's mutating calls plus the token reads
//! they depend on. Preconditions (connection, input format, balance,
//! allowance) are settled before anything is submitted.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use swap_common::{
    derive_asset_id, format_units, parse_optional_h256, parse_raw_units, parse_units, recompute_lock_id, short_hash,
    Address, LockKind, ProviderError, SwapError, SwapResult, H256, U256,
};
use tracing::{debug, info, warn};

use crate::abi::{decode_lock_log, decode_revert_reason, decode_symbol, decode_uint, revert_bytes, Erc20Call, SwapCall};
use crate::config::GatewayConfig;
use crate::connection::ConnectionManager;
use crate::provider::{CallRequest, ChainProvider, TxReceipt, TxRequest};

/// Placeholder when a token's symbol cannot be read
pub const UNKNOWN_SYMBOL: &str = "???";

/// Assumed when a token's decimals cannot be read
pub const DEFAULT_DECIMALS: u8 = 18;

/// Parameters of `lockBuy`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAsBuyerRequest {
    pub token: Address,
    pub recipient: Address,
    pub hashed_secret: H256,
    pub timeout_epoch_seconds: u64,
    /// Display units unless `value_is_raw`
    pub value: String,
    /// Free text, or a 32-byte hex identifier
    pub sell_asset_id: String,
    /// Display units unless `price_is_raw`
    pub sell_price: String,
    pub value_is_raw: bool,
    pub price_is_raw: bool,
}

/// Parameters of `lockSell`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAsSellerRequest {
    pub token: Address,
    pub recipient: Address,
    pub hashed_secret: H256,
    pub timeout_epoch_seconds: u64,
    pub value: String,
    pub buy_asset_id: String,
    /// Counterparty lock being answered; empty for none
    pub buy_lock_id: String,
    pub value_is_raw: bool,
}

/// Outcome of a lock-opening action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockReceipt {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    /// `None` if the identifier could not be read back from the logs
    pub lock_id: Option<H256>,
    pub approval_tx: Option<H256>,
}

/// Outcome of unlock, retrieve or decline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionReceipt {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalance {
    pub raw: U256,
    pub decimals: u8,
    pub symbol: String,
    pub formatted: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub chain_id: U256,
    pub name: String,
}

pub struct LockGateway {
    provider: Arc<dyn ChainProvider>,
    connection: Arc<ConnectionManager>,
    config: GatewayConfig,
    contract: Address,
}

impl LockGateway {
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        connection: Arc<ConnectionManager>,
        config: GatewayConfig,
        contract: Address,
    ) -> Self {
        Self {
            provider,
            connection,
            config,
            contract,
        }
    }

    /// Open a lock as the buyer, approving the swap contract first if needed
    pub async fn open_as_buyer(&self, request: OpenAsBuyerRequest) -> SwapResult<LockReceipt> {
        let account = self.connected_account()?;
        let sell_asset_id = derive_asset_id(&request.sell_asset_id)?;
        let value = self.amount(&request.value, request.value_is_raw)?;
        let sell_price = self.amount(&request.sell_price, request.price_is_raw)?;

        self.ensure_balance(request.token, account, value).await?;
        let approval_tx = self.ensure_allowance(request.token, account, value).await?;

        let call = SwapCall::LockBuy {
            token: request.token,
            recipient: request.recipient,
            hashed_secret: request.hashed_secret,
            timeout: request.timeout_epoch_seconds,
            value,
            sell_asset_id,
            sell_price,
        };
        self.preflight(account, &call).await;

        let (receipt, _) = self
            .submit(self.contract, call.encode(), Some(U256::from(self.config.lock_gas_limit)))
            .await?;
        let lock_id = self.lock_id_from_logs(&receipt, LockKind::OpenAsBuyer);
        match lock_id {
            Some(id) => info!("Opened buyer lock {}", short_hash(&id)),
            None => warn!("Buyer lock opened in {:?} but no lock id found in its logs", receipt.tx_hash),
        }

        Ok(LockReceipt {
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
            lock_id,
            approval_tx,
        })
    }

    /// Open a lock as the seller; the lock id is recomputed locally
    pub async fn open_as_seller(&self, request: OpenAsSellerRequest) -> SwapResult<LockReceipt> {
        let account = self.connected_account()?;
        let buy_asset_id = derive_asset_id(&request.buy_asset_id)?;
        let buy_lock_id = parse_optional_h256(&request.buy_lock_id)?;
        let value = self.amount(&request.value, request.value_is_raw)?;

        self.ensure_balance(request.token, account, value).await?;
        let approval_tx = self.ensure_allowance(request.token, account, value).await?;

        let call = SwapCall::LockSell {
            token: request.token,
            recipient: request.recipient,
            hashed_secret: request.hashed_secret,
            timeout: request.timeout_epoch_seconds,
            value,
            buy_asset_id,
            buy_lock_id,
        };
        self.preflight(account, &call).await;

        // the contract keys the lock by the sending address
        let (receipt, sender) = self
            .submit(self.contract, call.encode(), Some(U256::from(self.config.lock_gas_limit)))
            .await?;
        let lock_id = recompute_lock_id(
            &request.token,
            &sender,
            &request.hashed_secret,
            request.timeout_epoch_seconds,
        );
        info!("Opened seller lock {}", short_hash(&lock_id));

        Ok(LockReceipt {
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
            lock_id: Some(lock_id),
            approval_tx,
        })
    }

    /// Claim a lock addressed to the connected account by revealing `secret`
    pub async fn unlock(&self, token: Address, creator: Address, secret: H256, timeout: u64) -> SwapResult<ActionReceipt> {
        self.connected_account()?;
        let call = SwapCall::Unlock {
            token,
            creator,
            secret,
            timeout,
        };
        self.act(call).await
    }

    /// Reclaim an expired lock created by the connected account
    pub async fn retrieve(
        &self,
        token: Address,
        recipient: Address,
        hashed_secret: H256,
        timeout: u64,
    ) -> SwapResult<ActionReceipt> {
        self.connected_account()?;
        let call = SwapCall::Retrieve {
            token,
            recipient,
            hashed_secret,
            timeout,
        };
        self.act(call).await
    }

    /// Refuse a lock addressed to the connected account
    pub async fn decline(
        &self,
        token: Address,
        creator: Address,
        hashed_secret: H256,
        timeout: u64,
    ) -> SwapResult<ActionReceipt> {
        self.connected_account()?;
        let call = SwapCall::Decline {
            token,
            creator,
            hashed_secret,
            timeout,
        };
        self.act(call).await
    }

    /// Balance of the connected account; unreadable parts degrade to defaults
    pub async fn token_balance(&self, token: Address) -> SwapResult<TokenBalance> {
        let account = self.connected_account()?;
        let raw = match self.read_uint(token, Erc20Call::BalanceOf { owner: account }).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Balance lookup for {:?} failed: {}", token, e);
                U256::zero()
            }
        };
        let decimals = self.decimals(token).await;
        let symbol = self.symbol(token).await;
        Ok(TokenBalance {
            raw,
            decimals,
            symbol,
            formatted: format_units(raw, decimals as u32),
        })
    }

    /// Allowance granted to the swap contract by the connected account
    pub async fn allowance(&self, token: Address) -> SwapResult<U256> {
        let owner = self.connected_account()?;
        Ok(self
            .read_uint(token, Erc20Call::Allowance { owner, spender: self.contract })
            .await
            .unwrap_or_else(|e| {
                warn!("Allowance lookup for {:?} failed: {}", token, e);
                U256::zero()
            }))
    }

    pub async fn decimals(&self, token: Address) -> u8 {
        match self.read_uint(token, Erc20Call::Decimals).await {
            Ok(decimals) if decimals <= U256::from(u8::MAX) => decimals.as_u32() as u8,
            Ok(decimals) => {
                warn!("Token {:?} reports {} decimals, assuming {}", token, decimals, DEFAULT_DECIMALS);
                DEFAULT_DECIMALS
            }
            Err(e) => {
                warn!("Could not fetch decimals of {:?}, assuming {}: {}", token, DEFAULT_DECIMALS, e);
                DEFAULT_DECIMALS
            }
        }
    }

    pub async fn symbol(&self, token: Address) -> String {
        let output = self.read(token, Erc20Call::Symbol.encode()).await;
        match output.and_then(|bytes| decode_symbol(&bytes).map_err(|e| SwapError::Provider(ProviderError::Decode(e.to_string())))) {
            Ok(symbol) => symbol,
            Err(e) => {
                warn!("Could not fetch symbol of {:?}: {}", token, e);
                UNKNOWN_SYMBOL.to_string()
            }
        }
    }

    /// Value held by a lock; zero if it does not exist or cannot be read
    pub async fn lock_value(&self, lock_id: H256) -> U256 {
        let output = self.read(self.contract, SwapCall::GetLockValue { lock_id }.encode()).await;
        match output.and_then(|bytes| decode_uint(&bytes).map_err(|e| SwapError::Provider(ProviderError::Decode(e.to_string())))) {
            Ok(value) => value,
            Err(e) => {
                warn!("Could not fetch value of lock {}: {}", short_hash(&lock_id), e);
                U256::zero()
            }
        }
    }

    pub async fn current_network(&self) -> Option<NetworkInfo> {
        match self.provider.chain_id().await {
            Ok(chain_id) => Some(NetworkInfo {
                chain_id,
                name: network_name(chain_id).to_string(),
            }),
            Err(e) => {
                warn!("Error getting network info: {}", e);
                None
            }
        }
    }

    fn connected_account(&self) -> SwapResult<Address> {
        if self.connection.signer().is_none() {
            return Err(SwapError::NotConnected);
        }
        self.connection.account().ok_or(SwapError::NotConnected)
    }

    fn amount(&self, amount: &str, is_raw: bool) -> SwapResult<U256> {
        if is_raw {
            parse_raw_units(amount)
        } else {
            parse_units(amount, self.config.display_decimals)
        }
    }

    async fn act(&self, call: SwapCall) -> SwapResult<ActionReceipt> {
        let (receipt, _) = self.submit(self.contract, call.encode(), None).await?;
        info!("{} confirmed in {:?}", call.signature(), receipt.tx_hash);
        Ok(ActionReceipt {
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
        })
    }

    /// Only a readable, too-small balance blocks the action
    async fn ensure_balance(&self, token: Address, owner: Address, required: U256) -> SwapResult<()> {
        match self.read_uint(token, Erc20Call::BalanceOf { owner }).await {
            Ok(available) if available < required => Err(SwapError::InsufficientBalance { required, available }),
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Could not check balance of {:?}, continuing: {}", owner, e);
                Ok(())
            }
        }
    }

    /// Approve the swap contract for `required` unless the allowance already covers it
    async fn ensure_allowance(&self, token: Address, owner: Address, required: U256) -> SwapResult<Option<H256>> {
        let current = self
            .read_uint(token, Erc20Call::Allowance { owner, spender: self.contract })
            .await
            .unwrap_or_else(|e| {
                debug!("Allowance lookup failed, treating as zero: {}", e);
                U256::zero()
            });
        if current >= required {
            debug!("Allowance {} already covers {}", current, required);
            return Ok(None);
        }

        info!("Approving {} of {:?} for the swap contract", required, token);
        let approve = Erc20Call::Approve {
            spender: self.contract,
            amount: required,
        };
        let (receipt, _) = self
            .submit(token, approve.encode(), None)
            .await
            .map_err(|e| SwapError::InsufficientAllowance {
                required,
                reason: e.to_string(),
            })?;
        Ok(Some(receipt.tx_hash))
    }

    /// Dry-run the call; a failure is only logged, the submission decides
    async fn preflight(&self, from: Address, call: &SwapCall) {
        let request = CallRequest {
            from: Some(from),
            to: self.contract,
            data: call.encode(),
        };
        if let Err(e) = self.provider.call(request, None).await {
            let reason = e
                .revert_data()
                .and_then(revert_bytes)
                .and_then(|data| decode_revert_reason(&data));
            warn!(
                "{} is expected to fail ({}); submitting anyway",
                call.signature(),
                reason.unwrap_or_else(|| e.to_string())
            );
        }
    }

    /// Send from the verified signer and wait for confirmation.
    ///
    /// Returns the receipt and the address the transaction was sent from.
    async fn submit(&self, to: Address, data: Vec<u8>, gas: Option<U256>) -> SwapResult<(TxReceipt, Address)> {
        let signer = self.connection.verified_signer().await?;
        let tx = TxRequest {
            from: signer.address,
            to,
            data: data.clone(),
            gas,
        };
        let tx_hash = self.provider.send_transaction(tx).await.map_err(submission_error)?;
        debug!("Transaction {:?} submitted", tx_hash);

        let receipt = self.confirm(tx_hash).await?;
        if !receipt.success {
            let (reason, data) = self.replay_revert(signer.address, to, data, receipt.block_number).await;
            return Err(SwapError::TransactionReverted {
                tx_hash: Some(tx_hash),
                reason,
                data,
            });
        }
        Ok((receipt, signer.address))
    }

    async fn confirm(&self, tx_hash: H256) -> SwapResult<TxReceipt> {
        let wait = self.provider.wait_for_confirmation(tx_hash, self.config.confirmations);
        let result = match self.config.confirmation_timeout() {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| SwapError::ConfirmationTimeout { tx_hash, waited: limit })?,
            None => wait.await,
        };
        Ok(result?)
    }

    /// Re-run a failed transaction as a call to recover its revert payload
    async fn replay_revert(
        &self,
        from: Address,
        to: Address,
        data: Vec<u8>,
        mined_at: Option<u64>,
    ) -> (Option<String>, Option<String>) {
        let request = CallRequest { from: Some(from), to, data };
        let block = mined_at.map(|n| n.saturating_sub(1));
        match self.provider.call(request, block).await {
            Err(e) => {
                let data = e.revert_data().map(str::to_string);
                let reason = data
                    .as_deref()
                    .and_then(revert_bytes)
                    .and_then(|bytes| decode_revert_reason(&bytes));
                (reason, data)
            }
            Ok(_) => (None, None),
        }
    }

    fn lock_id_from_logs(&self, receipt: &TxReceipt, kind: LockKind) -> Option<H256> {
        receipt
            .logs
            .iter()
            .filter(|log| log.address == self.contract)
            .filter_map(|log| match decode_lock_log(log, 0) {
                Ok(event) => Some(event),
                Err(e) => {
                    debug!("Skipping receipt log: {}", e);
                    None
                }
            })
            .find(|event| event.kind == kind)
            .map(|event| event.lock_id)
    }

    async fn read(&self, to: Address, data: Vec<u8>) -> SwapResult<Vec<u8>> {
        let request = CallRequest {
            from: self.connection.account(),
            to,
            data,
        };
        Ok(self.provider.call(request, None).await?)
    }

    async fn read_uint(&self, token: Address, call: Erc20Call) -> SwapResult<U256> {
        let output = self.read(token, call.encode()).await?;
        decode_uint(&output).map_err(|e| SwapError::Provider(ProviderError::Decode(e.to_string())))
    }
}

fn submission_error(err: ProviderError) -> SwapError {
    if let Some(data) = err.revert_data() {
        let reason = revert_bytes(data).and_then(|bytes| decode_revert_reason(&bytes));
        return SwapError::TransactionReverted {
            tx_hash: None,
            reason,
            data: Some(data.to_string()),
        };
    }
    if err.is_rejection() {
        return SwapError::TransactionSubmissionFailed(format!("rejected in wallet: {}", err));
    }
    SwapError::TransactionSubmissionFailed(err.to_string())
}

/// Well-known network names; `unknown` otherwise
pub fn network_name(chain_id: U256) -> &'static str {
    if chain_id > U256::from(u64::MAX) {
        return "unknown";
    }
    match chain_id.as_u64() {
        1 => "mainnet",
        5 => "goerli",
        10 => "optimism",
        56 => "bnb",
        137 => "matic",
        8453 => "base",
        42161 => "arbitrum",
        80002 => "matic-amoy",
        11155111 => "sepolia",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, ReconciliationConfig};
    use crate::provider::{ChainLog, LogQuery, LogStream, ProviderResult, WalletEvent};
    use crate::reconciliation::ReconciliationEngine;
    use crate::testing::InMemoryChain;

    const TOKEN: Address = Address::repeat_byte(0x70);
    const ALICE: Address = Address::repeat_byte(0xaa);
    const BOB: Address = Address::repeat_byte(0xbb);

    struct Fixture {
        chain: Arc<InMemoryChain>,
        connection: Arc<ConnectionManager>,
        gateway: LockGateway,
    }

    fn fixture() -> Fixture {
        let chain = Arc::new(InMemoryChain::with_accounts(vec![ALICE]));
        chain.set_token(TOKEN, 6, "USDC");
        let engine = Arc::new(ReconciliationEngine::new(
            chain.clone(),
            InMemoryChain::SWAP_CONTRACT,
            ReconciliationConfig::default(),
        ));
        let connection = Arc::new(ConnectionManager::new(
            chain.clone(),
            engine,
            ConnectionConfig { poll_interval_ms: 60_000 },
            None,
        ));
        let gateway = LockGateway::new(
            chain.clone(),
            connection.clone(),
            GatewayConfig::default(),
            InMemoryChain::SWAP_CONTRACT,
        );
        Fixture {
            chain,
            connection,
            gateway,
        }
    }

    fn seller_request(value: &str) -> OpenAsSellerRequest {
        OpenAsSellerRequest {
            token: TOKEN,
            recipient: BOB,
            hashed_secret: H256::repeat_byte(0x11),
            timeout_epoch_seconds: 7_200,
            value: value.to_string(),
            buy_asset_id: String::new(),
            buy_lock_id: String::new(),
            value_is_raw: false,
        }
    }

    #[tokio::test]
    async fn test_actions_require_connection() {
        let f = fixture();
        let result = f.gateway.open_as_seller(seller_request("1")).await;
        assert!(matches!(result, Err(SwapError::NotConnected)));
        assert!(matches!(
            f.gateway.unlock(TOKEN, BOB, H256::zero(), 1).await,
            Err(SwapError::NotConnected)
        ));
        assert!(f.chain.sent_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_amount_fails_before_submission() {
        let f = fixture();
        f.connection.connect().await.unwrap();
        let result = f.gateway.open_as_seller(seller_request("1.0000001")).await;
        assert!(matches!(result, Err(SwapError::InvalidInput(_))));
        assert!(f.chain.sent_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_balance_fails_before_submission() {
        let f = fixture();
        f.connection.connect().await.unwrap();
        f.chain.mint(TOKEN, ALICE, U256::from(1_000_000u64));

        match f.gateway.open_as_seller(seller_request("2")).await {
            Err(SwapError::InsufficientBalance { required, available }) => {
                assert_eq!(required, U256::from(2_000_000u64));
                assert_eq!(available, U256::from(1_000_000u64));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(f.chain.sent_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_open_as_seller_recomputes_lock_id() {
        let f = fixture();
        f.connection.connect().await.unwrap();
        f.chain.mint(TOKEN, ALICE, U256::from(5_000_000u64));

        let receipt = f.gateway.open_as_seller(seller_request("5")).await.unwrap();
        let expected = recompute_lock_id(&TOKEN, &ALICE, &H256::repeat_byte(0x11), 7_200);
        assert_eq!(receipt.lock_id, Some(expected));
        assert!(receipt.approval_tx.is_some());
        assert_eq!(f.gateway.lock_value(expected).await, U256::from(5_000_000u64));

        let sent = f.chain.sent_transactions();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].gas, Some(U256::from(1_000_000u64)));
    }

    /// Wallet that moves to another account while a confirmation is pending
    struct SwitchDuringConfirmation {
        chain: Arc<InMemoryChain>,
        switch_to: Address,
        manager: parking_lot::Mutex<Option<Arc<ConnectionManager>>>,
    }

    #[async_trait::async_trait]
    impl ChainProvider for SwitchDuringConfirmation {
        async fn request(&self, method: &str, params: Vec<serde_json::Value>) -> ProviderResult<serde_json::Value> {
            self.chain.request(method, params).await
        }

        async fn accounts(&self) -> ProviderResult<Vec<Address>> {
            self.chain.accounts().await
        }

        async fn chain_id(&self) -> ProviderResult<U256> {
            self.chain.chain_id().await
        }

        async fn block_number(&self) -> ProviderResult<u64> {
            self.chain.block_number().await
        }

        async fn block_timestamp(&self, block_number: u64) -> ProviderResult<Option<u64>> {
            self.chain.block_timestamp(block_number).await
        }

        async fn logs(&self, query: LogQuery) -> ProviderResult<Vec<ChainLog>> {
            self.chain.logs(query).await
        }

        async fn subscribe_logs(&self, query: LogQuery) -> ProviderResult<LogStream> {
            self.chain.subscribe_logs(query).await
        }

        async fn send_transaction(&self, tx: TxRequest) -> ProviderResult<H256> {
            self.chain.send_transaction(tx).await
        }

        async fn wait_for_confirmation(&self, tx_hash: H256, confirmations: usize) -> ProviderResult<TxReceipt> {
            let manager = self.manager.lock().take();
            if let Some(manager) = manager {
                self.chain.set_accounts(vec![self.switch_to]);
                manager.handle_accounts_changed(vec![self.switch_to]).await.unwrap();
            }
            self.chain.wait_for_confirmation(tx_hash, confirmations).await
        }

        async fn call(&self, call: CallRequest, block: Option<u64>) -> ProviderResult<Vec<u8>> {
            self.chain.call(call, block).await
        }

        fn wallet_events(&self) -> ProviderResult<tokio::sync::broadcast::Receiver<WalletEvent>> {
            self.chain.wallet_events()
        }
    }

    #[tokio::test]
    async fn test_seller_lock_id_uses_sending_account() {
        let chain = Arc::new(InMemoryChain::with_accounts(vec![ALICE]));
        chain.set_token(TOKEN, 6, "USDC");
        chain.mint(TOKEN, ALICE, U256::from(5_000_000u64));
        // pre-approved, so the lock is the only confirmation awaited
        let approve = Erc20Call::Approve { spender: InMemoryChain::SWAP_CONTRACT, amount: U256::from(5_000_000u64) };
        chain
            .send_transaction(TxRequest { from: ALICE, to: TOKEN, data: approve.encode(), gas: None })
            .await
            .unwrap();

        let provider = Arc::new(SwitchDuringConfirmation {
            chain: chain.clone(),
            switch_to: BOB,
            manager: parking_lot::Mutex::new(None),
        });
        let engine = Arc::new(ReconciliationEngine::new(
            provider.clone(),
            InMemoryChain::SWAP_CONTRACT,
            ReconciliationConfig::default(),
        ));
        let connection = Arc::new(ConnectionManager::new(
            provider.clone(),
            engine,
            ConnectionConfig { poll_interval_ms: 60_000 },
            None,
        ));
        let gateway = LockGateway::new(
            provider.clone(),
            connection.clone(),
            GatewayConfig::default(),
            InMemoryChain::SWAP_CONTRACT,
        );
        connection.connect().await.unwrap();
        *provider.manager.lock() = Some(connection.clone());

        let receipt = gateway.open_as_seller(seller_request("5")).await.unwrap();
        assert_eq!(connection.account(), Some(BOB));
        assert!(receipt.approval_tx.is_none());

        let sent = chain.sent_transactions();
        let sender = sent.last().unwrap().from;
        assert_eq!(sender, ALICE);
        let expected = recompute_lock_id(&TOKEN, &sender, &H256::repeat_byte(0x11), 7_200);
        assert_eq!(receipt.lock_id, Some(expected));
        assert_eq!(gateway.lock_value(expected).await, U256::from(5_000_000u64));
    }

    #[tokio::test]
    async fn test_existing_allowance_skips_approval() {
        let f = fixture();
        f.connection.connect().await.unwrap();
        f.chain.mint(TOKEN, ALICE, U256::from(5_000_000u64));
        f.gateway.open_as_seller(seller_request("1")).await.unwrap();
        let before = f.chain.sent_transactions().len();

        // allowance was consumed by the first lock
        let mut second = seller_request("1");
        second.hashed_secret = H256::repeat_byte(0x12);
        let receipt = f.gateway.open_as_seller(second).await.unwrap();
        assert!(receipt.approval_tx.is_some());
        assert_eq!(f.chain.sent_transactions().len(), before + 2);

        let approve = Erc20Call::Approve { spender: InMemoryChain::SWAP_CONTRACT, amount: U256::from(10_000_000u64) };
        f.chain
            .send_transaction(TxRequest { from: ALICE, to: TOKEN, data: approve.encode(), gas: None })
            .await
            .unwrap();
        let mut third = seller_request("1");
        third.hashed_secret = H256::repeat_byte(0x13);
        assert!(f.gateway.open_as_seller(third).await.unwrap().approval_tx.is_none());
    }

    #[tokio::test]
    async fn test_revert_reason_is_surfaced() {
        let f = fixture();
        f.connection.connect().await.unwrap();

        match f.gateway.unlock(TOKEN, BOB, H256::repeat_byte(1), 60).await {
            Err(SwapError::TransactionReverted { tx_hash, reason, data }) => {
                assert!(tx_hash.is_some());
                assert_eq!(reason.as_deref(), Some("Lock not found"));
                assert!(data.is_some());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_confirmation_timeout() {
        let f = fixture();
        f.connection.connect().await.unwrap();
        f.chain.set_hold_confirmations(true);
        let gateway = LockGateway::new(
            f.chain.clone(),
            f.connection.clone(),
            GatewayConfig {
                confirmation_timeout_secs: 1,
                ..GatewayConfig::default()
            },
            InMemoryChain::SWAP_CONTRACT,
        );

        let result = gateway.retrieve(TOKEN, BOB, H256::zero(), 1).await;
        assert!(matches!(result, Err(SwapError::ConfirmationTimeout { .. })));
    }

    #[tokio::test]
    async fn test_reads_degrade_to_defaults() {
        let f = fixture();
        f.connection.connect().await.unwrap();
        f.chain.mint(TOKEN, ALICE, U256::from(1_500_000u64));

        let balance = f.gateway.token_balance(TOKEN).await.unwrap();
        assert_eq!(balance.symbol, "USDC");
        assert_eq!(balance.formatted, "1.5");

        let unknown = Address::repeat_byte(0x71);
        assert_eq!(f.gateway.symbol(unknown).await, UNKNOWN_SYMBOL);
        assert_eq!(f.gateway.decimals(unknown).await, DEFAULT_DECIMALS);

        f.chain.set_reads_failing(true);
        let degraded = f.gateway.token_balance(TOKEN).await.unwrap();
        assert_eq!(degraded.raw, U256::zero());
        assert_eq!(degraded.symbol, UNKNOWN_SYMBOL);
        assert_eq!(degraded.decimals, DEFAULT_DECIMALS);
        assert_eq!(f.gateway.lock_value(H256::repeat_byte(1)).await, U256::zero());
        assert_eq!(f.gateway.allowance(TOKEN).await.unwrap(), U256::zero());
    }

    #[tokio::test]
    async fn test_current_network() {
        let f = fixture();
        let network = f.gateway.current_network().await.unwrap();
        assert_eq!(network.chain_id, U256::from(InMemoryChain::DEFAULT_CHAIN_ID));
        assert_eq!(network.name, "unknown");
        assert_eq!(network_name(U256::one()), "mainnet");
    }

    #[test]
    fn test_submission_error_classification() {
        let reverted = submission_error(ProviderError::Rpc {
            code: 3,
            message: "execution reverted".into(),
            data: Some(format!("0x{}", hex::encode(crate::abi::encode_revert_reason("Lock already exists")))),
        });
        assert!(matches!(
            reverted,
            SwapError::TransactionReverted { reason: Some(ref r), .. } if r == "Lock already exists"
        ));

        let rejected = submission_error(ProviderError::Rpc {
            code: swap_common::RPC_USER_REJECTED,
            message: "User denied transaction signature".into(),
            data: None,
        });
        assert!(matches!(rejected, SwapError::TransactionSubmissionFailed(_)));
    }
}
