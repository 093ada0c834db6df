//! Wallet connection tracking.
//!
//! Account and chain switches reach the manager two ways: wallet push
//! notifications and a low-frequency poll. Both feed the same handlers, which
//! run one at a time and treat an already-applied change as a no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;
use swap_common::{Address, ConnectionError, ConnectionState, ProviderError, SwapError, SwapResult, U256};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::provider::{accounts_from_value, ChainProvider, WalletEvent};
use crate::reconciliation::ReconciliationEngine;

/// Account access methods, most capable first
pub const ACCOUNT_REQUEST_METHODS: [&str; 2] = ["eth_requestAccounts", "eth_accounts"];

/// Explicit disconnect methods, most capable first
pub const DISCONNECT_METHODS: [&str; 2] = ["wallet_revokePermissions", "wallet_disconnect"];

/// Identity transactions are sent from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Signer {
    pub address: Address,
    pub chain_id: U256,
}

/// What a change handler did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// Not connected; nothing to track
    Ignored,
    /// Same account or chain as recorded
    Unchanged,
    /// Signer rebuilt in place
    Rebuilt,
    Disconnected,
    /// In-place rebuild failed; connection re-established from scratch
    Reinitialized,
}

pub struct ConnectionManager {
    provider: Arc<dyn ChainProvider>,
    engine: Arc<ReconciliationEngine>,
    config: ConnectionConfig,
    expected_chain_id: Option<u64>,

    state: RwLock<ConnectionState>,
    signer: RwLock<Option<Signer>>,

    /// Serializes connect, disconnect and change handling
    change_lock: Mutex<()>,

    /// Bumped on every connect and disconnect; watchers of older sessions exit
    session: AtomicU64,
    watchers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        engine: Arc<ReconciliationEngine>,
        config: ConnectionConfig,
        expected_chain_id: Option<u64>,
    ) -> Self {
        Self {
            provider,
            engine,
            config,
            expected_chain_id,
            state: RwLock::new(ConnectionState::default()),
            signer: RwLock::new(None),
            change_lock: Mutex::new(()),
            session: AtomicU64::new(0),
            watchers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    pub fn account(&self) -> Option<Address> {
        let state = self.state.read();
        state.account.filter(|_| state.is_connected)
    }

    pub fn signer(&self) -> Option<Signer> {
        self.signer.read().clone()
    }

    /// Request account access and start tracking the wallet.
    ///
    /// Provider failures are reported as [`ConnectionError`]; the state stays
    /// disconnected in that case.
    pub async fn connect(self: &Arc<Self>) -> Result<ConnectionState, ConnectionError> {
        let _guard = self.change_lock.lock().await;
        self.connect_locked().await
    }

    /// Forget the connection; safe to call repeatedly
    pub async fn disconnect(&self) {
        let _guard = self.change_lock.lock().await;
        for handle in self.watchers.lock().drain(..) {
            handle.abort();
        }
        self.disconnect_locked().await;
    }

    /// Apply an account list reported by the wallet
    pub async fn handle_accounts_changed(self: &Arc<Self>, accounts: Vec<Address>) -> Result<ChangeOutcome, ConnectionError> {
        let _guard = self.change_lock.lock().await;
        let current = self.state();
        if !current.is_connected {
            return Ok(ChangeOutcome::Ignored);
        }

        let Some(&primary) = accounts.first() else {
            info!("Wallet exposes no accounts anymore, disconnecting");
            self.disconnect_locked().await;
            return Ok(ChangeOutcome::Disconnected);
        };
        if current.account == Some(primary) {
            return Ok(ChangeOutcome::Unchanged);
        }

        info!("Account changed from {:?} to {:?}", current.account, primary);
        let signer = self.build_signer(primary).await?;
        // the old account's entries go before the new account is published
        self.engine.teardown().await;
        {
            let mut state = self.state.write();
            state.account = Some(primary);
            state.chain_id = Some(signer.chain_id);
        }
        *self.signer.write() = Some(signer);
        self.engine.bind(Some(primary)).await;
        Ok(ChangeOutcome::Rebuilt)
    }

    /// Apply a chain id reported by the wallet
    pub async fn handle_chain_changed(self: &Arc<Self>, chain_id: U256) -> Result<ChangeOutcome, ConnectionError> {
        let _guard = self.change_lock.lock().await;
        let current = self.state();
        let Some(account) = current.account.filter(|_| current.is_connected) else {
            return Ok(ChangeOutcome::Ignored);
        };
        if current.chain_id == Some(chain_id) {
            return Ok(ChangeOutcome::Unchanged);
        }

        info!("Chain changed from {:?} to {}", current.chain_id, chain_id);
        match self.build_signer(account).await {
            Ok(signer) => {
                self.engine.teardown().await;
                self.state.write().chain_id = Some(signer.chain_id);
                *self.signer.write() = Some(signer);
                self.engine.bind(Some(account)).await;
                Ok(ChangeOutcome::Rebuilt)
            }
            Err(e) => {
                warn!("Signer rebuild after chain change failed ({}), reinitializing connection", e);
                self.disconnect_locked().await;
                self.connect_locked().await?;
                Ok(ChangeOutcome::Reinitialized)
            }
        }
    }

    /// Signer for the recorded account, rebuilt first if it drifted
    pub async fn verified_signer(&self) -> SwapResult<Signer> {
        let account = self.account().ok_or(SwapError::NotConnected)?;
        let current = self.signer.read().clone();
        if let Some(signer) = current.filter(|s| s.address == account) {
            return Ok(signer);
        }

        warn!("Signer does not match account {:?}, rebuilding", account);
        let signer = self.build_signer(account).await?;
        *self.signer.write() = Some(signer.clone());
        Ok(signer)
    }

    async fn connect_locked(self: &Arc<Self>) -> Result<ConnectionState, ConnectionError> {
        let accounts = self.request_accounts().await?;
        let primary = *accounts.first().ok_or(ConnectionError::NoAccounts)?;
        let signer = self.build_signer(primary).await?;

        if let Some(expected) = self.expected_chain_id {
            if signer.chain_id != U256::from(expected) {
                return Err(ConnectionError::ProviderUnavailable(format!(
                    "wallet is on chain {}, expected {}",
                    signer.chain_id, expected
                )));
            }
        }

        let state = ConnectionState::connected(primary, signer.chain_id);
        self.engine.teardown().await;
        *self.state.write() = state.clone();
        *self.signer.write() = Some(signer);
        let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Connected as {:?} on chain {}", primary, state.chain_id.unwrap_or_default());

        let watchers = vec![self.spawn_wallet_listener(session), self.spawn_poller(session)];
        // older watchers exit on their own once they see the new session
        *self.watchers.lock() = watchers.into_iter().flatten().collect();

        self.engine.bind(Some(primary)).await;
        Ok(state)
    }

    async fn disconnect_locked(&self) {
        let was_connected = self.is_connected();
        self.session.fetch_add(1, Ordering::SeqCst);
        *self.state.write() = ConnectionState::default();
        *self.signer.write() = None;
        self.engine.teardown().await;

        if was_connected {
            self.revoke_permissions().await;
            info!("Disconnected");
        }
    }

    /// First supported account-access method wins
    async fn request_accounts(&self) -> Result<Vec<Address>, ConnectionError> {
        for method in ACCOUNT_REQUEST_METHODS {
            match self.provider.request(method, Vec::new()).await {
                Ok(value) => return Ok(accounts_from_value(&value)?),
                Err(e) if e.is_unsupported() => debug!("{} unsupported: {}", method, e),
                Err(e) if e.is_rejection() => return Err(ConnectionError::Rejected(e.to_string())),
                Err(e) => return Err(e.into()),
            }
        }
        Err(ConnectionError::ProviderUnavailable(format!(
            "none of {:?} is supported",
            ACCOUNT_REQUEST_METHODS
        )))
    }

    async fn revoke_permissions(&self) {
        for method in DISCONNECT_METHODS {
            match self.provider.request(method, Vec::new()).await {
                Ok(_) => return,
                Err(e) => debug!("{} failed: {}", method, e),
            }
        }
        debug!("Provider offers no explicit disconnect");
    }

    async fn build_signer(&self, address: Address) -> Result<Signer, ProviderError> {
        let chain_id = self.provider.chain_id().await?;
        Ok(Signer { address, chain_id })
    }

    fn current_session(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    fn spawn_wallet_listener(self: &Arc<Self>, session: u64) -> Option<JoinHandle<()>> {
        let mut events = match self.provider.wallet_events() {
            Ok(events) => events,
            Err(e) => {
                debug!("Wallet push notifications unavailable ({}), relying on polling", e);
                return None;
            }
        };
        let manager = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Skipped {} wallet notifications", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(manager) = live_manager(&manager, session) else {
                    break;
                };
                let result = match event {
                    WalletEvent::AccountsChanged(accounts) => manager.handle_accounts_changed(accounts).await,
                    WalletEvent::ChainChanged(chain_id) => manager.handle_chain_changed(chain_id).await,
                    WalletEvent::Disconnected => manager.handle_accounts_changed(Vec::new()).await,
                };
                if let Err(e) = result {
                    warn!("Failed to apply wallet notification: {}", e);
                }
            }
        }))
    }

    fn spawn_poller(self: &Arc<Self>, session: u64) -> Option<JoinHandle<()>> {
        let manager = Arc::downgrade(self);
        let interval = self.config.poll_interval();
        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = live_manager(&manager, session) else {
                    break;
                };
                manager.poll_once().await;
            }
        }))
    }

    /// Sample accounts and chain id once and apply any difference
    pub async fn poll_once(self: &Arc<Self>) {
        match self.provider.accounts().await {
            Ok(accounts) => {
                if let Err(e) = self.handle_accounts_changed(accounts).await {
                    warn!("Account poll could not apply change: {}", e);
                }
            }
            Err(e) => debug!("Account poll failed: {}", e),
        }
        if !self.is_connected() {
            return;
        }
        match self.provider.chain_id().await {
            Ok(chain_id) => {
                if let Err(e) = self.handle_chain_changed(chain_id).await {
                    warn!("Chain poll could not apply change: {}", e);
                }
            }
            Err(e) => debug!("Chain poll failed: {}", e),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for handle in self.watchers.lock().drain(..) {
            handle.abort();
        }
    }
}

fn live_manager(manager: &Weak<ConnectionManager>, session: u64) -> Option<Arc<ConnectionManager>> {
    manager.upgrade().filter(|m| m.current_session() == session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconciliationConfig;
    use crate::testing::InMemoryChain;

    const ALICE: Address = Address::repeat_byte(0xaa);
    const BOB: Address = Address::repeat_byte(0xbb);

    fn manager(chain: &Arc<InMemoryChain>) -> Arc<ConnectionManager> {
        let engine = Arc::new(ReconciliationEngine::new(
            chain.clone(),
            InMemoryChain::SWAP_CONTRACT,
            ReconciliationConfig::default(),
        ));
        // long poll interval keeps the background poll out of the way
        let config = ConnectionConfig { poll_interval_ms: 60_000 };
        Arc::new(ConnectionManager::new(chain.clone(), engine, config, None))
    }

    #[tokio::test]
    async fn test_connect_sets_state() {
        let chain = Arc::new(InMemoryChain::with_accounts(vec![ALICE]));
        let manager = manager(&chain);

        let state = manager.connect().await.unwrap();
        assert!(state.is_connected);
        assert_eq!(state.account, Some(ALICE));
        assert_eq!(state.chain_id, Some(U256::from(InMemoryChain::DEFAULT_CHAIN_ID)));
        assert_eq!(manager.signer().unwrap().address, ALICE);
    }

    #[tokio::test]
    async fn test_connect_falls_through_account_methods() {
        let chain = Arc::new(InMemoryChain::with_accounts(vec![ALICE]));
        chain.set_method_unsupported("eth_requestAccounts");
        let manager = manager(&chain);

        assert!(manager.connect().await.is_ok());
        assert_eq!(chain.requests()[..2], ["eth_requestAccounts".to_string(), "eth_accounts".to_string()]);
    }

    #[tokio::test]
    async fn test_connect_without_provider_support() {
        let chain = Arc::new(InMemoryChain::with_accounts(vec![ALICE]));
        chain.set_method_unsupported("eth_requestAccounts");
        chain.set_method_unsupported("eth_accounts");
        let manager = manager(&chain);

        assert!(matches!(manager.connect().await, Err(ConnectionError::ProviderUnavailable(_))));
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_connect_rejected_and_empty() {
        let chain = Arc::new(InMemoryChain::with_accounts(vec![ALICE]));
        chain.set_reject_account_requests(true);
        assert!(matches!(manager(&chain).connect().await, Err(ConnectionError::Rejected(_))));

        let empty = Arc::new(InMemoryChain::new());
        assert!(matches!(manager(&empty).connect().await, Err(ConnectionError::NoAccounts)));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let chain = Arc::new(InMemoryChain::with_accounts(vec![ALICE]));
        let manager = manager(&chain);
        manager.connect().await.unwrap();

        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::default());
        assert!(manager.signer().is_none());
        let revokes = chain.requests().iter().filter(|m| *m == "wallet_revokePermissions").count();
        assert_eq!(revokes, 1);
    }

    #[tokio::test]
    async fn test_account_change_paths_are_idempotent() {
        let chain = Arc::new(InMemoryChain::with_accounts(vec![ALICE]));
        let manager = manager(&chain);
        manager.connect().await.unwrap();

        assert_eq!(manager.handle_accounts_changed(vec![ALICE]).await.unwrap(), ChangeOutcome::Unchanged);
        assert_eq!(manager.handle_accounts_changed(vec![BOB]).await.unwrap(), ChangeOutcome::Rebuilt);
        // the poll observing the same switch afterwards changes nothing
        assert_eq!(manager.handle_accounts_changed(vec![BOB]).await.unwrap(), ChangeOutcome::Unchanged);
        assert_eq!(manager.account(), Some(BOB));

        assert_eq!(manager.handle_accounts_changed(vec![]).await.unwrap(), ChangeOutcome::Disconnected);
        assert_eq!(manager.handle_accounts_changed(vec![ALICE]).await.unwrap(), ChangeOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_chain_change_rebuilds_signer() {
        let chain = Arc::new(InMemoryChain::with_accounts(vec![ALICE]));
        let manager = manager(&chain);
        manager.connect().await.unwrap();

        chain.set_chain_id(5);
        assert_eq!(manager.handle_chain_changed(U256::from(5u64)).await.unwrap(), ChangeOutcome::Rebuilt);
        assert_eq!(manager.state().chain_id, Some(U256::from(5u64)));
        assert_eq!(manager.signer().unwrap().chain_id, U256::from(5u64));
        assert_eq!(manager.handle_chain_changed(U256::from(5u64)).await.unwrap(), ChangeOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_chain_change_reinitializes_when_rebuild_fails() {
        let chain = Arc::new(InMemoryChain::with_accounts(vec![ALICE]));
        let manager = manager(&chain);
        manager.connect().await.unwrap();
        let epoch_before = manager.engine.epoch().await;

        chain.set_chain_id(5);
        chain.fail_chain_id(1);
        assert_eq!(
            manager.handle_chain_changed(U256::from(5u64)).await.unwrap(),
            ChangeOutcome::Reinitialized
        );

        let state = manager.state();
        assert!(state.is_connected);
        assert_eq!(state.account, Some(ALICE));
        assert_eq!(state.chain_id, Some(U256::from(5u64)));
        assert_eq!(manager.signer().unwrap().chain_id, U256::from(5u64));
        assert_eq!(manager.engine.active_account().await, Some(ALICE));
        assert!(manager.engine.epoch().await > epoch_before);
        // the fallback went through a full disconnect
        assert!(chain.requests().iter().any(|m| m == "wallet_revokePermissions"));
    }

    #[tokio::test]
    async fn test_chain_change_fails_when_reconnect_fails() {
        let chain = Arc::new(InMemoryChain::with_accounts(vec![ALICE]));
        let manager = manager(&chain);
        manager.connect().await.unwrap();

        chain.set_chain_id(5);
        chain.fail_chain_id(2);
        assert!(manager.handle_chain_changed(U256::from(5u64)).await.is_err());
        assert_eq!(manager.state(), ConnectionState::default());
        assert!(manager.signer().is_none());
    }

    #[tokio::test]
    async fn test_poll_detects_silent_switch() {
        let chain = Arc::new(InMemoryChain::with_accounts(vec![ALICE]));
        let manager = manager(&chain);
        manager.connect().await.unwrap();

        chain.set_accounts(vec![BOB]);
        manager.poll_once().await;
        assert_eq!(manager.account(), Some(BOB));
        assert_eq!(manager.engine.active_account().await, Some(BOB));
    }

    #[tokio::test]
    async fn test_verified_signer_rebuilds_on_drift() {
        let chain = Arc::new(InMemoryChain::with_accounts(vec![ALICE]));
        let manager = manager(&chain);
        assert!(matches!(manager.verified_signer().await, Err(SwapError::NotConnected)));

        manager.connect().await.unwrap();
        *manager.signer.write() = Some(Signer { address: BOB, chain_id: U256::one() });
        let signer = manager.verified_signer().await.unwrap();
        assert_eq!(signer.address, ALICE);
        assert_eq!(manager.signer().unwrap().address, ALICE);
    }
}
