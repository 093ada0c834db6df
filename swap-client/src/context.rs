use std::sync::Arc;

use serde::Serialize;
use swap_common::{Address, ConnectionError, ConnectionState, LockEvent, SwapError, SwapResult, H256};
use tokio::sync::broadcast;

use crate::config::SwapClientConfig;
use crate::connection::ConnectionManager;
use crate::gateway::{ActionReceipt, LockGateway, LockReceipt, OpenAsBuyerRequest, OpenAsSellerRequest};
use crate::provider::ChainProvider;
use crate::reconciliation::{BackfillSummary, BindingState, ReconciliationEngine};
use crate::web3_provider::Web3Provider;

/// Serializable view handed to presentation code
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub connection_state: ConnectionState,
    pub binding_state: BindingState,
    pub ledger: Vec<LockEvent>,
}

/// One session: connection manager, reconciliation engine and lock gateway
/// sharing a single injected provider
pub struct SwapContext {
    config: SwapClientConfig,
    engine: Arc<ReconciliationEngine>,
    connection: Arc<ConnectionManager>,
    gateway: LockGateway,
}

impl SwapContext {
    pub fn new(provider: Arc<dyn ChainProvider>, config: SwapClientConfig) -> SwapResult<Self> {
        config.validate()?;
        let contract = config.swap_contract()?;

        let engine = Arc::new(ReconciliationEngine::new(
            provider.clone(),
            contract,
            config.reconciliation.clone(),
        ));
        let connection = Arc::new(ConnectionManager::new(
            provider.clone(),
            engine.clone(),
            config.connection.clone(),
            config.network.expected_chain_id,
        ));
        let gateway = LockGateway::new(provider, connection.clone(), config.gateway.clone(), contract);

        Ok(Self {
            config,
            engine,
            connection,
            gateway,
        })
    }

    /// Context over the configured JSON-RPC endpoint
    pub fn over_http(config: SwapClientConfig) -> SwapResult<Self> {
        let provider = Web3Provider::new(
            &config.network.rpc_url,
            config.reconciliation.live_poll_interval(),
            config.gateway.confirmation_poll_interval(),
        )
        .map_err(|e| SwapError::ProviderUnavailable(format!("{}: {}", config.network.rpc_url, e)))?;
        Self::new(Arc::new(provider), config)
    }

    pub fn config(&self) -> &SwapClientConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    pub fn gateway(&self) -> &LockGateway {
        &self.gateway
    }

    pub async fn connect(&self) -> Result<ConnectionState, ConnectionError> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub async fn ledger(&self) -> Vec<LockEvent> {
        self.engine.ledger().await
    }

    pub async fn binding_state(&self) -> BindingState {
        self.engine.state().await
    }

    pub async fn refresh(&self) -> BackfillSummary {
        self.engine.refresh().await
    }

    /// Newly merged events relevant to the active account
    pub fn notifications(&self) -> broadcast::Receiver<LockEvent> {
        self.engine.subscribe()
    }

    pub async fn open_as_buyer(&self, request: OpenAsBuyerRequest) -> SwapResult<LockReceipt> {
        self.gateway.open_as_buyer(request).await
    }

    pub async fn open_as_seller(&self, request: OpenAsSellerRequest) -> SwapResult<LockReceipt> {
        self.gateway.open_as_seller(request).await
    }

    pub async fn unlock(&self, token: Address, creator: Address, secret: H256, timeout: u64) -> SwapResult<ActionReceipt> {
        self.gateway.unlock(token, creator, secret, timeout).await
    }

    pub async fn retrieve(
        &self,
        token: Address,
        recipient: Address,
        hashed_secret: H256,
        timeout: u64,
    ) -> SwapResult<ActionReceipt> {
        self.gateway.retrieve(token, recipient, hashed_secret, timeout).await
    }

    pub async fn decline(
        &self,
        token: Address,
        creator: Address,
        hashed_secret: H256,
        timeout: u64,
    ) -> SwapResult<ActionReceipt> {
        self.gateway.decline(token, creator, hashed_secret, timeout).await
    }

    pub async fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            connection_state: self.connection_state(),
            binding_state: self.binding_state().await,
            ledger: self.ledger().await,
        }
    }
}
