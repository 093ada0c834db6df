use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use swap_common::{parse_address, Address, SwapError, SwapResult, MAX_DECIMALS};

/// Swap client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapClientConfig {
    pub network: NetworkConfig,
    pub connection: ConnectionConfig,
    pub reconciliation: ReconciliationConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// JSON-RPC endpoint of the wallet-backed node
    pub rpc_url: String,

    /// Address of the swap contract
    pub swap_contract: String,

    /// Refuse to connect when the provider reports a different chain
    pub expected_chain_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Account/chain sampling interval backing up push notifications
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    /// Keep only events involving the active account; all events when none is active
    Auto,
    /// Keep every event regardless of the active account
    Global,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Historical window walked by each backfill
    pub lookback_blocks: u64,

    /// Poll interval of live log filters
    pub live_poll_interval_ms: u64,

    pub listen_mode: ListenMode,

    /// Extra attempts for a failed ranged log query before giving up on that kind
    pub ranged_query_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Explicit gas ceiling for lock-opening transactions
    pub lock_gas_limit: u64,

    /// Decimal places of user-entered amounts
    pub display_decimals: u32,

    /// Confirmations awaited per transaction
    pub confirmations: usize,

    /// Upper bound on a confirmation wait; 0 disables the bound
    pub confirmation_timeout_secs: u64,

    pub confirmation_poll_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            swap_contract: String::new(),
            expected_chain_id: None,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 1_000 }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            lookback_blocks: 5_000,
            live_poll_interval_ms: 2_000,
            listen_mode: ListenMode::Auto,
            ranged_query_retries: 1,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            lock_gas_limit: 1_000_000,
            display_decimals: 6,
            confirmations: 1,
            confirmation_timeout_secs: 300,
            confirmation_poll_interval_ms: 1_000,
        }
    }
}

impl ConnectionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ReconciliationConfig {
    pub fn live_poll_interval(&self) -> Duration {
        Duration::from_millis(self.live_poll_interval_ms)
    }
}

impl GatewayConfig {
    pub fn confirmation_timeout(&self) -> Option<Duration> {
        (self.confirmation_timeout_secs > 0).then(|| Duration::from_secs(self.confirmation_timeout_secs))
    }

    pub fn confirmation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.confirmation_poll_interval_ms)
    }
}

impl SwapClientConfig {
    /// Load configuration from an optional TOML file, then `SWAP__SECTION__KEY`
    /// environment variables
    pub fn load(config_path: &str) -> SwapResult<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::File::new(config_path, config::FileFormat::Toml)
                    .required(Path::new(config_path).exists()),
            )
            .add_source(
                config::Environment::with_prefix("SWAP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| SwapError::Config(format!("Failed to read configuration: {}", e)))?;

        settings
            .try_deserialize()
            .map_err(|e| SwapError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> SwapResult<()> {
        if self.network.rpc_url.trim().is_empty() {
            return Err(SwapError::Config("RPC url cannot be empty".to_string()));
        }

        self.swap_contract()?;

        if self.connection.poll_interval_ms == 0 {
            return Err(SwapError::Config("Connection poll interval must be greater than 0".to_string()));
        }

        if self.reconciliation.live_poll_interval_ms == 0 {
            return Err(SwapError::Config("Live poll interval must be greater than 0".to_string()));
        }

        if self.gateway.confirmation_poll_interval_ms == 0 {
            return Err(SwapError::Config(
                "Confirmation poll interval must be greater than 0".to_string(),
            ));
        }

        if self.gateway.display_decimals > MAX_DECIMALS {
            return Err(SwapError::Config(format!(
                "display_decimals must be at most {}",
                MAX_DECIMALS
            )));
        }

        Ok(())
    }

    /// Parsed swap contract address
    pub fn swap_contract(&self) -> SwapResult<Address> {
        parse_address(&self.network.swap_contract).map_err(|_| {
            SwapError::Config(format!(
                "Invalid swap contract address: {:?}",
                self.network.swap_contract
            ))
        })
    }
}
