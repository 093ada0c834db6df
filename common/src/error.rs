use std::time::Duration;

use ethereum_types::{H256, U256};
use thiserror::Error;

/// Main error type for the swap client
#[derive(Error, Debug)]
pub enum SwapError {
    #[error("Wallet not connected")]
    NotConnected,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient token balance: required {required}, available {available}")]
    InsufficientBalance { required: U256, available: U256 },

    #[error("Failed to approve token transfer of {required}: {reason}")]
    InsufficientAllowance { required: U256, reason: String },

    #[error("No wallet provider available: {0}")]
    ProviderUnavailable(String),

    #[error("Transaction reverted by the contract{}{}", fmt_reason(.reason), fmt_data(.data))]
    TransactionReverted {
        tx_hash: Option<H256>,
        reason: Option<String>,
        data: Option<String>,
    },

    #[error("Transaction submission failed: {0}")]
    TransactionSubmissionFailed(String),

    #[error("Transaction {tx_hash:?} not confirmed after {waited:?}")]
    ConfirmationTimeout { tx_hash: H256, waited: Duration },

    #[error("Event query degraded: {0}")]
    EventQueryDegraded(String),

    #[error("Backfill result for binding {epoch} (ticket {ticket}) is stale")]
    ReconciliationStale { epoch: u64, ticket: u64 },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn fmt_reason(reason: &Option<String>) -> String {
    reason
        .as_ref()
        .map(|r| format!(": {}", r))
        .unwrap_or_default()
}

fn fmt_data(data: &Option<String>) -> String {
    data.as_ref()
        .map(|d| format!(" (data: {})", d))
        .unwrap_or_default()
}

/// Errors raised while establishing or tracking the wallet connection
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("No wallet provider found: {0}")]
    ProviderUnavailable(String),

    #[error("Wallet returned no accounts")]
    NoAccounts,

    #[error("Account access rejected: {0}")]
    Rejected(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// Errors reported by the chain provider boundary
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Capability not supported by provider: {0}")]
    Unsupported(String),

    #[error("RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<String>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Provider timeout")]
    Timeout,
}

/// JSON-RPC "method not found"
pub const RPC_METHOD_NOT_FOUND: i64 = -32601;
/// EIP-1474 "method not supported"
pub const RPC_METHOD_NOT_SUPPORTED: i64 = -32004;
/// EIP-1193 "user rejected request"
pub const RPC_USER_REJECTED: i64 = 4001;

impl ProviderError {
    /// Whether the provider simply lacks this capability, so the next method may be tried
    pub fn is_unsupported(&self) -> bool {
        match self {
            ProviderError::Unsupported(_) => true,
            ProviderError::Rpc { code, .. } => {
                *code == RPC_METHOD_NOT_FOUND || *code == RPC_METHOD_NOT_SUPPORTED
            }
            _ => false,
        }
    }

    /// Whether the wallet user declined the request
    pub fn is_rejection(&self) -> bool {
        matches!(self, ProviderError::Rpc { code, .. } if *code == RPC_USER_REJECTED)
    }

    /// Raw revert payload attached to an RPC error, if any
    pub fn revert_data(&self) -> Option<&str> {
        match self {
            ProviderError::Rpc { data: Some(data), .. } => Some(data.as_str()),
            _ => None,
        }
    }
}

/// Result type alias for swap client operations
pub type SwapResult<T> = Result<T, SwapError>;

impl SwapError {
    /// Whether the error should be shown to the user as a failure
    pub fn is_user_facing(&self) -> bool {
        !matches!(
            self,
            SwapError::EventQueryDegraded(_) | SwapError::ReconciliationStale { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SwapError::TransactionReverted { .. } => ErrorSeverity::High,
            SwapError::TransactionSubmissionFailed(_) => ErrorSeverity::High,
            SwapError::ConfirmationTimeout { .. } => ErrorSeverity::High,
            SwapError::ProviderUnavailable(_) => ErrorSeverity::High,
            SwapError::Connection(_) => ErrorSeverity::Medium,
            SwapError::Provider(_) => ErrorSeverity::Medium,
            SwapError::Config(_) => ErrorSeverity::High,
            SwapError::EventQueryDegraded(_) | SwapError::ReconciliationStale { .. } => {
                ErrorSeverity::Low
            }
            _ => ErrorSeverity::Medium,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSeverity {
    High,
    Medium,
    Low,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_classification() {
        assert!(ProviderError::Unsupported("eth_requestAccounts".into()).is_unsupported());
        let not_found = ProviderError::Rpc {
            code: RPC_METHOD_NOT_FOUND,
            message: "the method eth_requestAccounts does not exist".into(),
            data: None,
        };
        assert!(not_found.is_unsupported());
        let rejected = ProviderError::Rpc {
            code: RPC_USER_REJECTED,
            message: "User rejected the request".into(),
            data: None,
        };
        assert!(!rejected.is_unsupported());
        assert!(rejected.is_rejection());
        assert!(!ProviderError::Timeout.is_unsupported());
    }

    #[test]
    fn test_reverted_message() {
        let err = SwapError::TransactionReverted {
            tx_hash: None,
            reason: Some("Lock already exists".into()),
            data: None,
        };
        assert_eq!(
            err.to_string(),
            "Transaction reverted by the contract: Lock already exists"
        );
    }

    #[test]
    fn test_degraded_errors_are_not_user_facing() {
        assert!(!SwapError::EventQueryDegraded("no block number".into()).is_user_facing());
        assert!(!SwapError::ReconciliationStale { epoch: 1, ticket: 2 }.is_user_facing());
        assert!(SwapError::NotConnected.is_user_facing());
        assert_eq!(SwapError::ProviderUnavailable("no endpoint".into()).severity(), ErrorSeverity::High);
        assert_eq!(
            SwapError::ReconciliationStale { epoch: 1, ticket: 2 }.severity(),
            ErrorSeverity::Low
        );
    }
}
