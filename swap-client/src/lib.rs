//! Swap Client Library
//!
//! Client-side state for hashed time-locked token swaps: tracks the wallet
//! connection, submits lock actions, and reconciles the swap contract's
//! events into one de-duplicated, time-ordered ledger.

pub mod abi;
pub mod config;
pub mod connection;
pub mod context;
pub mod gateway;
pub mod ledger;
pub mod provider;
pub mod reconciliation;
pub mod testing;
pub mod web3_provider;

pub use config::{ListenMode, SwapClientConfig};
pub use connection::{ChangeOutcome, ConnectionManager, Signer};
pub use context::{ContextSnapshot, SwapContext};
pub use gateway::{ActionReceipt, LockGateway, LockReceipt, OpenAsBuyerRequest, OpenAsSellerRequest, TokenBalance};
pub use provider::{ChainProvider, WalletEvent};
pub use reconciliation::{BackfillSummary, BindingState, ReconciliationEngine};
pub use web3_provider::Web3Provider;
