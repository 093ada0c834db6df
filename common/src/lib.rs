pub mod types;
pub mod crypto;
pub mod error;
pub mod timing;
pub mod units;

pub use types::*;
pub use crypto::*;
pub use error::*;
pub use timing::*;
pub use units::*;

pub use ethereum_types::{Address, H256, U256};
