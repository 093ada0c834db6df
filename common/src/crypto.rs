use ethereum_types::{Address, H256, U256};
use sha3::{Digest, Keccak256};

use crate::error::{SwapError, SwapResult};
use crate::types::parse_h256;

/// Keccak-256 digest
pub fn keccak256(data: &[u8]) -> H256 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    H256::from_slice(&hasher.finalize())
}

/// Four-byte function selector for a canonical signature such as `approve(address,uint256)`
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash.as_bytes()[..4]);
    out
}

/// Topic-0 hash for a canonical event signature
pub fn event_topic(signature: &str) -> H256 {
    keccak256(signature.as_bytes())
}

/// Recompute a lock identifier the way the swap contract does:
///
/// `keccak256(abi.encodePacked(address token, address creator, bytes32 hashedSecret, uint256 timeout))`
///
/// Packed encoding: 20-byte token, 20-byte creator, 32-byte hashed secret,
/// 32-byte big-endian timeout. No padding between fields.
pub fn recompute_lock_id(token: &Address, creator: &Address, hashed_secret: &H256, timeout: u64) -> H256 {
    let mut packed = Vec::with_capacity(20 + 20 + 32 + 32);
    packed.extend_from_slice(token.as_bytes());
    packed.extend_from_slice(creator.as_bytes());
    packed.extend_from_slice(hashed_secret.as_bytes());
    let mut timeout_word = [0u8; 32];
    U256::from(timeout).to_big_endian(&mut timeout_word);
    packed.extend_from_slice(&timeout_word);
    keccak256(&packed)
}

/// Hash of a 32-byte swap secret, as stored in a lock
pub fn hash_secret(secret: &H256) -> H256 {
    keccak256(secret.as_bytes())
}

/// Derive a 32-byte asset identifier from user input.
///
/// Empty input maps to the zero hash, a `0x`-prefixed 32-byte hex value is
/// passed through, anything else is hashed as UTF-8 text.
pub fn derive_asset_id(input: &str) -> SwapResult<H256> {
    if input.trim().is_empty() {
        return Ok(H256::zero());
    }
    if input.starts_with("0x") && input.len() == 66 {
        return parse_h256(input);
    }
    Ok(keccak256(input.as_bytes()))
}

/// Parse an optional 32-byte reference (counterparty asset or lock id).
/// Empty input maps to the zero hash.
pub fn parse_optional_h256(input: &str) -> SwapResult<H256> {
    if input.trim().is_empty() {
        return Ok(H256::zero());
    }
    parse_h256(input)
        .map_err(|_| SwapError::InvalidInput(format!("Expected a 0x-prefixed 32-byte value: {}", input)))
}
