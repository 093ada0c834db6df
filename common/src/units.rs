use ethereum_types::U256;

use crate::error::{SwapError, SwapResult};

/// Largest exponent for which `10^decimals` fits in a U256
pub const MAX_DECIMALS: u32 = 77;

/// Convert a display amount such as `"12.5"` into base units at `decimals`.
///
/// Signs, exponents and fractional digits beyond `decimals` are rejected
/// rather than rounded.
pub fn parse_units(amount: &str, decimals: u32) -> SwapResult<U256> {
    let invalid = || SwapError::InvalidInput(format!("Invalid amount: {:?}", amount));
    if decimals > MAX_DECIMALS {
        return Err(invalid());
    }

    let trimmed = amount.trim();
    let (whole, fraction) = match trimmed.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (trimmed, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let fraction = fraction.trim_end_matches('0');
    if fraction.len() as u32 > decimals {
        return Err(SwapError::InvalidInput(format!(
            "Amount {} has more than {} decimal places",
            trimmed, decimals
        )));
    }

    let scale = U256::exp10(decimals as usize);
    let whole_units = if whole.is_empty() {
        U256::zero()
    } else {
        U256::from_dec_str(whole).map_err(|_| invalid())?
    };
    let fraction_units = if fraction.is_empty() {
        U256::zero()
    } else {
        let padding = U256::exp10(decimals as usize - fraction.len());
        U256::from_dec_str(fraction)
            .map_err(|_| invalid())?
            .checked_mul(padding)
            .ok_or_else(invalid)?
    };

    whole_units
        .checked_mul(scale)
        .and_then(|units| units.checked_add(fraction_units))
        .ok_or_else(invalid)
}

/// Parse an integer amount already expressed in base units
pub fn parse_raw_units(amount: &str) -> SwapResult<U256> {
    let trimmed = amount.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Err(SwapError::InvalidInput(format!("Invalid raw amount: {:?}", amount)));
    }
    U256::from_dec_str(trimmed)
        .map_err(|_| SwapError::InvalidInput(format!("Raw amount out of range: {}", trimmed)))
}

/// Render base units as a display amount, without trailing zeros
pub fn format_units(value: U256, decimals: u32) -> String {
    if decimals == 0 || decimals > MAX_DECIMALS {
        return value.to_string();
    }
    let scale = U256::exp10(decimals as usize);
    let whole = value / scale;
    let fraction = value % scale;
    if fraction.is_zero() {
        return whole.to_string();
    }
    let digits = fraction.to_string();
    let padded = format!("{}{}", "0".repeat(decimals as usize - digits.len()), digits);
    format!("{}.{}", whole, padded.trim_end_matches('0'))
}
