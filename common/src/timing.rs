use chrono::Utc;

/// Current wall-clock time in Unix milliseconds
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Convert a block timestamp (seconds) to Unix milliseconds
pub fn block_seconds_to_millis(seconds: u64) -> u64 {
    seconds.saturating_mul(1_000)
}

/// First block of a lookback window ending at `head`, clamped at genesis
pub fn lookback_start(head: u64, lookback_blocks: u64) -> u64 {
    head.saturating_sub(lookback_blocks)
}
