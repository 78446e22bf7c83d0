//! # Time
//!
//! All protocol expiries are Unix timestamps in seconds; relay publish
//! timestamps are milliseconds. Everything goes through `chrono` so the
//! whole crate agrees on a single clock.

/// Returns the current Unix timestamp in seconds.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Returns a Unix timestamp `ttl` seconds in the future.
pub fn expiry_from_ttl(ttl: u64) -> u64 {
    now_timestamp() as u64 + ttl
}

/// One minute in seconds.
pub const ONE_MINUTE: u64 = 60;
/// Five minutes in seconds — the default proposal/request TTL.
pub const FIVE_MINUTES: u64 = 5 * ONE_MINUTE;
/// One hour in seconds.
pub const ONE_HOUR: u64 = 60 * ONE_MINUTE;
/// One day in seconds.
pub const ONE_DAY: u64 = 24 * ONE_HOUR;
/// Seven days in seconds — the hard ceiling for request expiries.
pub const SEVEN_DAYS: u64 = 7 * ONE_DAY;
/// Thirty days in seconds — active pairing and history retention.
pub const THIRTY_DAYS: u64 = 30 * ONE_DAY;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_timestamp_is_reasonable() {
        let ts = now_timestamp();
        // Should be after 2024-01-01 (1704067200)
        assert!(ts > 1704067200, "Timestamp {} is too old", ts);
        // Should be before 2100-01-01 (4102444800)
        assert!(ts < 4102444800, "Timestamp {} is too far in future", ts);
    }

    #[test]
    fn test_expiry_from_ttl() {
        let expiry = expiry_from_ttl(FIVE_MINUTES);
        assert!(expiry > now_timestamp() as u64);
        assert!(expiry <= now_timestamp() as u64 + FIVE_MINUTES + 1);
    }
}
