use std::time::{SystemTime, UNIX_EPOCH};

/// The smallest accepted document timestamp, in microseconds.
pub const MIN_TIMESTAMP: u64 = 10_000_000_000_000;

/// The largest accepted document timestamp: 2^53 - 2, so every timestamp
/// survives a trip through a JSON number.
pub const MAX_TIMESTAMP: u64 = 9_007_199_254_740_990;

/// How far beyond the local wall clock a write may claim to be: 10 minutes,
/// in microseconds.
pub const FUTURE_CUTOFF: u64 = 600_000_000;

/// The current wall clock in microseconds since the UNIX epoch.
pub fn now_microseconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_in_accepted_range() {
        let now = now_microseconds();
        assert!(now > MIN_TIMESTAMP);
        assert!(now < MAX_TIMESTAMP);
    }
}
