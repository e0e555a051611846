//! Wall-clock helpers

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. Saturates instead of wrapping.
pub fn current_timestamp_ms() -> u64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(current_timestamp_ms() > 1_577_836_800_000);
    }
}
