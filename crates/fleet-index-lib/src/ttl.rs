//! Cache time-to-live computation from feed freshness
//!
//! Feeds announce when they were last updated and how long their content stays valid.
//! Entities derived from a feed live until the feed's data goes stale, bounded below so a
//! late poll does not write already-expired entries, and optionally bounded above.

use std::time::Duration;

/// Remaining validity of feed data, clamped to `[minimum, maximum]`.
///
/// All timestamps are unix seconds. `maximum` is ignored when it is below `minimum`.
pub fn compute_ttl(
    now: u64,
    last_updated: u64,
    ttl: u64,
    minimum: Duration,
    maximum: Option<Duration>,
) -> Duration {
    let remaining = last_updated.saturating_add(ttl).saturating_sub(now);
    let ttl = Duration::from_secs(remaining).max(minimum);
    match maximum {
        Some(maximum) if maximum >= minimum => ttl.min(maximum),
        _ => ttl,
    }
}

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_ttl_remaining_validity() {
        let ttl = compute_ttl(1_000, 990, 60, Duration::from_secs(30), None);
        assert_eq!(ttl, Duration::from_secs(50));
    }

    #[test]
    fn test_compute_ttl_applies_minimum() {
        // Feed already stale
        let ttl = compute_ttl(1_000, 500, 60, Duration::from_secs(30), None);
        assert_eq!(ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_compute_ttl_applies_maximum() {
        let ttl = compute_ttl(
            1_000,
            1_000,
            3_600,
            Duration::from_secs(30),
            Some(Duration::from_secs(300)),
        );
        assert_eq!(ttl, Duration::from_secs(300));
    }
}
