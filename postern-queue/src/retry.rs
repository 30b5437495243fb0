//! Retry scheduling.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between attempts: 1m, 5m, 30m, 2h, 6h, 1d. Retry counts past the
/// table clamp to the last entry.
pub const BACKOFF_TABLE: [u64; 6] = [60, 300, 1800, 7200, 21600, 86400];

#[must_use]
pub fn backoff(retry_count: u32) -> Duration {
    let index = (retry_count as usize).min(BACKOFF_TABLE.len() - 1);
    Duration::from_secs(BACKOFF_TABLE[index])
}

#[must_use]
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Contents of the `failure/<id>.retry` sidecar: `<retry_count> <next_retry_unix>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct RetrySchedule {
    pub retry_count: u32,
    pub next_retry_unix: u64,
}

impl RetrySchedule {
    pub(crate) fn serialize(self) -> String {
        format!("{} {}\n", self.retry_count, self.next_retry_unix)
    }

    /// A missing or corrupt sidecar degrades to "due now, no retries yet",
    /// which can only accelerate a retry, never lose a message.
    pub(crate) fn parse(content: &str) -> Self {
        let mut tokens = content.split_whitespace();
        let retry_count = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(0);
        let next_retry_unix = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(0);
        Self {
            retry_count,
            next_retry_unix,
        }
    }

    pub(crate) fn is_due(self, now: u64) -> bool {
        now >= self.next_retry_unix
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_follows_the_table() {
        assert_eq!(backoff(0), Duration::from_secs(60));
        assert_eq!(backoff(1), Duration::from_secs(300));
        assert_eq!(backoff(2), Duration::from_secs(1800));
        assert_eq!(backoff(5), Duration::from_secs(86400));
    }

    #[test]
    fn backoff_clamps_past_the_table() {
        assert_eq!(backoff(6), Duration::from_secs(86400));
        assert_eq!(backoff(100), Duration::from_secs(86400));
    }

    #[test]
    fn schedule_round_trip() {
        let schedule = RetrySchedule {
            retry_count: 3,
            next_retry_unix: 1_700_000_000,
        };
        assert_eq!(
            RetrySchedule::parse(&schedule.serialize()),
            schedule
        );
    }

    #[test]
    fn corrupt_schedule_is_due_immediately() {
        let schedule = RetrySchedule::parse("garbage");
        assert_eq!(schedule.retry_count, 0);
        assert!(schedule.is_due(now_unix()));
    }

    #[test]
    fn due_gating() {
        let schedule = RetrySchedule {
            retry_count: 2,
            next_retry_unix: 1000,
        };
        assert!(!schedule.is_due(999));
        assert!(schedule.is_due(1000));
    }
}
