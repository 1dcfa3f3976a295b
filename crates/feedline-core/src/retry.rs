//! Reconnect backoff for the stream source

use std::time::{Duration, Instant};

use crate::shutdown::ShutdownFlag;

/// Upper bound on a single reconnect wait
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(320);

/// Poll interval while sleeping, so shutdown is honoured promptly
const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Exponential backoff: 2^attempt seconds (2s, 4s, 8s, ...)
pub const fn backoff_duration(attempt: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempt))
}

/// Backoff for the `attempt`-th consecutive failed connection, capped.
pub fn reconnect_delay(attempt: u32) -> Duration {
    // 2^9 already exceeds the cap; avoid overflow on long outages
    backoff_duration(attempt.min(9)).min(MAX_RECONNECT_DELAY)
}

/// Sleep for `duration`, waking early on shutdown.
///
/// Returns `false` if shutdown was requested.
pub fn sleep_unless_shutdown(duration: Duration, shutdown: ShutdownFlag) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if shutdown.is_requested() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_exponential() {
        assert_eq!(backoff_duration(1), Duration::from_secs(2));
        assert_eq!(backoff_duration(2), Duration::from_secs(4));
        assert_eq!(backoff_duration(3), Duration::from_secs(8));
    }

    #[test]
    fn reconnect_delay_capped() {
        assert_eq!(reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(reconnect_delay(8), Duration::from_secs(256));
        assert_eq!(reconnect_delay(9), MAX_RECONNECT_DELAY);
        assert_eq!(reconnect_delay(40), MAX_RECONNECT_DELAY);
    }

    #[test]
    fn sleep_stops_on_shutdown() {
        let flag = ShutdownFlag::standalone();
        flag.request();
        assert!(!sleep_unless_shutdown(Duration::from_secs(60), flag));
    }

    #[test]
    fn sleep_completes() {
        let flag = ShutdownFlag::standalone();
        assert!(sleep_unless_shutdown(Duration::from_millis(10), flag));
    }
}
