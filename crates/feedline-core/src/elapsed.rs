//! Human-readable durations and rate/ETA projection

use std::time::Duration;

/// Default round-number milestone used for ETA projection.
pub const DEFAULT_MILESTONE: u64 = 1_000_000;

/// A duration split into days/hours/minutes/seconds.
///
/// Displays as `1d2h3m4s [93784s]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Elapsed {
    total_seconds: f64,
}

impl Elapsed {
    pub fn from_secs_f64(total_seconds: f64) -> Self {
        Self {
            total_seconds: total_seconds.max(0.0),
        }
    }

    pub fn total_seconds(&self) -> f64 {
        self.total_seconds
    }

    pub fn days(&self) -> u64 {
        (self.total_seconds / 86_400.0) as u64
    }

    pub fn hours(&self) -> u64 {
        ((self.total_seconds / 3600.0) % 24.0) as u64
    }

    pub fn minutes(&self) -> u64 {
        ((self.total_seconds / 60.0) % 60.0) as u64
    }

    pub fn seconds(&self) -> u64 {
        (self.total_seconds % 60.0) as u64
    }
}

impl From<Duration> for Elapsed {
    fn from(d: Duration) -> Self {
        Self::from_secs_f64(d.as_secs_f64())
    }
}

impl std::fmt::Display for Elapsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}d{}h{}m{}s [{}s]",
            self.days(),
            self.hours(),
            self.minutes(),
            self.seconds(),
            self.total_seconds as u64
        )
    }
}

/// Average events per second, or `None` when no time has passed.
pub fn rate_per_second(total: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return None;
    }
    Some(total as f64 / secs)
}

/// Smallest multiple of `milestone` strictly greater than `total`.
pub fn next_milestone(total: u64, milestone: u64) -> u64 {
    let milestone = milestone.max(1);
    (total / milestone + 1) * milestone
}

/// Projected time until the next milestone at the current average rate.
///
/// `None` when the rate is undefined (zero elapsed) or zero (nothing written).
pub fn eta_to_milestone(total: u64, elapsed: Duration, milestone: u64) -> Option<Elapsed> {
    let rate = rate_per_second(total, elapsed)?;
    if rate <= 0.0 {
        return None;
    }
    let remaining = next_milestone(total, milestone) - total;
    Some(Elapsed::from_secs_f64(remaining as f64 / rate))
}
