//! Progress notifications: when to send them and how
//!
//! [`NotifyScheduler`] decides, per event, whether a progress report goes out
//! through a [`Notifier`], only to the operational log, or nowhere.

use std::time::{Duration, Instant};

use crate::credentials::NotifyCredentials;
use crate::elapsed::{self, Elapsed, DEFAULT_MILESTONE};
use crate::error::IngestError;
use crate::progress::fmt_num;
use crate::stream::{http_client, SHARED_RUNTIME};

pub const DEFAULT_SUBJECT: &str = "Message from feedline";

/// Replaced by the transport's default subject at send time.
pub const SUBJECT_PLACEHOLDER: &str = "{default_subject}";

/// Subject used for failure notifications.
pub const FAILURE_SUBJECT: &str = "[ERROR] {default_subject}";

/// Log-only progress report interval.
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(3600);

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolve `{default_subject}` in `template`.
pub fn render_subject(template: &str, default_subject: &str) -> String {
    template.replace(SUBJECT_PLACEHOLDER, default_subject)
}

/// Delivers a (subject, body) pair to an operator.
pub trait Notifier: Send {
    fn default_subject(&self) -> &str;

    /// `subject` may contain `{default_subject}`.
    fn send(&self, body: &str, subject: &str) -> Result<(), IngestError>;
}

/// Send and swallow failures. Returns whether delivery succeeded.
pub fn send_best_effort(notifier: &dyn Notifier, body: &str, subject: &str) -> bool {
    match notifier.send(body, subject) {
        Ok(()) => true,
        Err(e) => {
            log::error!("Failed to send notification: {e}");
            false
        }
    }
}

/// Transport used when notifications are turned off. Logs and drops.
#[derive(Debug, Clone)]
pub struct DisabledNotifier {
    default_subject: String,
}

impl DisabledNotifier {
    pub fn new() -> Self {
        Self {
            default_subject: DEFAULT_SUBJECT.to_string(),
        }
    }
}

impl Default for DisabledNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for DisabledNotifier {
    fn default_subject(&self) -> &str {
        &self.default_subject
    }

    fn send(&self, _body: &str, subject: &str) -> Result<(), IngestError> {
        log::debug!(
            "Notifications disabled, dropping \"{}\"",
            render_subject(subject, &self.default_subject)
        );
        Ok(())
    }
}

/// Posts `{"subject": ..., "body": ...}` as JSON to a webhook URL.
pub struct WebhookNotifier {
    url: String,
    default_subject: String,
    credentials: Option<NotifyCredentials>,
}

impl std::fmt::Debug for WebhookNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookNotifier")
            .field("url", &self.url)
            .field("default_subject", &self.default_subject)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl WebhookNotifier {
    pub fn new(
        url: impl Into<String>,
        default_subject: Option<String>,
        credentials: Option<NotifyCredentials>,
    ) -> Self {
        Self {
            url: url.into(),
            default_subject: default_subject.unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
            credentials,
        }
    }
}

impl Notifier for WebhookNotifier {
    fn default_subject(&self) -> &str {
        &self.default_subject
    }

    fn send(&self, body: &str, subject: &str) -> Result<(), IngestError> {
        let subject = render_subject(subject, &self.default_subject);
        let payload = serde_json::json!({ "subject": subject, "body": body });

        let mut request = http_client()
            .post(&self.url)
            .timeout(WEBHOOK_TIMEOUT)
            .json(&payload);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        SHARED_RUNTIME
            .block_on(async {
                let resp = request.send().await?;
                resp.error_for_status()
            })
            .map_err(|e| IngestError::Notify(e.to_string()))?;
        log::debug!("Notification sent: {subject}");
        Ok(())
    }
}

/// What to do with a progress report after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyDecision {
    None,
    /// Operational log only
    Silent,
    /// Log and send through the transport
    WithTransport,
}

/// Trigger configuration for [`NotifyScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyPolicy {
    /// Fire at every positive multiple of this count
    pub every_count: Option<u64>,
    /// Fire when this much time has passed since the last notification
    pub every_interval: Option<Duration>,
    /// Log-only report when nothing else fired for this long
    pub log_interval: Duration,
    /// Round number used for ETA projection
    pub milestone: u64,
}

impl Default for NotifyPolicy {
    fn default() -> Self {
        Self {
            every_count: None,
            every_interval: None,
            log_interval: DEFAULT_LOG_INTERVAL,
            milestone: DEFAULT_MILESTONE,
        }
    }
}

/// Count- and time-throttled notification triggers.
#[derive(Debug, Clone)]
pub struct NotifyScheduler {
    policy: NotifyPolicy,
    started: Instant,
    last_notification: Instant,
    last_notification_count: u64,
    last_log: Instant,
    sent: u64,
}

impl NotifyScheduler {
    pub fn new(policy: NotifyPolicy, now: Instant) -> Self {
        Self {
            policy,
            started: now,
            last_notification: now,
            last_notification_count: 0,
            last_log: now,
            sent: 0,
        }
    }

    /// Transport notifications recorded so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn should_notify(&self, total_written: u64, now: Instant) -> NotifyDecision {
        // A zero count disables the count trigger
        let by_count = self.policy.every_count.filter(|n| *n > 0).is_some_and(|n| {
            total_written > 0
                && total_written % n == 0
                && total_written != self.last_notification_count
        });
        let by_time = self
            .policy
            .every_interval
            .is_some_and(|interval| now.saturating_duration_since(self.last_notification) > interval);

        if by_count || by_time {
            NotifyDecision::WithTransport
        } else if now.saturating_duration_since(self.last_log) > self.policy.log_interval {
            NotifyDecision::Silent
        } else {
            NotifyDecision::None
        }
    }

    /// Move the throttling marks after acting on `decision`.
    pub fn record(&mut self, decision: NotifyDecision, total_written: u64, now: Instant) {
        match decision {
            NotifyDecision::None => {}
            NotifyDecision::Silent => self.last_log = now,
            NotifyDecision::WithTransport => {
                self.last_log = now;
                self.last_notification = now;
                self.last_notification_count = total_written;
                self.sent += 1;
            }
        }
    }

    pub fn report(&self, total_written: u64, now: Instant) -> ProgressReport {
        ProgressReport {
            total: total_written,
            elapsed: now.saturating_duration_since(self.started),
            milestone: self.policy.milestone,
        }
    }
}

/// Progress message body: count, elapsed time, rate and milestone ETA.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressReport {
    pub total: u64,
    pub elapsed: Duration,
    pub milestone: u64,
}

impl ProgressReport {
    /// Average events per minute; `None` when no time has passed.
    pub fn rate_per_minute(&self) -> Option<f64> {
        elapsed::rate_per_second(self.total, self.elapsed).map(|r| r * 60.0)
    }
}

impl std::fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} events have been collected so far (time elapsed: {}). ",
            fmt_num(self.total),
            Elapsed::from(self.elapsed)
        )?;
        match self.rate_per_minute() {
            Some(rate) => write!(f, "The collection rate is an average of {rate:.2} events/min. ")?,
            None => f.write_str("The collection rate is unavailable. ")?,
        }
        let next = elapsed::next_milestone(self.total, self.milestone);
        match elapsed::eta_to_milestone(self.total, self.elapsed, self.milestone) {
            Some(eta) => write!(f, "ETA to {} events: {eta}", fmt_num(next)),
            None => write!(f, "ETA to {} events: unavailable", fmt_num(next)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn subject_placeholder() {
        assert_eq!(render_subject(FAILURE_SUBJECT, "feed"), "[ERROR] feed");
        assert_eq!(render_subject("plain", "feed"), "plain");
    }

    #[test]
    fn count_trigger_fires_on_multiples_only() {
        let t0 = Instant::now();
        let policy = NotifyPolicy {
            every_count: Some(100),
            ..Default::default()
        };
        let mut s = NotifyScheduler::new(policy, t0);

        let mut fired = Vec::new();
        for total in 0..=350 {
            let d = s.should_notify(total, t0);
            if d == NotifyDecision::WithTransport {
                fired.push(total);
            }
            s.record(d, total, t0);
        }
        assert_eq!(fired, vec![100, 200, 300]);
    }

    #[test]
    fn zero_count_never_fires() {
        let t0 = Instant::now();
        let s = NotifyScheduler::new(
            NotifyPolicy {
                every_count: Some(0),
                ..Default::default()
            },
            t0,
        );
        for total in 0..10 {
            assert_eq!(s.should_notify(total, t0), NotifyDecision::None);
        }
    }

    #[test]
    fn count_trigger_does_not_repeat_at_same_total() {
        let t0 = Instant::now();
        let mut s = NotifyScheduler::new(
            NotifyPolicy {
                every_count: Some(10),
                ..Default::default()
            },
            t0,
        );
        assert_eq!(s.should_notify(10, t0), NotifyDecision::WithTransport);
        s.record(NotifyDecision::WithTransport, 10, t0);
        // duplicates keep the total at 10
        assert_eq!(s.should_notify(10, t0), NotifyDecision::None);
    }

    #[test]
    fn time_trigger_once_per_interval() {
        let t0 = Instant::now();
        let mut s = NotifyScheduler::new(
            NotifyPolicy {
                every_interval: Some(secs(60)),
                ..Default::default()
            },
            t0,
        );
        assert_eq!(s.should_notify(5, t0 + secs(60)), NotifyDecision::None);

        let t1 = t0 + secs(61);
        assert_eq!(s.should_notify(6, t1), NotifyDecision::WithTransport);
        s.record(NotifyDecision::WithTransport, 6, t1);

        // burst right after firing
        for total in 7..1000 {
            assert_eq!(s.should_notify(total, t1 + secs(1)), NotifyDecision::None);
        }
        assert_eq!(
            s.should_notify(1000, t1 + secs(62)),
            NotifyDecision::WithTransport
        );
    }

    #[test]
    fn silent_log_after_log_interval() {
        let t0 = Instant::now();
        let mut s = NotifyScheduler::new(NotifyPolicy::default(), t0);
        assert_eq!(s.should_notify(1, t0 + secs(3600)), NotifyDecision::None);
        let t1 = t0 + secs(3601);
        assert_eq!(s.should_notify(1, t1), NotifyDecision::Silent);
        s.record(NotifyDecision::Silent, 1, t1);
        assert_eq!(s.should_notify(2, t1 + secs(10)), NotifyDecision::None);
        assert_eq!(s.sent(), 0);
    }

    #[test]
    fn report_message() {
        let report = ProgressReport {
            total: 500_000,
            elapsed: secs(1000),
            milestone: 1_000_000,
        };
        assert_eq!(
            report.to_string(),
            "500,000 events have been collected so far (time elapsed: 0d0h16m40s [1000s]). \
             The collection rate is an average of 30000.00 events/min. \
             ETA to 1,000,000 events: 0d0h16m40s [1000s]"
        );
    }

    #[test]
    fn report_without_elapsed_time() {
        let report = ProgressReport {
            total: 3,
            elapsed: Duration::ZERO,
            milestone: 1_000_000,
        };
        let text = report.to_string();
        assert!(text.contains("rate is unavailable"));
        assert!(text.ends_with("ETA to 1,000,000 events: unavailable"));
    }

    #[test]
    fn disabled_notifier_accepts_everything() {
        let n = DisabledNotifier::new();
        assert_eq!(n.default_subject(), DEFAULT_SUBJECT);
        assert!(send_best_effort(&n, "body", FAILURE_SUBJECT));
    }

    #[test]
    fn webhook_failure_is_reported_not_raised() {
        // Port 9 (discard) on localhost refuses connections in test sandboxes
        let n = WebhookNotifier::new("http://127.0.0.1:9/hook", None, None);
        assert!(!send_best_effort(&n, "body", SUBJECT_PLACEHOLDER));
    }
}
