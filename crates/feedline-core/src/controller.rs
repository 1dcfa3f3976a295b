//! Streaming ingestion controller
//!
//! Owns the per-run state: dedup cache, shard writer, notification scheduler
//! and the consecutive-error streaks. Events and error codes are handled one
//! at a time, in arrival order, from a single thread.
//!
//! State machine: `Running` → (`Closing`) → `Terminated(reason)`. An error
//! streak or a storage failure jumps straight to `Terminated`; [`Controller::close`]
//! still runs afterwards to flush the final shard and drain uploads.

use std::time::{Duration, Instant};

use indicatif::ProgressBar;

use crate::dedup::{DedupCache, DEFAULT_CAPACITY};
use crate::elapsed::{rate_per_second, Elapsed};
use crate::error::{IngestError, TerminationReason};
use crate::event::Event;
use crate::notify::{
    send_best_effort, Notifier, NotifyDecision, NotifyPolicy, NotifyScheduler, FAILURE_SUBJECT,
    SUBJECT_PLACEHOLDER,
};
use crate::progress::{counter_message, fmt_num};
use crate::shard::{ShardWriter, DEFAULT_SHARD_SIZE};
use crate::source::StreamListener;
use crate::stream::is_rate_limit_code;

/// Consecutive rate-limit errors that end a run.
pub const RATE_LIMIT_STREAK: u32 = 3;

/// Consecutive non-rate-limit errors that end a run.
pub const UPSTREAM_ERROR_STREAK: u32 = 2;

/// Minimum gap between spinner refreshes
const PROGRESS_REFRESH: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Running,
    Closing,
    Terminated(TerminationReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Accepted events per shard
    pub shard_size: u64,
    pub dedup_capacity: usize,
    pub notify: NotifyPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            shard_size: DEFAULT_SHARD_SIZE,
            dedup_capacity: DEFAULT_CAPACITY,
            notify: NotifyPolicy::default(),
        }
    }
}

/// Counters mutated only on the event path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    /// Events written; never decremented
    pub total_written: u64,
    pub since_rotation: u64,
    pub since_notification: u64,
    /// Events dropped by the dedup cache
    pub duplicates: u64,
    pub rate_limit_streak: u32,
    pub other_error_streak: u32,
    /// Lifetime error totals, for the run summary
    pub rate_limit_errors: u64,
    pub other_errors: u64,
}

/// Final tally of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub reason: TerminationReason,
    pub total_written: u64,
    pub duplicates: u64,
    pub shards: u64,
    pub notifications_sent: u64,
    pub rate_limit_errors: u64,
    pub other_errors: u64,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn log(&self) {
        log::info!(
            "Run {}: {} events written, {} duplicates dropped, {} shard(s), {} notification(s) in {}",
            self.reason,
            fmt_num(self.total_written),
            fmt_num(self.duplicates),
            self.shards,
            self.notifications_sent,
            Elapsed::from(self.elapsed)
        );
        if self.rate_limit_errors > 0 || self.other_errors > 0 {
            log::info!(
                "Upstream errors: {} rate-limit, {} other",
                self.rate_limit_errors,
                self.other_errors
            );
        }
    }
}

/// Receives events and error codes from a stream source.
pub struct Controller {
    config: ControllerConfig,
    state: ControllerState,
    writer: ShardWriter,
    dedup: DedupCache,
    scheduler: NotifyScheduler,
    notifier: Box<dyn Notifier>,
    counters: RunCounters,
    started: Instant,
    progress: Option<ProgressBar>,
    last_refresh: Instant,
    closed: bool,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("state", &self.state)
            .field("counters", &self.counters)
            .field("writer", &self.writer)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Open the first shard and start accepting events.
    pub fn new(
        config: ControllerConfig,
        writer: ShardWriter,
        notifier: Box<dyn Notifier>,
    ) -> Result<Self, IngestError> {
        Self::starting_at(config, writer, notifier, Instant::now())
    }

    /// Like [`Controller::new`], with an explicit run start time.
    pub fn starting_at(
        config: ControllerConfig,
        mut writer: ShardWriter,
        notifier: Box<dyn Notifier>,
        now: Instant,
    ) -> Result<Self, IngestError> {
        writer.rotate()?;
        log::info!(
            "Starting collection into {} ({} events per shard)",
            writer.directory().display(),
            fmt_num(config.shard_size)
        );
        Ok(Self {
            config,
            state: ControllerState::Running,
            writer,
            dedup: DedupCache::new(config.dedup_capacity),
            scheduler: NotifyScheduler::new(config.notify, now),
            notifier,
            counters: RunCounters::default(),
            started: now,
            progress: None,
            last_refresh: now,
            closed: false,
        })
    }

    /// Show the running count on a spinner line.
    pub fn with_progress(mut self, pb: ProgressBar) -> Self {
        pb.set_message(counter_message(0, self.writer.shard_index(), None));
        self.progress = Some(pb);
        self
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn counters(&self) -> &RunCounters {
        &self.counters
    }

    pub fn shard_index(&self) -> u64 {
        self.writer.shard_index()
    }

    /// Process one delivered event at time `now`.
    pub fn handle_event(&mut self, event: Event, now: Instant) -> Result<(), IngestError> {
        self.ensure_running()?;

        let event = event.into_canonical();
        self.counters.rate_limit_streak = 0;
        self.counters.other_error_streak = 0;

        if self.dedup.seen_or_record(event.id()) {
            self.counters.duplicates += 1;
            log::trace!("Dropping duplicate {}", event.id());
        } else {
            let line = event.to_line().map_err(IngestError::Serialize)?;
            if let Err(e) = self.writer.write(&line) {
                return Err(self.storage_failure(e));
            }
            self.counters.total_written += 1;
            self.counters.since_rotation += 1;
            self.counters.since_notification += 1;
            self.rotate_if_needed()?;
        }

        self.notify_if_needed(now);
        self.refresh_progress(now);
        Ok(())
    }

    /// Process one upstream error code. `false` means disconnect.
    pub fn handle_error(&mut self, code: u16) -> bool {
        if self.state != ControllerState::Running {
            return false;
        }
        if is_rate_limit_code(code) {
            log::debug!("Rate limited (code {code})");
            self.counters.rate_limit_errors += 1;
            self.counters.rate_limit_streak += 1;
            if self.counters.rate_limit_streak >= RATE_LIMIT_STREAK {
                self.terminate(
                    TerminationReason::RateLimited,
                    "Too many rate limit errors",
                    code,
                );
                return false;
            }
        } else {
            log::error!("Error code received: {code}");
            self.counters.other_errors += 1;
            self.counters.other_error_streak += 1;
            if self.counters.other_error_streak >= UPSTREAM_ERROR_STREAK {
                self.terminate(
                    TerminationReason::UpstreamError(code),
                    "Too many other errors in a row",
                    code,
                );
                return false;
            }
        }
        true
    }

    /// End the run for a reason outside the event path (e.g. the source gave up).
    pub fn abort(&mut self, reason: TerminationReason, message: &str) {
        if self.state != ControllerState::Running {
            return;
        }
        log::error!("{message}. Closing at {}", local_timestamp());
        self.state = ControllerState::Terminated(reason);
        if reason.is_fatal() {
            self.send_failure(&format!("Disconnected feedline: {message}"));
        }
    }

    /// Flush the final shard, drain uploads and return the run summary.
    ///
    /// Idempotent. A run still `Running` ends as `Completed`.
    pub fn close(&mut self) -> Result<RunSummary, IngestError> {
        self.close_as(TerminationReason::Completed)
    }

    /// Close after an operator interrupt.
    pub fn interrupt(&mut self) -> Result<RunSummary, IngestError> {
        self.close_as(TerminationReason::Interrupted)
    }

    fn close_as(&mut self, orderly: TerminationReason) -> Result<RunSummary, IngestError> {
        let reason = match self.state {
            ControllerState::Terminated(reason) => reason,
            ControllerState::Running | ControllerState::Closing => orderly,
        };
        if self.closed {
            return Ok(self.summary(reason));
        }
        self.closed = true;
        if self.state == ControllerState::Running {
            self.state = ControllerState::Closing;
        }

        if let Some(pb) = self.progress.take() {
            pb.finish_and_clear();
        }

        let result = self.writer.close();
        match result {
            Ok(()) => {
                self.state = ControllerState::Terminated(reason);
                Ok(self.summary(reason))
            }
            Err(e) if reason.is_fatal() => {
                // Already failed and notified; report the close error too
                log::error!("Failed to close final shard: {e}");
                self.state = ControllerState::Terminated(reason);
                Err(IngestError::Io(e))
            }
            Err(e) => Err(self.storage_failure(e)),
        }
    }

    fn summary(&self, reason: TerminationReason) -> RunSummary {
        RunSummary {
            reason,
            total_written: self.counters.total_written,
            duplicates: self.counters.duplicates,
            shards: self.writer.shard_index(),
            notifications_sent: self.scheduler.sent(),
            rate_limit_errors: self.counters.rate_limit_errors,
            other_errors: self.counters.other_errors,
            elapsed: self.started.elapsed(),
        }
    }

    fn ensure_running(&self) -> Result<(), IngestError> {
        match self.state {
            ControllerState::Running => Ok(()),
            ControllerState::Closing => {
                Err(IngestError::Terminated(TerminationReason::Completed))
            }
            ControllerState::Terminated(reason) => Err(IngestError::Terminated(reason)),
        }
    }

    fn rotate_if_needed(&mut self) -> Result<(), IngestError> {
        if self.counters.since_rotation < self.config.shard_size {
            return Ok(());
        }
        if let Err(e) = self.writer.rotate() {
            return Err(self.storage_failure(e));
        }
        self.counters.since_rotation = 0;
        Ok(())
    }

    fn notify_if_needed(&mut self, now: Instant) {
        let total = self.counters.total_written;
        let decision = self.scheduler.should_notify(total, now);
        if decision == NotifyDecision::None {
            return;
        }
        let message = self.scheduler.report(total, now).to_string();
        log::info!("{message}");
        if decision == NotifyDecision::WithTransport {
            send_best_effort(self.notifier.as_ref(), &message, SUBJECT_PLACEHOLDER);
            self.counters.since_notification = 0;
        }
        self.scheduler.record(decision, total, now);
    }

    fn refresh_progress(&mut self, now: Instant) {
        let Some(pb) = &self.progress else {
            return;
        };
        if now.saturating_duration_since(self.last_refresh) < PROGRESS_REFRESH {
            return;
        }
        self.last_refresh = now;
        let rate = rate_per_second(
            self.counters.total_written,
            now.saturating_duration_since(self.started),
        );
        pb.set_message(counter_message(
            self.counters.total_written,
            self.writer.shard_index(),
            rate,
        ));
    }

    fn terminate(&mut self, reason: TerminationReason, message: &str, code: u16) {
        log::error!("{message}. Closing at {}", local_timestamp());
        self.state = ControllerState::Terminated(reason);
        self.send_failure(&format!("Disconnected feedline due to error code: {code}"));
    }

    /// Local writes cannot be retried safely: terminate and notify.
    fn storage_failure(&mut self, e: std::io::Error) -> IngestError {
        log::error!(
            "Storage failure on shard {}: {e}. Closing at {}",
            self.writer.shard_index(),
            local_timestamp()
        );
        self.state = ControllerState::Terminated(TerminationReason::StorageFailure);
        self.send_failure(&format!(
            "Disconnected feedline after a storage failure: {e}"
        ));
        IngestError::Io(e)
    }

    fn send_failure(&self, body: &str) {
        send_best_effort(self.notifier.as_ref(), body, FAILURE_SUBJECT);
    }
}

impl StreamListener for Controller {
    fn on_event(&mut self, event: Event) -> Result<(), IngestError> {
        self.handle_event(event, Instant::now())
    }

    fn on_error(&mut self, code: u16) -> bool {
        self.handle_error(code)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                log::error!("Failed to close controller: {e}");
            }
        }
    }
}

fn local_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
