//! Resolved run configuration and fail-fast validation

use std::path::PathBuf;
use std::time::Duration;

use crate::controller::ControllerConfig;
use crate::dedup::DEFAULT_CAPACITY;
use crate::elapsed::DEFAULT_MILESTONE;
use crate::error::IngestError;
use crate::notify::{NotifyPolicy, DEFAULT_LOG_INTERVAL};
use crate::shard::{DEFAULT_SHARD_SIZE, DEFAULT_SHARD_TEMPLATE, SHARD_INDEX_PLACEHOLDER};
use crate::stream::FilterParams;

/// Everything a run needs after file and command-line settings are merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub filter: FilterParams,
    pub output_dir: Option<PathBuf>,
    pub shard_size: u64,
    pub shard_template: String,
    pub dedup_capacity: usize,
    /// Notify every N written events
    pub notify_count: Option<u64>,
    /// Notify every N seconds
    pub notify_seconds: Option<u64>,
    pub log_interval: Duration,
    pub milestone: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            filter: FilterParams::default(),
            output_dir: None,
            shard_size: DEFAULT_SHARD_SIZE,
            shard_template: DEFAULT_SHARD_TEMPLATE.to_string(),
            dedup_capacity: DEFAULT_CAPACITY,
            notify_count: None,
            notify_seconds: None,
            log_interval: DEFAULT_LOG_INTERVAL,
            milestone: DEFAULT_MILESTONE,
        }
    }
}

impl RunConfig {
    /// Reject configurations that cannot run. Called before connecting.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.filter.is_empty() {
            return Err(config_error("one of follow, track or locations is required"));
        }
        self.validate_storage()
    }

    /// Output and scheduling checks, without the filter requirement.
    ///
    /// Replaying a recorded stream needs no filter criteria.
    pub fn validate_storage(&self) -> Result<(), IngestError> {
        if self.output_dir.is_none() {
            return Err(config_error("an output directory is required"));
        }
        if self.notify_count == Some(0) {
            return Err(config_error("notify count must be greater than zero"));
        }
        if self.notify_seconds == Some(0) {
            return Err(config_error("notify interval must be greater than zero"));
        }
        if self.shard_size == 0 {
            return Err(config_error("shard size must be greater than zero"));
        }
        if self.dedup_capacity == 0 {
            return Err(config_error("dedup capacity must be greater than zero"));
        }
        if self.milestone == 0 {
            return Err(config_error("milestone must be greater than zero"));
        }
        if !self.shard_template.contains(SHARD_INDEX_PLACEHOLDER) {
            return Err(config_error(&format!(
                "shard template {:?} must contain {SHARD_INDEX_PLACEHOLDER}",
                self.shard_template
            )));
        }
        Ok(())
    }

    /// Validated output directory.
    pub fn output_dir(&self) -> Result<&PathBuf, IngestError> {
        self.output_dir
            .as_ref()
            .ok_or_else(|| config_error("an output directory is required"))
    }

    pub fn notify_policy(&self) -> NotifyPolicy {
        NotifyPolicy {
            every_count: self.notify_count,
            every_interval: self.notify_seconds.map(Duration::from_secs),
            log_interval: self.log_interval,
            milestone: self.milestone,
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            shard_size: self.shard_size,
            dedup_capacity: self.dedup_capacity,
            notify: self.notify_policy(),
        }
    }
}

fn config_error(msg: &str) -> IngestError {
    IngestError::Config(msg.to_string())
}
