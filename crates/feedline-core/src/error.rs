//! Common error type for the ingestion path

use crate::offload::OffloadError;
use crate::stream::StreamError;

/// Why a run stopped.
///
/// `Completed` and `Interrupted` are orderly; every other reason is fatal and
/// maps to a non-zero exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Source exhausted or stopped cleanly
    Completed,
    /// Operator interrupt (SIGINT/SIGTERM)
    Interrupted,
    /// Consecutive rate-limit streak crossed its threshold
    RateLimited,
    /// Consecutive upstream error streak crossed its threshold (last code)
    UpstreamError(u16),
    /// Local shard write or close failed
    StorageFailure,
    /// Stream source gave up (connection exhausted, unreadable input)
    SourceFailure,
}

impl TerminationReason {
    pub fn is_fatal(self) -> bool {
        !matches!(self, Self::Completed | Self::Interrupted)
    }

    /// Process exit status for this outcome.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Completed => 0,
            Self::Interrupted => 130,
            _ => 1,
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Interrupted => f.write_str("interrupted"),
            Self::RateLimited => f.write_str("rate limited"),
            Self::UpstreamError(code) => write!(f, "upstream error (code {code})"),
            Self::StorageFailure => f.write_str("storage failure"),
            Self::SourceFailure => f.write_str("source failure"),
        }
    }
}

/// Error surfaced by the ingestion controller and stream sources.
#[derive(Debug)]
pub enum IngestError {
    /// Local filesystem failure (shard write/rotate/close). Fatal.
    Io(std::io::Error),
    /// Network or HTTP failure talking to the upstream stream
    Stream(StreamError),
    /// Event payload could not be serialized
    Serialize(serde_json::Error),
    /// Invalid configuration or missing credentials
    Config(String),
    /// Notification transport failure (never raised into the event path)
    Notify(String),
    /// Remote store setup failed before the run started
    Offload(OffloadError),
    /// Controller no longer accepts input
    Terminated(TerminationReason),
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO: {e}"),
            Self::Stream(e) => write!(f, "stream: {e}"),
            Self::Serialize(e) => write!(f, "serialize: {e}"),
            Self::Config(msg) => write!(f, "configuration: {msg}"),
            Self::Notify(msg) => write!(f, "notification: {msg}"),
            Self::Offload(e) => write!(f, "offload: {e}"),
            Self::Terminated(reason) => write!(f, "run terminated: {reason}"),
        }
    }
}

impl std::error::Error for IngestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Stream(e) => Some(e),
            Self::Serialize(e) => Some(e),
            Self::Offload(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for IngestError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<StreamError> for IngestError {
    fn from(e: StreamError) -> Self {
        Self::Stream(e)
    }
}

impl From<OffloadError> for IngestError {
    fn from(e: OffloadError) -> Self {
        Self::Offload(e)
    }
}

impl IngestError {
    /// Termination reason implied by this error when it ends a run.
    pub fn termination_reason(&self) -> TerminationReason {
        match self {
            Self::Io(_) => TerminationReason::StorageFailure,
            Self::Terminated(reason) => *reason,
            _ => TerminationReason::SourceFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn orderly_reasons_not_fatal() {
        assert!(!TerminationReason::Completed.is_fatal());
        assert!(!TerminationReason::Interrupted.is_fatal());
        assert!(TerminationReason::RateLimited.is_fatal());
        assert!(TerminationReason::UpstreamError(500).is_fatal());
        assert!(TerminationReason::StorageFailure.is_fatal());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(TerminationReason::Completed.exit_code(), 0);
        assert_eq!(TerminationReason::Interrupted.exit_code(), 130);
        assert_eq!(TerminationReason::RateLimited.exit_code(), 1);
        assert_eq!(TerminationReason::SourceFailure.exit_code(), 1);
    }

    #[test]
    fn io_error_maps_to_storage_failure() {
        let err = IngestError::from(std::io::Error::new(ErrorKind::StorageFull, "disk full"));
        assert_eq!(err.termination_reason(), TerminationReason::StorageFailure);
        assert!(format!("{err}").contains("IO:"));
    }

    #[test]
    fn display_upstream_reason() {
        let err = IngestError::Terminated(TerminationReason::UpstreamError(503));
        assert_eq!(format!("{err}"), "run terminated: upstream error (code 503)");
    }
}
