//! Feedline Core - streaming ingestion building blocks
//!
//! Receives a long-lived event stream, drops recently seen events, writes the
//! rest into rotating JSONL shards, moves completed shards to durable storage
//! and reports progress on count/time schedules.

pub mod config;
pub mod controller;
pub mod credentials;
pub mod dedup;
pub mod elapsed;
pub mod error;
pub mod event;
pub mod logging;
pub mod notify;
pub mod offload;
pub mod progress;
pub mod retry;
pub mod shard;
pub mod shutdown;
pub mod source;
pub mod stream;

// Re-exports for convenience
pub use config::RunConfig;
pub use controller::{Controller, ControllerConfig, ControllerState, RunCounters, RunSummary};
pub use credentials::{CredentialProvider, Credentials, NotifyCredentials};
pub use dedup::DedupCache;
pub use elapsed::Elapsed;
pub use error::{IngestError, TerminationReason};
pub use event::{Event, StreamMessage};
pub use logging::{init_logging, FeedlineLogger};
pub use notify::{
    DisabledNotifier, Notifier, NotifyDecision, NotifyPolicy, NotifyScheduler, WebhookNotifier,
};
pub use offload::{FsStore, OffloadError, OffloadMover, OffloadOutcome, OffloadSummary, RemoteStore};
pub use progress::{ProgressContext, SharedProgress};
pub use shard::{CompletedShard, ShardListener, ShardWriter};
pub use shutdown::{shutdown_flag, ShutdownFlag};
pub use source::{JsonlSource, SourceExit, SourceStats, StreamListener, StreamSource};
pub use stream::{
    http_client, Connector, FilterParams, HttpConnector, HttpStreamSource, StreamConfig,
    StreamError, SHARED_RUNTIME,
};
