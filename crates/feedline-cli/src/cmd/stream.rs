//! Stream command - collect from the live filter endpoint

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Args;

use feedline_core::{
    CredentialProvider, HttpStreamSource, RunConfig, SharedProgress, ShutdownFlag, StreamConfig,
};

use super::common::{build_notifier, execute, RunArgs};
use crate::config::Config;

#[derive(Args, Debug)]
pub struct StreamArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Filter endpoint URL
    #[arg(long)]
    pub url: Option<String>,

    /// Read timeout in seconds for stall detection
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// Connection attempts without a status before giving up
    #[arg(long)]
    pub max_reconnects: Option<u32>,
}

impl StreamArgs {
    fn stream_config(&self, config: &Config, run: &RunConfig) -> StreamConfig {
        StreamConfig {
            url: self.url.clone().unwrap_or_else(|| config.stream.url.clone()),
            filter: run.filter.clone(),
            read_timeout: Duration::from_secs(
                self.read_timeout.unwrap_or(config.stream.read_timeout),
            ),
            max_reconnects: self.max_reconnects.unwrap_or(config.stream.max_reconnects),
        }
    }
}

pub fn run(
    args: StreamArgs,
    config: &Config,
    credentials: &CredentialProvider,
    progress: &SharedProgress,
) -> Result<ExitCode> {
    let run = args.run.resolve(config);
    run.validate()?;
    let stream_credentials = credentials.stream()?;

    let stream_config = args.stream_config(config, &run);
    log::info!(
        "Filter: follow={:?} track={:?} languages={:?} locations={:?}",
        run.filter.follow,
        run.filter.track,
        run.filter.languages,
        run.filter.locations
    );

    let notifier = build_notifier(
        args.run.notify_enabled(config),
        config,
        credentials.notify(),
    );
    let offload = args.run.offload_target(config);
    let mut source =
        HttpStreamSource::new(stream_config, stream_credentials, ShutdownFlag::global());
    execute(&mut source, &run, &offload, notifier, progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        stream: StreamArgs,
    }

    #[test]
    fn stream_overrides_fall_back_to_file() {
        let mut config = Config::default();
        config.stream.read_timeout = 30;

        let harness =
            Harness::try_parse_from(["feedline", "--track", "rust", "--max-reconnects", "3"])
                .unwrap();
        let run = harness.stream.run.resolve(&config);
        let stream = harness.stream.stream_config(&config, &run);
        assert_eq!(stream.read_timeout, Duration::from_secs(30));
        assert_eq!(stream.max_reconnects, 3);
        assert_eq!(stream.url, config.stream.url);
        assert_eq!(stream.filter.track, vec!["rust"]);
    }

    #[test]
    fn missing_filter_fails_before_credentials() {
        let dir = tempfile::TempDir::new().unwrap();
        let harness = Harness::try_parse_from([
            "feedline",
            "-o",
            dir.path().to_str().unwrap(),
        ])
        .unwrap();
        let credentials = CredentialProvider::with_env(None, |_| None);
        let progress = std::sync::Arc::new(feedline_core::ProgressContext::hidden());

        let err = run(harness.stream, &Config::default(), &credentials, &progress).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<feedline_core::IngestError>(),
            Some(feedline_core::IngestError::Config(_))
        ));
    }
}
