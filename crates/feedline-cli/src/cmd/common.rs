//! Shared run pipeline: flags → run config → writer/mover/notifier → controller

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgGroup, Args};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};

use feedline_core::elapsed::Elapsed;
use feedline_core::progress::fmt_num;
use feedline_core::{
    Controller, DisabledNotifier, FilterParams, FsStore, Notifier, NotifyCredentials, OffloadMover,
    RemoteStore, RunConfig, RunSummary, ShardWriter, SharedProgress, SourceExit, StreamSource,
    WebhookNotifier,
};
use feedline_s3::{S3Config, S3Store};

use crate::config::Config;

/// Flags shared by every command that runs an ingestion.
#[derive(Args, Debug, Clone, Default)]
#[command(group(ArgGroup::new("interval").args(["seconds", "minutes", "hours"])))]
pub struct RunArgs {
    /// Account identifiers to follow (comma-separated or repeated)
    #[arg(long, value_delimiter = ',')]
    pub follow: Vec<String>,

    /// Search terms to track (comma-separated or repeated)
    #[arg(long, value_delimiter = ',')]
    pub track: Vec<String>,

    /// Language codes (comma-separated or repeated)
    #[arg(long = "language", value_delimiter = ',')]
    pub languages: Vec<String>,

    /// Bounding box `lon,lat,lon,lat` (repeat for several)
    #[arg(long = "location")]
    pub locations: Vec<String>,

    /// Output directory for shards
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Notify every N seconds
    #[arg(short, long)]
    pub seconds: Option<u64>,

    /// Notify every N minutes
    #[arg(short, long)]
    pub minutes: Option<u64>,

    /// Notify every N hours
    #[arg(long)]
    pub hours: Option<u64>,

    /// Notify every N written events
    #[arg(short = 'n', long)]
    pub notify_every: Option<u64>,

    /// Disable the notification transport (progress is still logged)
    #[arg(long)]
    pub no_notify: bool,

    /// Offload completed shards to this S3 bucket
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// Key prefix for offloaded shards (default: run_<timestamp>)
    #[arg(long)]
    pub s3_root: Option<String>,

    /// Events per shard
    #[arg(long)]
    pub shard_size: Option<u64>,
}

impl RunArgs {
    /// Notify interval in seconds from whichever unit flag was given.
    pub fn notify_seconds(&self) -> Option<u64> {
        self.seconds
            .or(self.minutes.map(|m| m.saturating_mul(60)))
            .or(self.hours.map(|h| h.saturating_mul(3600)))
    }

    pub fn notify_enabled(&self, config: &Config) -> bool {
        !self.no_notify && config.notify.enabled
    }

    /// Merge flags over file settings. Flags win.
    pub fn resolve(&self, config: &Config) -> RunConfig {
        fn pick(cli: &[String], file: &[String]) -> Vec<String> {
            if cli.is_empty() {
                file.to_vec()
            } else {
                cli.to_vec()
            }
        }

        RunConfig {
            filter: FilterParams {
                follow: pick(&self.follow, &config.filter.follow),
                track: pick(&self.track, &config.filter.track),
                languages: pick(&self.languages, &config.filter.languages),
                locations: pick(&self.locations, &config.filter.locations),
            },
            output_dir: self.output_dir.clone().or_else(|| config.output.dir.clone()),
            shard_size: self.shard_size.unwrap_or(config.output.shard_size),
            shard_template: config.output.shard_template.clone(),
            dedup_capacity: config.dedup.capacity,
            notify_count: self.notify_every.or(config.notify.every),
            notify_seconds: self.notify_seconds().or(config.notify.seconds),
            log_interval: Duration::from_secs(config.notify.log_seconds),
            milestone: config.notify.milestone,
        }
    }

    pub fn offload_target(&self, config: &Config) -> OffloadTarget {
        let root = self.s3_root.clone().or_else(|| config.offload.s3_root.clone());
        let bucket = self
            .s3_bucket
            .clone()
            .or_else(|| config.offload.s3_bucket.clone());
        match (bucket, &config.offload.local_dir) {
            (Some(bucket), local) => {
                if local.is_some() {
                    log::warn!("Both s3_bucket and offload.local_dir set; using S3");
                }
                OffloadTarget::S3 {
                    config: S3Config {
                        bucket,
                        region: config.offload.region.clone(),
                        endpoint: config.offload.endpoint.clone(),
                        path_style: config.offload.path_style,
                    },
                    root,
                }
            }
            (None, Some(dir)) => OffloadTarget::Local {
                dir: dir.clone(),
                root,
            },
            (None, None) => OffloadTarget::Disabled,
        }
    }
}

/// Where completed shards go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffloadTarget {
    Disabled,
    S3 { config: S3Config, root: Option<String> },
    Local { dir: PathBuf, root: Option<String> },
}

impl OffloadTarget {
    pub fn describe(&self) -> String {
        match self {
            Self::Disabled => "disabled".to_string(),
            Self::S3 { config, .. } => format!("s3://{}", config.bucket),
            Self::Local { dir, .. } => dir.display().to_string(),
        }
    }

    fn store(&self) -> Option<(Arc<dyn RemoteStore>, Option<String>)> {
        match self {
            Self::Disabled => None,
            Self::S3 { config, root } => Some((
                Arc::new(S3Store::new(config.clone())) as Arc<dyn RemoteStore>,
                root.clone(),
            )),
            Self::Local { dir, root } => Some((
                Arc::new(FsStore::new(dir)) as Arc<dyn RemoteStore>,
                root.clone(),
            )),
        }
    }
}

/// Pick the notification transport.
pub fn build_notifier(
    enabled: bool,
    config: &Config,
    credentials: Option<NotifyCredentials>,
) -> Box<dyn Notifier> {
    if !enabled {
        log::info!("Notifications disabled; progress goes to the log only");
        return Box::new(DisabledNotifier::new());
    }
    match &config.notify.webhook_url {
        Some(url) => {
            log::info!("Sending notifications to {url}");
            Box::new(WebhookNotifier::new(
                url.clone(),
                config.notify.default_subject.clone(),
                credentials,
            ))
        }
        None => {
            log::warn!("No notify.webhook_url configured; progress goes to the log only");
            Box::new(DisabledNotifier::new())
        }
    }
}

/// Drive `source` into a fresh controller and report the outcome.
pub fn execute(
    source: &mut dyn StreamSource,
    run: &RunConfig,
    offload: &OffloadTarget,
    notifier: Box<dyn Notifier>,
    progress: &SharedProgress,
) -> Result<ExitCode> {
    let output_dir = run.output_dir()?.clone();
    let mut writer = ShardWriter::new(&output_dir, run.shard_template.clone());
    if let Some((store, root)) = offload.store() {
        let mover = OffloadMover::new(store, &output_dir, root)
            .with_context(|| format!("failed to prepare offload to {}", offload.describe()))?;
        writer = writer.with_listener(Box::new(mover));
    }

    let mut controller = Controller::new(run.controller_config(), writer, notifier)
        .with_context(|| format!("failed to open first shard in {}", output_dir.display()))?
        .with_progress(progress.counter_line(source.name()));

    let outcome = source.run(&mut controller);
    let summary = match &outcome {
        Ok(SourceExit::Interrupted) => {
            log::warn!("Interrupted; closing the current shard");
            controller.interrupt()?
        }
        Ok(exit) => {
            log::info!("Source finished ({exit:?})");
            controller.close()?
        }
        Err(e) => {
            controller.abort(e.termination_reason(), &e.to_string());
            controller.close()?
        }
    };
    if let Err(e) = &outcome {
        log::error!("Run failed: {e}");
    }

    report(&summary, source, progress);
    Ok(ExitCode::from(summary.reason.exit_code()))
}

fn report(summary: &RunSummary, source: &dyn StreamSource, progress: &SharedProgress) {
    if !progress.is_tty() {
        summary.log();
        return;
    }
    let stats = source.stats();
    print_summary(
        "Run",
        &[
            ("Outcome", summary.reason.to_string()),
            ("Events written", fmt_num(summary.total_written)),
            ("Duplicates dropped", fmt_num(summary.duplicates)),
            ("Shards", summary.shards.to_string()),
            ("Notifications sent", summary.notifications_sent.to_string()),
            (
                "Upstream errors",
                format!(
                    "{} rate-limit, {} other",
                    summary.rate_limit_errors, summary.other_errors
                ),
            ),
            ("Lines read", fmt_num(stats.lines)),
            ("Unparsed lines", fmt_num(stats.parse_errors)),
            ("Reconnects", stats.reconnects.to_string()),
            ("Elapsed", Elapsed::from(summary.elapsed).to_string()),
        ],
    );
}

/// Print a key-value summary table on stderr
pub fn print_summary(title: &str, rows: &[(&str, String)]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new(title).fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);
    for (label, value) in rows {
        table.add_row(vec![Cell::new(label), Cell::new(value)]);
    }
    eprintln!("\n{table}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        run: RunArgs,
    }

    fn parse(args: &[&str]) -> Result<RunArgs, clap::Error> {
        let argv = std::iter::once("feedline").chain(args.iter().copied());
        Harness::try_parse_from(argv).map(|h| h.run)
    }

    #[test]
    fn interval_units_are_exclusive() {
        assert!(parse(&["-s", "10", "-m", "1"]).is_err());
        assert!(parse(&["--minutes", "1", "--hours", "1"]).is_err());
        assert_eq!(parse(&["-m", "2"]).unwrap().notify_seconds(), Some(120));
        assert_eq!(parse(&["--hours", "1"]).unwrap().notify_seconds(), Some(3600));
    }

    #[test]
    fn flags_override_file() {
        let mut config = Config::default();
        config.filter.track = vec!["from-file".into()];
        config.filter.follow = vec!["42".into()];
        config.output.dir = Some(PathBuf::from("/file/out"));
        config.notify.every = Some(10);

        let args = parse(&["--track", "a,b", "-o", "/cli/out", "--shard-size", "7"]).unwrap();
        let run = args.resolve(&config);
        assert_eq!(run.filter.track, vec!["a", "b"]);
        assert_eq!(run.filter.follow, vec!["42"]);
        assert_eq!(run.output_dir, Some(PathBuf::from("/cli/out")));
        assert_eq!(run.shard_size, 7);
        assert_eq!(run.notify_count, Some(10));
    }

    #[test]
    fn no_notify_wins_over_file() {
        let config = Config::default();
        assert!(parse(&[]).unwrap().notify_enabled(&config));
        assert!(!parse(&["--no-notify"]).unwrap().notify_enabled(&config));
    }

    #[test]
    fn offload_target_selection() {
        let mut config = Config::default();
        assert_eq!(
            parse(&[]).unwrap().offload_target(&config),
            OffloadTarget::Disabled
        );

        config.offload.local_dir = Some(PathBuf::from("/mnt/archive"));
        assert_eq!(
            parse(&["--s3-root", "nightly"]).unwrap().offload_target(&config),
            OffloadTarget::Local {
                dir: PathBuf::from("/mnt/archive"),
                root: Some("nightly".into()),
            }
        );

        let target = parse(&["--s3-bucket", "archive"])
            .unwrap()
            .offload_target(&config);
        assert_eq!(target.describe(), "s3://archive");
    }

    #[test]
    fn disabled_transport_without_webhook() {
        let config = Config::default();
        let notifier = build_notifier(true, &config, None);
        assert_eq!(notifier.default_subject(), "Message from feedline");
    }
}
