//! feedline - streaming ingestion controller
//!
//! Collects a filtered event stream into rotating JSONL shards, drops
//! recently seen events, moves completed shards to object storage and
//! sends progress notifications.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod cmd;
mod config;

use config::Config;
use feedline_core::credentials::default_credentials_path;
use feedline_core::{shutdown_flag, CredentialProvider, IngestError};

/// Exit status for invalid configuration
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "feedline")]
#[command(about = "Streaming ingestion into rotating JSONL shards")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Only log warnings and errors
    #[arg(long, global = true)]
    quiet: bool,

    /// Config file path (default: ./feedline.toml or ~/.config/feedline/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Credentials file (default: ~/.config/feedline/credentials.toml)
    #[arg(long, global = true)]
    credentials: Option<PathBuf>,

    /// Also append log lines to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Collect from the live filter stream
    Stream(cmd::stream::StreamArgs),
    /// Run a recorded JSONL stream through the pipeline
    Replay(cmd::replay::ReplayArgs),
    /// Show current configuration
    Config,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e:#}");
            eprintln!("Error: {e:#}");
            let is_config = e.chain().any(|cause| {
                matches!(
                    cause.downcast_ref::<IngestError>(),
                    Some(IngestError::Config(_))
                )
            });
            if is_config {
                ExitCode::from(EXIT_CONFIG)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    let progress = Arc::new(feedline_core::ProgressContext::new());

    // Logging:
    //   TTY:     warn unless --debug, the counter line shows activity
    //   non-TTY: info unless --quiet, logs are the only progress indicator
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    let quiet = cli.quiet || (is_tty && !cli.debug);
    feedline_core::init_logging(quiet, cli.debug, multi, cli.log_file.as_deref())
        .context("failed to initialise logging")?;

    setup_signal_handler()?;

    let config = if let Some(path) = &cli.config {
        Config::from_file(path)?
    } else {
        Config::load()?
    };
    let credentials = CredentialProvider::new(cli.credentials.or_else(default_credentials_path));

    match cli.command {
        Command::Stream(args) => cmd::stream::run(args, &config, &credentials, &progress),
        Command::Replay(args) => cmd::replay::run(args, &config, &credentials, &progress),
        Command::Config => {
            print_config(&config);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_config(config: &Config) {
    let or_unset = |v: Option<String>| v.unwrap_or_else(|| "not set".to_string());
    let list = |v: &[String]| {
        if v.is_empty() {
            "-".to_string()
        } else {
            v.join(", ")
        }
    };

    cmd::common::print_summary(
        "Setting",
        &[
            ("Follow", list(&config.filter.follow)),
            ("Track", list(&config.filter.track)),
            ("Languages", list(&config.filter.languages)),
            ("Locations", list(&config.filter.locations)),
            (
                "Output directory",
                or_unset(config.output.dir.as_ref().map(|d| d.display().to_string())),
            ),
            ("Shard size", config.output.shard_size.to_string()),
            ("Shard template", config.output.shard_template.clone()),
            ("Dedup capacity", config.dedup.capacity.to_string()),
            (
                "Notify every",
                or_unset(config.notify.every.map(|n| format!("{n} events"))),
            ),
            (
                "Notify interval",
                or_unset(config.notify.seconds.map(|s| format!("{s}s"))),
            ),
            ("Log interval", format!("{}s", config.notify.log_seconds)),
            (
                "Webhook",
                if config.notify.webhook_url.is_some() {
                    "configured".to_string()
                } else {
                    "not set".to_string()
                },
            ),
            ("S3 bucket", or_unset(config.offload.s3_bucket.clone())),
            (
                "Local offload",
                or_unset(
                    config
                        .offload
                        .local_dir
                        .as_ref()
                        .map(|d| d.display().to_string()),
                ),
            ),
            ("Stream URL", config.stream.url.clone()),
            ("Read timeout", format!("{}s", config.stream.read_timeout)),
            ("Max reconnects", config.stream.max_reconnects.to_string()),
        ],
    );
}

fn setup_signal_handler() -> Result<()> {
    // First signal: request graceful shutdown
    // Second signal: force exit
    // SAFETY: AtomicBool::swap and process::exit are async-signal-safe
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGTERM, || {
            if shutdown_flag().swap(true, Ordering::Relaxed) {
                std::process::exit(130);
            }
        })
        .context("failed to register SIGTERM handler")?;
        signal_hook::low_level::register(signal_hook::consts::SIGINT, || {
            if shutdown_flag().swap(true, Ordering::Relaxed) {
                std::process::exit(130);
            }
        })
        .context("failed to register SIGINT handler")?;
    }
    Ok(())
}
