//! Replay command - feed a recorded JSONL stream through the pipeline

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Args;

use feedline_core::{CredentialProvider, JsonlSource, SharedProgress, ShutdownFlag};

use super::common::{build_notifier, execute, RunArgs};
use crate::config::Config;

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Recorded stream, one message per line ("-" for stdin)
    pub input: Option<PathBuf>,

    #[command(flatten)]
    pub run: RunArgs,
}

impl ReplayArgs {
    fn input_path(&self) -> Option<PathBuf> {
        self.input.clone().filter(|p| p.as_os_str() != "-")
    }
}

pub fn run(
    args: ReplayArgs,
    config: &Config,
    credentials: &CredentialProvider,
    progress: &SharedProgress,
) -> Result<ExitCode> {
    let run = args.run.resolve(config);
    run.validate_storage()?;

    let input = args.input_path();
    match &input {
        Some(path) => log::info!("Replaying {}", path.display()),
        None => log::info!("Replaying from stdin"),
    }

    let notifier = build_notifier(
        args.run.notify_enabled(config),
        config,
        credentials.notify(),
    );
    let offload = args.run.offload_target(config);
    let mut source = JsonlSource::new(input, ShutdownFlag::global());
    execute(&mut source, &run, &offload, notifier, progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::sync::Arc;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        replay: ReplayArgs,
    }

    fn parse(args: &[&str]) -> ReplayArgs {
        let argv = std::iter::once("feedline").chain(args.iter().copied());
        Harness::try_parse_from(argv).unwrap().replay
    }

    #[test]
    fn dash_means_stdin() {
        assert_eq!(parse(&["-"]).input_path(), None);
        assert_eq!(parse(&[]).input_path(), None);
        assert_eq!(
            parse(&["rec.jsonl"]).input_path(),
            Some(PathBuf::from("rec.jsonl"))
        );
    }

    #[test]
    fn replays_file_into_shards() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("recorded.jsonl");
        let out = dir.path().join("out");
        std::fs::write(
            &input,
            concat!(
                r#"{"id_str":"1","text":"a"}"#, "\n",
                r#"{"id_str":"2","text":"b"}"#, "\n",
                r#"{"id_str":"1","text":"a"}"#, "\n",
                r#"{"id_str":"3","text":"c"}"#, "\n",
            ),
        )
        .unwrap();

        let args = parse(&[
            input.to_str().unwrap(),
            "-o",
            out.to_str().unwrap(),
            "--shard-size",
            "2",
            "--no-notify",
        ]);
        let credentials = CredentialProvider::with_env(None, |_| None);
        let progress = Arc::new(feedline_core::ProgressContext::hidden());

        run(args, &Config::default(), &credentials, &progress).unwrap();

        let first = std::fs::read_to_string(out.join("events-shard-1.jsonl")).unwrap();
        let second = std::fs::read_to_string(out.join("events-shard-2.jsonl")).unwrap();
        assert_eq!(first.lines().count(), 2);
        assert_eq!(second.lines().count(), 1);
    }
}
