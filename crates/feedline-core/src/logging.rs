//! Logging with indicatif integration and an optional operational log file

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use indicatif::MultiProgress;

/// ANSI color code and padded label for a log level.
fn level_style(level: log::Level, color: bool) -> (&'static str, &'static str, &'static str) {
    let label = match level {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN ",
        log::Level::Info => "INFO ",
        log::Level::Debug => "DEBUG",
        log::Level::Trace => "TRACE",
    };
    if !color {
        return ("", label, "");
    }
    let ansi = match level {
        log::Level::Error => "\x1b[31m",
        log::Level::Warn => "\x1b[33m",
        log::Level::Info => "\x1b[32m",
        log::Level::Debug => "\x1b[36m",
        log::Level::Trace => "\x1b[35m",
    };
    (ansi, label, "\x1b[0m")
}

/// One line of the operational log file: local timestamp, level, target, message.
fn file_line(record: &log::Record) -> String {
    let (_, label, _) = level_style(record.level(), false);
    format!(
        "{} [{label}] {}: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        record.target(),
        record.args()
    )
}

/// Logger that prints through indicatif (TTY) or env_logger (non-TTY) and
/// optionally duplicates every record into a log file.
pub struct FeedlineLogger {
    inner: env_logger::Logger,
    multi: Option<MultiProgress>,
    file: Option<Mutex<File>>,
}

impl FeedlineLogger {
    pub fn new(inner: env_logger::Logger, multi: Option<MultiProgress>, file: Option<File>) -> Self {
        Self {
            inner,
            multi,
            file: file.map(Mutex::new),
        }
    }
}

impl log::Log for FeedlineLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if !self.inner.enabled(record.metadata()) {
            return;
        }
        match &self.multi {
            Some(multi) => {
                let (pre, label, post) = level_style(record.level(), true);
                let line = format!("[{pre}{label}{post}] {}", record.args());
                multi.suspend(|| eprintln!("{line}"));
            }
            None => self.inner.log(record),
        }
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = writeln!(f, "{}", file_line(record));
            }
        }
    }

    fn flush(&self) {
        self.inner.flush();
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = f.flush();
            }
        }
    }
}

/// Initialize logging.
///
/// `multi` enables TTY mode (lines printed above the live spinner);
/// `log_file` is opened for appending and receives every record.
pub fn init_logging(
    quiet: bool,
    debug: bool,
    multi: Option<&MultiProgress>,
    log_file: Option<&Path>,
) -> io::Result<()> {
    let default_level = if debug {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level));
    if multi.is_none() {
        // Non-TTY: no ANSI colors, plain labels for log aggregation
        builder.format(|buf, record| {
            let (_, label, _) = level_style(record.level(), false);
            writeln!(buf, "[{label}] {}", record.args())
        });
    }
    let logger = builder.build();
    let max_level = logger.filter();

    let file = log_file
        .map(|path| OpenOptions::new().create(true).append(true).open(path))
        .transpose()?;

    log::set_boxed_logger(Box::new(FeedlineLogger::new(logger, multi.cloned(), file)))
        .map_err(|e| io::Error::other(e.to_string()))?;
    log::set_max_level(max_level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_labels_have_no_ansi() {
        let (pre, label, post) = level_style(log::Level::Warn, false);
        assert_eq!((pre, label, post), ("", "WARN ", ""));
    }

    #[test]
    fn file_line_carries_level_and_target() {
        let line = file_line(
            &log::Record::builder()
                .args(format_args!("shard rotated"))
                .level(log::Level::Info)
                .target("feedline_core::controller")
                .build(),
        );
        assert!(line.ends_with("[INFO ] feedline_core::controller: shard rotated"));
    }
}
