//! Stream source adapters and the listener seam they drive.
//!
//! A source owns the transport (file, stdin, HTTP connection) and its
//! reconnection policy. It hands each delivered event and each error code to
//! a [`StreamListener`], which is implemented by the ingestion controller.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use crate::error::IngestError;
use crate::event::{Event, StreamMessage};
use crate::shutdown::ShutdownFlag;
use crate::stream::StreamError;

/// Initial capacity for the per-line read buffer
const LINE_BUF_CAPACITY: usize = 8192;

/// Callback target invoked by a stream source.
pub trait StreamListener {
    /// Handle one delivered event. An error is fatal for the run.
    fn on_event(&mut self, event: Event) -> Result<(), IngestError>;

    /// Handle an out-of-band error code. `false` tells the source to disconnect.
    fn on_error(&mut self, code: u16) -> bool;
}

/// How a source stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceExit {
    /// Input ended (file EOF)
    Exhausted,
    /// Listener asked to disconnect
    Stopped,
    /// Shutdown flag observed
    Interrupted,
}

/// Counters kept by a source across reconnects.
#[derive(Debug, Clone, Default)]
pub struct SourceStats {
    /// Non-blank lines read
    pub lines: u64,
    /// Lines delivered to the listener as events
    pub events: u64,
    /// Delete/limit/warning/disconnect notices
    pub notices: u64,
    /// Lines that were not valid JSON or not understood
    pub parse_errors: u64,
    pub reconnects: u32,
}

/// A producer of stream messages.
pub trait StreamSource {
    /// Human-readable name for logs.
    fn name(&self) -> &'static str;

    /// Drive `listener` until the input ends, the listener stops, or shutdown.
    fn run(&mut self, listener: &mut dyn StreamListener) -> Result<SourceExit, IngestError>;

    fn stats(&self) -> &SourceStats;
}

/// Route one parsed message. Returns `false` when the listener wants to stop.
pub fn dispatch(
    message: StreamMessage,
    listener: &mut dyn StreamListener,
    stats: &mut SourceStats,
) -> Result<bool, IngestError> {
    match message {
        StreamMessage::Event(event) => {
            stats.events += 1;
            listener.on_event(event)?;
            Ok(true)
        }
        StreamMessage::Delete => {
            stats.notices += 1;
            log::debug!("Deletion notice received");
            Ok(true)
        }
        StreamMessage::Limit { undelivered } => {
            stats.notices += 1;
            log::warn!("Limit notice: {undelivered} matching events were not delivered");
            Ok(true)
        }
        StreamMessage::Warning(message) => {
            stats.notices += 1;
            log::warn!("Upstream warning: {message}");
            Ok(true)
        }
        StreamMessage::Disconnect { code, reason } => {
            stats.notices += 1;
            log::warn!("Upstream disconnect notice (code {code}): {reason}");
            Ok(listener.on_error(code))
        }
        StreamMessage::Error(code) => Ok(listener.on_error(code)),
        StreamMessage::KeepAlive => Ok(true),
        StreamMessage::Unknown => {
            stats.parse_errors += 1;
            log::debug!("Ignoring unrecognised stream message");
            Ok(true)
        }
    }
}

/// Read line-delimited messages and dispatch each one.
///
/// Read failures come back as `IngestError::Stream`; listener errors are
/// passed through unchanged. Lines that are not UTF-8 or not JSON are counted
/// as parse errors and skipped.
pub fn process_lines<R: BufRead>(
    mut reader: R,
    listener: &mut dyn StreamListener,
    stats: &mut SourceStats,
    shutdown: ShutdownFlag,
) -> Result<SourceExit, IngestError> {
    let mut buf = Vec::with_capacity(LINE_BUF_CAPACITY);
    loop {
        if shutdown.is_requested() {
            return Ok(SourceExit::Interrupted);
        }
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| IngestError::Stream(StreamError::Io(e)))?;
        if n == 0 {
            return Ok(SourceExit::Exhausted);
        }
        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(e) => {
                stats.lines += 1;
                stats.parse_errors += 1;
                log::debug!("Skipping line {} with invalid UTF-8: {e}", stats.lines);
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        stats.lines += 1;

        match StreamMessage::parse(line) {
            Ok(message) => {
                if !dispatch(message, listener, stats)? {
                    return Ok(SourceExit::Stopped);
                }
            }
            Err(e) => {
                stats.parse_errors += 1;
                log::debug!("Skipping unparseable line {}: {e}", stats.lines);
            }
        }
    }
}

/// Replays a recorded stream: one JSON message per line, from a file or stdin.
///
/// Recorded error codes are written as `{"error": <code>}` lines.
pub struct JsonlSource {
    input: Option<PathBuf>,
    shutdown: ShutdownFlag,
    stats: SourceStats,
}

impl JsonlSource {
    /// `None` reads standard input.
    pub fn new(input: Option<PathBuf>, shutdown: ShutdownFlag) -> Self {
        Self {
            input,
            shutdown,
            stats: SourceStats::default(),
        }
    }

    fn open(&self) -> io::Result<Box<dyn BufRead>> {
        Ok(match &self.input {
            Some(path) => Box::new(BufReader::new(File::open(path)?)),
            None => Box::new(BufReader::new(io::stdin())),
        })
    }
}

impl StreamSource for JsonlSource {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn run(&mut self, listener: &mut dyn StreamListener) -> Result<SourceExit, IngestError> {
        match &self.input {
            Some(path) => log::info!("Replaying stream from {}", path.display()),
            None => log::info!("Replaying stream from stdin"),
        }
        let reader = self
            .open()
            .map_err(|e| IngestError::Stream(StreamError::Io(e)))?;
        process_lines(reader, listener, &mut self.stats, self.shutdown)
    }

    fn stats(&self) -> &SourceStats {
        &self.stats
    }
}
