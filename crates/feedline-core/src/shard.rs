//! Rotating append-only JSONL shard writer

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Default events per shard before the controller rotates.
pub const DEFAULT_SHARD_SIZE: u64 = 50_000;

/// Default shard file name; `{n}` is replaced by the 1-based shard index.
pub const DEFAULT_SHARD_TEMPLATE: &str = "events-shard-{n}.jsonl";

/// Placeholder substituted with the shard index.
pub const SHARD_INDEX_PLACEHOLDER: &str = "{n}";

/// Write buffer per shard (1MB)
const SHARD_BUF_SIZE: usize = 1024 * 1024;

/// A shard that has been flushed, synced and closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedShard {
    pub path: PathBuf,
    pub index: u64,
    pub events: u64,
}

/// Receives shard-completion signals from a [`ShardWriter`].
pub trait ShardListener: Send {
    /// Called once per shard, after its file handle is closed.
    fn handle_shard(&mut self, shard: &CompletedShard);

    /// Called once when the writer closes; may block to drain pending work.
    fn close(&mut self) {}
}

struct ActiveShard {
    writer: BufWriter<File>,
    path: PathBuf,
    index: u64,
    events: u64,
}

/// Writes one JSON payload per line into numbered shard files.
///
/// Pure mechanism: the caller decides when to [`rotate`](ShardWriter::rotate).
pub struct ShardWriter {
    directory: PathBuf,
    template: String,
    index: u64,
    current: Option<ActiveShard>,
    listener: Option<Box<dyn ShardListener>>,
    closed: bool,
}

impl std::fmt::Debug for ShardWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardWriter")
            .field("directory", &self.directory)
            .field("index", &self.index)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ShardWriter {
    pub fn new(directory: impl Into<PathBuf>, template: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            template: template.into(),
            index: 0,
            current: None,
            listener: None,
            closed: false,
        }
    }

    /// Register the receiver of shard-completion signals.
    pub fn with_listener(mut self, listener: Box<dyn ShardListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Index of the active (or last) shard; 0 before the first rotation.
    pub fn shard_index(&self) -> u64 {
        self.index
    }

    pub fn shard_path(&self, index: u64) -> PathBuf {
        self.directory
            .join(self.template.replace(SHARD_INDEX_PLACEHOLDER, &index.to_string()))
    }

    /// Close the active shard (signalling completion) and open the next one.
    pub fn rotate(&mut self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::other("shard writer is closed"));
        }
        self.finish_current()?;

        fs::create_dir_all(&self.directory)?;
        self.index += 1;
        let path = self.shard_path(self.index);
        if path.exists() {
            log::warn!("Overwriting existing shard: {}", path.display());
        }
        let file = File::create(&path)?;
        log::debug!("Opened shard {}: {}", self.index, path.display());
        self.current = Some(ActiveShard {
            writer: BufWriter::with_capacity(SHARD_BUF_SIZE, file),
            path,
            index: self.index,
            events: 0,
        });
        Ok(())
    }

    /// Append `payload` plus a newline to the active shard.
    pub fn write(&mut self, payload: &str) -> io::Result<()> {
        let shard = self
            .current
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no active shard"))?;
        shard.writer.write_all(payload.as_bytes())?;
        shard.writer.write_all(b"\n")?;
        shard.events += 1;
        Ok(())
    }

    /// Flush and close the active shard, then close the listener.
    ///
    /// Idempotent. The listener is closed even if the final flush fails.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.finish_current();
        if let Some(listener) = self.listener.as_mut() {
            listener.close();
        }
        result
    }

    fn finish_current(&mut self) -> io::Result<()> {
        let Some(shard) = self.current.take() else {
            return Ok(());
        };
        let file = shard.writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        log::info!(
            "Shard {} complete: {} events ({})",
            shard.index,
            shard.events,
            shard.path.display()
        );
        if let Some(listener) = self.listener.as_mut() {
            listener.handle_shard(&CompletedShard {
                path: shard.path,
                index: shard.index,
                events: shard.events,
            });
        }
        Ok(())
    }
}

impl Drop for ShardWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Failed to close shard writer: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Default, Clone)]
    struct Recorder {
        shards: Arc<Mutex<Vec<CompletedShard>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl ShardListener for Recorder {
        fn handle_shard(&mut self, shard: &CompletedShard) {
            // File must be complete and readable at signal time
            let content = std::fs::read_to_string(&shard.path).unwrap();
            assert_eq!(content.lines().count() as u64, shard.events);
            self.shards.lock().unwrap().push(shard.clone());
        }

        fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    #[test]
    fn write_before_rotate_fails() {
        let dir = TempDir::new().unwrap();
        let mut w = ShardWriter::new(dir.path(), DEFAULT_SHARD_TEMPLATE);
        let err = w.write("{}").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn rotate_creates_directory_and_numbered_files() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("nested/out");
        let mut w = ShardWriter::new(&out, "part-{n}.jsonl");
        w.rotate().unwrap();
        w.write(r#"{"a":1}"#).unwrap();
        w.rotate().unwrap();
        w.write(r#"{"a":2}"#).unwrap();
        w.close().unwrap();

        assert_eq!(w.shard_index(), 2);
        assert_eq!(
            std::fs::read_to_string(out.join("part-1.jsonl")).unwrap(),
            "{\"a\":1}\n"
        );
        assert_eq!(
            std::fs::read_to_string(out.join("part-2.jsonl")).unwrap(),
            "{\"a\":2}\n"
        );
    }

    #[test]
    fn listener_gets_every_shard_and_close() {
        let dir = TempDir::new().unwrap();
        let recorder = Recorder::default();
        let mut w = ShardWriter::new(dir.path(), DEFAULT_SHARD_TEMPLATE)
            .with_listener(Box::new(recorder.clone()));
        w.rotate().unwrap();
        w.write("1").unwrap();
        w.write("2").unwrap();
        w.rotate().unwrap();
        w.write("3").unwrap();
        assert_eq!(recorder.shards.lock().unwrap().len(), 1);
        w.close().unwrap();

        let shards = recorder.shards.lock().unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].index, 1);
        assert_eq!(shards[0].events, 2);
        assert_eq!(shards[1].index, 2);
        assert_eq!(shards[1].events, 1);
        assert!(*recorder.closed.lock().unwrap());
    }

    #[test]
    fn close_is_idempotent_and_final() {
        let dir = TempDir::new().unwrap();
        let recorder = Recorder::default();
        let mut w = ShardWriter::new(dir.path(), DEFAULT_SHARD_TEMPLATE)
            .with_listener(Box::new(recorder.clone()));
        w.rotate().unwrap();
        w.close().unwrap();
        w.close().unwrap();
        assert_eq!(recorder.shards.lock().unwrap().len(), 1);
        assert!(w.rotate().is_err());
        assert!(w.write("x").is_err());
    }

    #[test]
    fn drop_closes_active_shard() {
        let dir = TempDir::new().unwrap();
        let recorder = Recorder::default();
        {
            let mut w = ShardWriter::new(dir.path(), DEFAULT_SHARD_TEMPLATE)
                .with_listener(Box::new(recorder.clone()));
            w.rotate().unwrap();
            w.write("kept").unwrap();
        }
        assert_eq!(recorder.shards.lock().unwrap().len(), 1);
        let path = dir.path().join("events-shard-1.jsonl");
        assert_eq!(std::fs::read_to_string(path).unwrap(), "kept\n");
    }
}
