//! Background copy-verify-delete of completed shards to durable storage
//!
//! Each completed shard is moved on its own thread:
//! upload → compare local size with the remote object's size → delete the
//! local copy only when they match. [`OffloadMover::close`] joins every
//! outstanding upload so the process never exits mid-transfer.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::shard::{CompletedShard, ShardListener};

/// Error from a remote store operation.
#[derive(Debug)]
pub enum OffloadError {
    Io(io::Error),
    Remote(String),
}

impl std::fmt::Display for OffloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO: {e}"),
            Self::Remote(msg) => write!(f, "remote: {msg}"),
        }
    }
}

impl std::error::Error for OffloadError {}

impl From<io::Error> for OffloadError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Durable object storage addressed by string keys.
///
/// Methods block; the mover calls them from its upload threads.
pub trait RemoteStore: Send + Sync {
    /// Human-readable location of `key` for logs (e.g. `s3://bucket/key`).
    fn describe(&self, key: &str) -> String;

    /// Create the bucket/container if absent. Called once per mover.
    fn ensure_container(&self) -> Result<(), OffloadError>;

    fn put_file(&self, local: &Path, key: &str) -> Result<(), OffloadError>;

    /// Size in bytes the store reports for `key`.
    fn object_size(&self, key: &str) -> Result<u64, OffloadError>;
}

/// Result of one finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffloadOutcome {
    /// Sizes matched; local copy deleted
    Moved {
        local: PathBuf,
        key: String,
        bytes: u64,
    },
    /// Sizes differed; local copy kept
    Retained {
        local: PathBuf,
        key: String,
        local_bytes: u64,
        remote_bytes: u64,
    },
}

/// Tally of finished uploads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OffloadSummary {
    pub moved: usize,
    pub retained: usize,
    pub failed: usize,
}

impl OffloadSummary {
    pub fn total(&self) -> usize {
        self.moved + self.retained + self.failed
    }
}

/// Run namespace derived from local time, e.g. `run_2024-05-01_13:45:00`.
pub fn default_run_root() -> String {
    chrono::Local::now()
        .format("run_%Y-%m-%d_%H:%M:%S")
        .to_string()
}

/// Upload `local` as `key`, verify the size, and delete `local` on match.
pub fn move_file(
    store: &dyn RemoteStore,
    local: &Path,
    key: &str,
) -> Result<OffloadOutcome, OffloadError> {
    let target = store.describe(key);
    log::info!("Uploading {} to {target}", local.display());
    store.put_file(local, key)?;

    let local_bytes = fs::metadata(local)?.len();
    let remote_bytes = store.object_size(key)?;
    if local_bytes != remote_bytes {
        log::error!(
            "{} failed to upload to {target}: expected {local_bytes}B, remote has {remote_bytes}B. \
             Local copy will not be deleted.",
            local.display()
        );
        return Ok(OffloadOutcome::Retained {
            local: local.to_path_buf(),
            key: key.to_string(),
            local_bytes,
            remote_bytes,
        });
    }

    log::info!(
        "Uploaded {} ({local_bytes}B); deleting local copy",
        local.display()
    );
    fs::remove_file(local)?;
    Ok(OffloadOutcome::Moved {
        local: local.to_path_buf(),
        key: key.to_string(),
        bytes: local_bytes,
    })
}

type UploadHandle = JoinHandle<Result<OffloadOutcome, OffloadError>>;

/// Moves completed shards to a [`RemoteStore`] on independent threads.
pub struct OffloadMover {
    store: Arc<dyn RemoteStore>,
    base_dir: PathBuf,
    run_root: String,
    uploads: Vec<UploadHandle>,
    summary: OffloadSummary,
}

impl std::fmt::Debug for OffloadMover {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadMover")
            .field("base_dir", &self.base_dir)
            .field("run_root", &self.run_root)
            .field("pending", &self.uploads.len())
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}

impl OffloadMover {
    /// Create a mover for shards under `base_dir`.
    ///
    /// Ensures the remote container exists. `run_root` defaults to
    /// [`default_run_root`] and stays fixed for the mover's lifetime.
    pub fn new(
        store: Arc<dyn RemoteStore>,
        base_dir: impl Into<PathBuf>,
        run_root: Option<String>,
    ) -> Result<Self, OffloadError> {
        store.ensure_container()?;
        let run_root = run_root.unwrap_or_else(default_run_root);
        log::info!("Offloading shards to {}", store.describe(&run_root));
        Ok(Self {
            store,
            base_dir: base_dir.into(),
            run_root,
            uploads: Vec::new(),
            summary: OffloadSummary::default(),
        })
    }

    /// Remote key mirroring the path of `local` relative to the output dir.
    pub fn remote_key(&self, local: &Path) -> String {
        let relative = local
            .strip_prefix(&self.base_dir)
            .ok()
            .map(Path::to_path_buf)
            .or_else(|| local.file_name().map(PathBuf::from))
            .unwrap_or_else(|| local.to_path_buf());
        let relative: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect();
        format!("{}/{}", self.run_root, relative.join("/"))
    }

    /// Start moving `local` in the background. Never blocks on the upload.
    pub fn enqueue(&mut self, local: PathBuf) -> io::Result<()> {
        self.reap_finished();

        let key = self.remote_key(&local);
        let store = Arc::clone(&self.store);
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let handle = std::thread::Builder::new()
            .name(format!("uploader-{name}"))
            .spawn(move || {
                let result = move_file(store.as_ref(), &local, &key);
                if let Err(e) = &result {
                    log::error!("Upload of {} failed: {e}", local.display());
                }
                result
            })?;
        self.uploads.push(handle);
        Ok(())
    }

    /// Uploads not yet joined.
    pub fn pending(&self) -> usize {
        self.uploads.len()
    }

    /// Wait for every outstanding upload and return the final tally.
    pub fn close(&mut self) -> OffloadSummary {
        let pending = std::mem::take(&mut self.uploads);
        if !pending.is_empty() {
            log::info!("Waiting for {} upload(s) to finish", pending.len());
        }
        for handle in pending {
            self.record(handle.join());
        }
        log::info!(
            "Offload finished: {} moved, {} retained, {} failed",
            self.summary.moved,
            self.summary.retained,
            self.summary.failed
        );
        self.summary
    }

    fn reap_finished(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.uploads)
            .into_iter()
            .partition(|h| h.is_finished());
        self.uploads = running;
        for handle in finished {
            self.record(handle.join());
        }
    }

    fn record(&mut self, joined: std::thread::Result<Result<OffloadOutcome, OffloadError>>) {
        match joined {
            Ok(Ok(OffloadOutcome::Moved { .. })) => self.summary.moved += 1,
            Ok(Ok(OffloadOutcome::Retained { .. })) => self.summary.retained += 1,
            Ok(Err(_)) => self.summary.failed += 1,
            Err(_) => {
                log::error!("Uploader thread panicked");
                self.summary.failed += 1;
            }
        }
    }
}

impl ShardListener for OffloadMover {
    fn handle_shard(&mut self, shard: &CompletedShard) {
        if let Err(e) = self.enqueue(shard.path.clone()) {
            log::error!(
                "Cannot start upload of {}: {e}. Local copy kept.",
                shard.path.display()
            );
            self.summary.failed += 1;
        }
    }

    fn close(&mut self) {
        OffloadMover::close(self);
    }
}

/// [`RemoteStore`] backed by a directory (e.g. a mounted network volume).
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl RemoteStore for FsStore {
    fn describe(&self, key: &str) -> String {
        self.object_path(key).display().to_string()
    }

    fn ensure_container(&self) -> Result<(), OffloadError> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    fn put_file(&self, local: &Path, key: &str) -> Result<(), OffloadError> {
        let dest = self.object_path(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(local, &dest)?;
        Ok(())
    }

    fn object_size(&self, key: &str) -> Result<u64, OffloadError> {
        Ok(fs::metadata(self.object_path(key))?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Store that accepts uploads and reports a fixed size skew.
    struct SkewedStore {
        skew: u64,
        puts: Mutex<Vec<String>>,
    }

    impl RemoteStore for SkewedStore {
        fn describe(&self, key: &str) -> String {
            format!("mem://{key}")
        }
        fn ensure_container(&self) -> Result<(), OffloadError> {
            Ok(())
        }
        fn put_file(&self, _local: &Path, key: &str) -> Result<(), OffloadError> {
            self.puts.lock().unwrap().push(key.to_string());
            Ok(())
        }
        fn object_size(&self, _key: &str) -> Result<u64, OffloadError> {
            Ok(10 + self.skew)
        }
    }

    fn shard_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let p = dir.join(name);
        fs::write(&p, content).unwrap();
        p
    }

    #[test]
    fn matching_size_deletes_local() {
        let dir = TempDir::new().unwrap();
        let store = SkewedStore {
            skew: 0,
            puts: Mutex::default(),
        };
        let local = shard_file(dir.path(), "s-1.jsonl", b"0123456789");
        let outcome = move_file(&store, &local, "run/s-1.jsonl").unwrap();
        assert!(matches!(outcome, OffloadOutcome::Moved { bytes: 10, .. }));
        assert!(!local.exists());
    }

    #[test]
    fn mismatched_size_keeps_local() {
        let dir = TempDir::new().unwrap();
        let store = SkewedStore {
            skew: 3,
            puts: Mutex::default(),
        };
        let local = shard_file(dir.path(), "s-1.jsonl", b"0123456789");
        let outcome = move_file(&store, &local, "run/s-1.jsonl").unwrap();
        assert_eq!(
            outcome,
            OffloadOutcome::Retained {
                local: local.clone(),
                key: "run/s-1.jsonl".to_string(),
                local_bytes: 10,
                remote_bytes: 13,
            }
        );
        assert!(local.exists());
    }

    #[test]
    fn remote_key_mirrors_relative_path() {
        let dir = TempDir::new().unwrap();
        let mover = OffloadMover::new(
            Arc::new(FsStore::new(dir.path().join("remote"))),
            "/data/out",
            Some("run_x".to_string()),
        )
        .unwrap();
        assert_eq!(
            mover.remote_key(Path::new("/data/out/sub/events-shard-3.jsonl")),
            "run_x/sub/events-shard-3.jsonl"
        );
        // Outside the base dir: fall back to the file name
        assert_eq!(
            mover.remote_key(Path::new("/elsewhere/a.jsonl")),
            "run_x/a.jsonl"
        );
    }

    #[test]
    fn default_run_root_shape() {
        let root = default_run_root();
        assert!(root.starts_with("run_"));
        assert_eq!(root.len(), "run_2024-01-01_00:00:00".len());
    }

    #[test]
    fn fs_store_moves_and_close_waits() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        let remote = dir.path().join("remote");
        fs::create_dir_all(&out).unwrap();

        let mut mover =
            OffloadMover::new(Arc::new(FsStore::new(&remote)), &out, Some("run_t".into()))
                .unwrap();
        let a = shard_file(&out, "a.jsonl", b"{\"id\":1}\n");
        let b = shard_file(&out, "b.jsonl", b"{\"id\":2}\n{\"id\":3}\n");
        mover.enqueue(a.clone()).unwrap();
        mover.enqueue(b.clone()).unwrap();

        let summary = mover.close();
        assert_eq!(summary.moved, 2);
        assert_eq!(mover.pending(), 0);
        assert!(!a.exists());
        assert!(!b.exists());
        assert_eq!(
            fs::read_to_string(remote.join("run_t/b.jsonl")).unwrap(),
            "{\"id\":2}\n{\"id\":3}\n"
        );
    }

    #[test]
    fn failed_upload_counted_and_local_kept() {
        let dir = TempDir::new().unwrap();
        let mut mover = OffloadMover::new(
            Arc::new(FsStore::new(dir.path().join("remote"))),
            dir.path(),
            Some("run".into()),
        )
        .unwrap();
        mover.enqueue(dir.path().join("missing.jsonl")).unwrap();
        let summary = mover.close();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total(), 1);
    }
}
