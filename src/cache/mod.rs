//! LRU-by-mtime file cache for one managed directory.
//!
//! Files are staged into the directory through [`FileManager::sync_file`],
//! which serializes concurrent calls per filename, skips files already on
//! disk, and keeps the directory under a byte budget by evicting the oldest
//! files first. The directory itself is the only persisted state; no sidecar
//! metadata is written.

mod heap;

pub use heap::FileEntry;

use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

struct CacheState {
    current_bytes: u64,
    files: BinaryHeap<FileEntry>,
}

/// Byte-bounded staging cache over one directory.
pub struct FileManager {
    dir: PathBuf,
    max_bytes: u64,
    max_retries: u32,
    retry_delay: Duration,
    // coarse lock over byte count and heap
    state: Mutex<CacheState>,
    // per-name locks, lazily created and retained
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileManager {
    /// Create the directory if missing and index every regular file under it.
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut files = BinaryHeap::new();
        let mut current_bytes = 0u64;
        for entry in WalkDir::new(&dir) {
            let entry = entry.map_err(|e| {
                Error::Validation(format!("walk directory {}: {e}", dir.display()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry.metadata().map_err(|e| {
                Error::Validation(format!("stat {}: {e}", entry.path().display()))
            })?;
            current_bytes += meta.len();
            files.push(FileEntry {
                path: entry.path().to_path_buf(),
                size: meta.len(),
                mod_time: meta.modified()?,
            });
        }

        Ok(Self {
            dir,
            max_bytes,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            state: Mutex::new(CacheState {
                current_bytes,
                files,
            }),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_retry(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Bytes currently accounted to the directory.
    pub async fn current_bytes(&self) -> u64 {
        self.state.lock().await.current_bytes
    }

    /// Ensure `filename` exists under the managed directory, loading it with
    /// `load` when absent. Concurrent calls for the same name serialize; the
    /// loader runs at most once when the file is missing.
    pub async fn sync_file<F, Fut, R>(&self, filename: &str, load: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<R>>,
        R: AsyncRead + Send + Unpin,
    {
        let name_lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(filename.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = name_lock.lock().await;

        let full = self.dir.join(filename);
        match tokio::fs::metadata(&full).await {
            Ok(_) => {
                info!("file {filename} already exists, skipping sync");
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!("starting sync for file: {filename}");
        self.add_file(&full, load).await
    }

    /// Stream into a temp file, make room, then move it into place.
    async fn add_file<F, Fut, R>(&self, full: &Path, load: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<R>>,
        R: AsyncRead + Send + Unpin,
    {
        let tmp = tmp_path(full);
        if let Some(parent) = tmp.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let written = self.copy_with_retry(&tmp, &load).await?;

        let mut state = self.state.lock().await;
        while state.current_bytes + written > self.max_bytes && state.current_bytes > 0 {
            if let Err(e) = delete_oldest(&mut state).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            }
        }

        if let Err(e) = tokio::fs::rename(&tmp, full).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Validation(format!(
                "rename temporary file into place: {e}"
            )));
        }

        let meta = tokio::fs::metadata(full).await?;
        state.current_bytes += meta.len();
        state.files.push(FileEntry {
            path: full.to_path_buf(),
            size: meta.len(),
            mod_time: meta.modified()?,
        });

        Ok(())
    }

    async fn copy_with_retry<F, Fut, R>(&self, tmp: &Path, load: &F) -> Result<u64>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<R>>,
        R: AsyncRead + Send + Unpin,
    {
        let filename = tmp
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut retries = 0u32;
        loop {
            if retries > 0 {
                info!(
                    "retrying download for {filename} (attempt {}/{})",
                    retries + 1,
                    self.max_retries
                );
            }

            match self.try_copy(tmp, &filename, load).await {
                Ok(written) => return Ok(written),
                Err(e) => {
                    retries += 1;
                    if retries >= self.max_retries {
                        return Err(Error::Validation(format!(
                            "copy failed after {} retries: {e}",
                            self.max_retries
                        )));
                    }
                    warn!(
                        "failed to copy {filename} (retry {}/{}): {e}, waiting {:?} before retry",
                        retries, self.max_retries, self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    async fn try_copy<F, Fut, R>(&self, tmp: &Path, filename: &str, load: &F) -> Result<u64>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<R>>,
        R: AsyncRead + Send + Unpin,
    {
        let mut reader = load().await?;
        let mut file = tokio::fs::File::create(tmp).await?;

        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        let mut last_log = Instant::now();
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            total += n as u64;

            if last_log.elapsed() >= PROGRESS_LOG_INTERVAL {
                info!("downloading {filename}: {total} bytes downloaded so far...");
                last_log = Instant::now();
            }
        }
        file.flush().await?;
        Ok(total)
    }
}

fn tmp_path(full: &Path) -> PathBuf {
    let mut os = full.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

async fn delete_oldest(state: &mut CacheState) -> Result<()> {
    let oldest = state
        .files
        .pop()
        .ok_or_else(|| Error::Validation("no file available to delete".into()))?;
    debug!("delete oldest file: {}", oldest.path.display());

    if let Err(e) = tokio::fs::remove_file(&oldest.path).await {
        // a file deleted out from under the cache is fine
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(e.into());
        }
    }
    state.current_bytes = state.current_bytes.saturating_sub(oldest.size);
    Ok(())
}
