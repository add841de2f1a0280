use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use anyhow::{Context, Result, anyhow, ensure};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::fs as async_fs;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task;
use tracing::{debug, error, info, warn};

use super::index::{CacheIndex, EvictionStats};

const TEMP_PREFIX: &str = "tmp_";

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IndexError {
    #[error("cache index is not open")]
    NotOpen,
    #[error("cache index is disabled after repeated failures")]
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Closed,
    Open,
    /// Open failed or the index kept failing; reads miss and writes pass through until reopened.
    Degraded,
}

/// On-disk layout below the storage root.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("cache").join("tmp")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join("cache").join("files")
    }

    pub fn private_dir(&self) -> PathBuf {
        self.root.join("private")
    }

    pub fn index_path(&self) -> PathBuf {
        self.private_dir().join("index.db")
    }

    /// Index-relative path of the committed file for `safe_key`.
    pub fn relative_file_path(&self, safe_key: &str) -> String {
        format!("cache/files/{safe_key}")
    }

    pub fn resolve(&self, relative_path: &str) -> PathBuf {
        self.root.join(relative_path)
    }

    fn prepare(&self) -> Result<()> {
        for dir in [self.temp_dir(), self.files_dir(), self.private_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create cache directory {}", dir.display()))?;
        }
        self.purge_temp_files()
    }

    fn purge_temp_files(&self) -> Result<()> {
        let temp_dir = self.temp_dir();
        let mut removed = 0usize;
        for entry in std::fs::read_dir(&temp_dir)
            .with_context(|| format!("failed to list {}", temp_dir.display()))?
        {
            let path = entry?.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "failed to remove stale temp file");
                }
            }
        }
        if removed > 0 {
            info!(removed, "removed leftover temp downloads");
        }
        Ok(())
    }
}

/// Reference-counted owner of the storage directories and the index.
///
/// The first [`acquire`](Self::acquire) opens the store in the background and the last
/// [`release`](Self::release) closes it. Every change of the count schedules a reconcile that
/// brings the open/closed state in line with the count, so racing calls converge.
#[derive(Debug)]
pub struct CacheDatastore {
    layout: StorageLayout,
    quota_bytes: u64,
    failure_threshold: u32,
    refs: AtomicUsize,
    lifecycle: Mutex<()>,
    /// Held from rename through index upsert, and by eviction, so a row always describes the
    /// file at its path.
    promotion: Mutex<()>,
    index: RwLock<Option<Arc<CacheIndex>>>,
    degraded: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl CacheDatastore {
    pub fn new(layout: StorageLayout, quota_bytes: u64, failure_threshold: u32) -> Self {
        Self {
            layout,
            quota_bytes,
            failure_threshold: failure_threshold.max(1),
            refs: AtomicUsize::new(0),
            lifecycle: Mutex::new(()),
            promotion: Mutex::new(()),
            index: RwLock::new(None),
            degraded: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> CacheStatus {
        if self.degraded.load(Ordering::SeqCst) {
            CacheStatus::Degraded
        } else if self.index.read().is_some() {
            CacheStatus::Open
        } else {
            CacheStatus::Closed
        }
    }

    pub fn acquire(self: &Arc<Self>) {
        self.refs.fetch_add(1, Ordering::SeqCst);
        self.spawn_reconcile();
    }

    pub fn release(self: &Arc<Self>) {
        let _ = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |refs| refs.checked_sub(1));
        self.spawn_reconcile();
    }

    /// Waits until the open triggered by [`acquire`](Self::acquire) has completed.
    pub async fn open_and_wait(&self) -> Result<CacheStatus> {
        ensure!(self.refs() > 0, "cache datastore has no active references");
        self.reconcile().await;
        Ok(self.status())
    }

    fn spawn_reconcile(self: &Arc<Self>) {
        let datastore = self.clone();
        tokio::spawn(async move {
            datastore.reconcile().await;
        });
    }

    pub(crate) async fn reconcile(&self) {
        let _guard = self.lifecycle.lock().await;
        let want_open = self.refs() > 0;
        let is_open = self.index.read().is_some() || self.degraded.load(Ordering::SeqCst);
        match (want_open, is_open) {
            (true, false) => self.open().await,
            (false, true) => self.close(),
            _ => {}
        }
    }

    async fn open(&self) {
        let layout = self.layout.clone();
        let quota = self.quota_bytes;
        let opened = task::spawn_blocking(move || -> Result<(CacheIndex, EvictionStats)> {
            layout.prepare()?;
            let index = CacheIndex::open(&layout.index_path(), layout.root())?;
            let stats = index.evict_by_lru(quota)?;
            Ok((index, stats))
        })
        .await
        .map_err(|err| anyhow!("cache open task failed: {err}"))
        .and_then(|result| result);

        match opened {
            Ok((index, stats)) => {
                crate::metrics::record_cache_eviction(stats.entries, stats.bytes);
                *self.index.write() = Some(Arc::new(index));
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.set_degraded(false);
                info!(
                    root = %self.layout.root().display(),
                    evicted = stats.entries,
                    "cache datastore opened"
                );
            }
            Err(err) => {
                crate::metrics::record_index_error();
                error!(
                    error = ?err,
                    root = %self.layout.root().display(),
                    "failed to open cache datastore; caching disabled"
                );
                self.set_degraded(true);
            }
        }
    }

    fn close(&self) {
        self.index.write().take();
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.set_degraded(false);
        info!(root = %self.layout.root().display(), "cache datastore closed");
    }

    fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::SeqCst);
        crate::metrics::set_cache_degraded(degraded);
    }

    fn current_index(&self) -> Result<Arc<CacheIndex>, IndexError> {
        if self.degraded.load(Ordering::SeqCst) {
            return Err(IndexError::Degraded);
        }
        self.index.read().clone().ok_or(IndexError::NotOpen)
    }

    /// Runs a blocking index operation and tracks consecutive failures.
    pub async fn with_index<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&CacheIndex) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let index = self.current_index()?;
        let result = task::spawn_blocking(move || f(index.as_ref()))
            .await
            .map_err(|err| anyhow!("cache index task failed: {err}"))
            .and_then(|result| result)
            .with_context(|| format!("cache index {operation} failed"));

        match &result {
            Ok(_) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            Err(err) => self.record_failure(operation, err),
        }
        result
    }

    fn record_failure(&self, operation: &'static str, err: &anyhow::Error) {
        crate::metrics::record_index_error();
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(error = ?err, operation, failures, "cache index operation failed");
        if failures >= self.failure_threshold && !self.degraded.swap(true, Ordering::SeqCst) {
            crate::metrics::set_cache_degraded(true);
            error!(
                failures,
                "cache index failing repeatedly; caching disabled until the cache is reopened"
            );
        }
    }

    /// Creates a uniquely named, empty file in the temp area.
    pub async fn create_temp_download_file(&self) -> Result<(async_fs::File, PathBuf)> {
        let temp_path = self
            .layout
            .temp_dir()
            .join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()));
        let mut options = async_fs::OpenOptions::new();
        options.create_new(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        let file = options
            .open(&temp_path)
            .await
            .with_context(|| format!("failed to create temp download {}", temp_path.display()))?;
        Ok((file, temp_path))
    }

    pub(super) async fn lock_promotion(&self) -> MutexGuard<'_, ()> {
        self.promotion.lock().await
    }

    /// Atomically renames a finished temp file into the files area; returns its relative path.
    pub async fn move_from_temp_file(&self, temp_path: &Path, safe_key: &str) -> Result<String> {
        let relative = self.layout.relative_file_path(safe_key);
        let final_path = self.layout.resolve(&relative);
        async_fs::rename(temp_path, &final_path)
            .await
            .with_context(|| {
                format!(
                    "failed to promote {} to {}",
                    temp_path.display(),
                    final_path.display()
                )
            })?;
        debug!(path = %final_path.display(), "promoted cache file");
        Ok(relative)
    }

    pub async fn evict(&self) -> Result<EvictionStats> {
        let quota = self.quota_bytes;
        let _promotion = self.lock_promotion().await;
        let stats = self
            .with_index("eviction", move |index| index.evict_by_lru(quota))
            .await?;
        if stats.entries > 0 {
            debug!(entries = stats.entries, bytes = stats.bytes, "evicted cache entries");
        }
        crate::metrics::record_cache_eviction(stats.entries, stats.bytes);
        Ok(stats)
    }
}
