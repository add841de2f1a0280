use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use anyhow::{Result, anyhow};
use tokio::fs as async_fs;
use tokio::fs::File as AsyncFile;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{trace, warn};

use super::datastore::CacheDatastore;
use super::record::FileRecord;
use crate::util::{now_unix, now_unix_millis};

/// An open committed cache file plus the index row it was found under.
#[derive(Debug)]
pub struct ReadHandle {
    record: FileRecord,
    file: AsyncFile,
}

impl ReadHandle {
    pub(super) fn new(record: FileRecord, file: AsyncFile) -> Self {
        Self { record, file }
    }

    pub fn record(&self) -> &FileRecord {
        &self.record
    }

    pub(super) fn replace_record(&mut self, record: FileRecord) {
        self.record = record;
    }
}

impl AsyncRead for ReadHandle {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

/// Index fields decided when the response head arrives.
#[derive(Debug, Clone)]
pub(super) struct PendingEntry {
    pub(super) lookup_key: String,
    pub(super) safe_key: String,
    pub(super) remote_url: String,
    pub(super) etag: String,
    pub(super) cache_control: String,
    pub(super) cache_max_age: u64,
    pub(super) resource_age: u64,
}

/// Sink for one downloaded body.
///
/// A pass-through handle swallows bytes. A caching handle writes them to a temp file that only
/// [`finished_writing`](Self::finished_writing) promotes and indexes; dropping it unfinished
/// deletes the temp file.
#[derive(Debug)]
pub enum WriteHandle {
    PassThrough,
    Caching(CachingWriter),
}

impl WriteHandle {
    pub fn pass_through() -> Self {
        WriteHandle::PassThrough
    }

    pub fn is_caching(&self) -> bool {
        matches!(self, WriteHandle::Caching(_))
    }

    /// Commits a caching handle: flush, promote, index, then evict. Returns the stored record,
    /// or `None` for a pass-through handle.
    pub async fn finished_writing(self) -> Result<Option<FileRecord>> {
        match self {
            WriteHandle::PassThrough => Ok(None),
            WriteHandle::Caching(mut writer) => writer.commit().await.map(Some),
        }
    }
}

impl AsyncWrite for WriteHandle {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            WriteHandle::PassThrough => Poll::Ready(Ok(buf.len())),
            WriteHandle::Caching(writer) => Pin::new(writer).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            WriteHandle::PassThrough => Poll::Ready(Ok(())),
            WriteHandle::Caching(writer) => Pin::new(writer).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            WriteHandle::PassThrough => Poll::Ready(Ok(())),
            WriteHandle::Caching(writer) => Pin::new(writer).poll_shutdown(cx),
        }
    }
}

#[derive(Debug)]
pub struct CachingWriter {
    file: Option<AsyncFile>,
    temp_path: PathBuf,
    pending: PendingEntry,
    datastore: Arc<CacheDatastore>,
    written: u64,
    finished: bool,
}

impl CachingWriter {
    pub(super) fn new(
        file: AsyncFile,
        temp_path: PathBuf,
        pending: PendingEntry,
        datastore: Arc<CacheDatastore>,
    ) -> Self {
        Self {
            file: Some(file),
            temp_path,
            pending,
            datastore,
            written: 0,
            finished: false,
        }
    }

    pub fn temp_path(&self) -> &std::path::Path {
        &self.temp_path
    }

    async fn commit(&mut self) -> Result<FileRecord> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| anyhow!("cache writer already committed"))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let datastore = self.datastore.clone();
        let promotion = datastore.lock_promotion().await;
        let relative_path = self
            .datastore
            .move_from_temp_file(&self.temp_path, &self.pending.safe_key)
            .await?;
        self.finished = true;

        let record = FileRecord {
            lookup_key: self.pending.lookup_key.clone(),
            remote_url: self.pending.remote_url.clone(),
            etag: self.pending.etag.clone(),
            relative_path,
            size_on_disk: self.written,
            downloaded_at: now_unix(),
            last_access: now_unix_millis(),
            resource_age: self.pending.resource_age,
            cache_max_age: self.pending.cache_max_age,
            cache_control: self.pending.cache_control.clone(),
        };

        let indexed = {
            let record = record.clone();
            self.datastore
                .with_index("upsert", move |index| index.upsert(&record))
                .await
        };
        if let Err(err) = indexed {
            let promoted = self.datastore.layout().resolve(&record.relative_path);
            let _ = async_fs::remove_file(&promoted).await;
            return Err(err);
        }
        drop(promotion);
        trace!(key = %record.lookup_key, size = record.size_on_disk, "stored cache entry");
        crate::metrics::record_cache_store();

        if let Err(err) = self.datastore.evict().await {
            warn!(error = ?err, "eviction after cache store failed");
        }
        Ok(record)
    }
}

impl AsyncWrite for CachingWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let Some(file) = self.file.as_mut() else {
            return Poll::Ready(Err(std::io::Error::other("cache writer already committed")));
        };
        match Pin::new(file).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                self.written = self.written.saturating_add(written as u64);
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.file.as_mut() {
            Some(file) => Pin::new(file).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.file.as_mut() {
            Some(file) => Pin::new(file).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for CachingWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let temp_path = self.temp_path.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = async_fs::remove_file(temp_path).await;
            });
        } else {
            let _ = std::fs::remove_file(&temp_path);
        }
    }
}
