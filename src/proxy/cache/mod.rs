pub mod cache_control;
mod datastore;
mod handle;
mod index;
pub mod key;
mod record;

use std::io::ErrorKind;
use std::sync::Arc;

use anyhow::Result;
use tokio::fs as async_fs;
use tracing::{debug, warn};
use url::Url;

use crate::proxy::http::Headers;
use crate::settings::Settings;
use crate::util::{now_unix, now_unix_millis};

use cache_control::{CacheControl, is_cacheable, resource_age};
pub use datastore::{CacheDatastore, CacheStatus, IndexError, StorageLayout};
use handle::{CachingWriter, PendingEntry};
pub use handle::{ReadHandle, WriteHandle};
pub use index::{CacheIndex, EvictionStats};
pub use key::{CacheKey, generate_cache_key, safe_cache_key};
pub use record::FileRecord;

/// Cache policy on top of the datastore: what may be stored, when a hit needs revalidation, and
/// the lifecycle of read and write handles.
#[derive(Debug, Clone)]
pub struct CacheController {
    datastore: Arc<CacheDatastore>,
}

impl CacheController {
    pub fn new(settings: &Settings) -> Self {
        let layout = StorageLayout::new(settings.storage_dir.clone());
        Self {
            datastore: Arc::new(CacheDatastore::new(
                layout,
                settings.cache_quota_bytes,
                settings.index_failure_threshold,
            )),
        }
    }

    pub fn datastore(&self) -> &Arc<CacheDatastore> {
        &self.datastore
    }

    pub fn acquire(&self) {
        self.datastore.acquire();
    }

    pub fn release(&self) {
        self.datastore.release();
    }

    pub async fn open_and_wait(&self) -> Result<CacheStatus> {
        self.datastore.open_and_wait().await
    }

    pub fn status(&self) -> CacheStatus {
        self.datastore.status()
    }

    /// Looks `url` up and opens its file. A hit is returned even when stale; callers check
    /// [`revalidate_required`](Self::revalidate_required) themselves.
    pub async fn try_read(&self, url: &Url) -> Option<ReadHandle> {
        if self.status() != CacheStatus::Open {
            return None;
        }
        let key = CacheKey::for_url(url);
        let lookup_key = key.raw().to_string();
        let record = match self
            .datastore
            .with_index("read", move |index| index.read_by_key(&lookup_key))
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(err) => {
                warn!(error = ?err, url = %url, "cache lookup failed");
                return None;
            }
        };

        let path = self.datastore.layout().resolve(&record.relative_path);
        let file = match async_fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(key = %record.lookup_key, path = %path.display(), "indexed cache file is gone");
                return None;
            }
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to open cache file");
                return None;
            }
        };

        let touched_key = record.lookup_key.clone();
        let now = now_unix_millis();
        if let Err(err) = self
            .datastore
            .with_index("touch", move |index| index.touch(&touched_key, now))
            .await
        {
            warn!(error = ?err, "failed to record cache access");
        }
        let mut record = record;
        record.last_access = now;
        Some(ReadHandle::new(record, file))
    }

    /// Returns a caching handle when `headers` describe a storable segment and the cache is open,
    /// otherwise a pass-through handle.
    pub async fn start_writing(&self, url: &Url, headers: &Headers) -> WriteHandle {
        if !is_cacheable(headers) || self.status() != CacheStatus::Open {
            return WriteHandle::pass_through();
        }

        let cache_control = headers.get("cache-control").unwrap_or_default().to_string();
        let key = CacheKey::for_url(url);
        let pending = PendingEntry {
            lookup_key: key.raw().to_string(),
            safe_key: key.safe().to_string(),
            remote_url: url.to_string(),
            etag: headers.get("etag").unwrap_or_default().to_string(),
            cache_max_age: CacheControl::parse(&cache_control)
                .freshness_lifetime()
                .as_secs(),
            resource_age: resource_age(headers),
            cache_control,
        };

        match self.datastore.create_temp_download_file().await {
            Ok((file, temp_path)) => WriteHandle::Caching(CachingWriter::new(
                file,
                temp_path,
                pending,
                self.datastore.clone(),
            )),
            Err(err) => {
                crate::metrics::record_cache_store_error();
                warn!(error = ?err, url = %url, "failed to start cache download; passing through");
                WriteHandle::pass_through()
            }
        }
    }

    pub fn revalidate_required(&self, now_unix: i64, record: &FileRecord) -> bool {
        record.requires_revalidation(now_unix)
    }

    /// Restarts the freshness window of `handle` after the origin answered `304 Not Modified`.
    /// `Cache-Control` from the 304 replaces the stored directives when present.
    pub async fn freshen(&self, handle: &mut ReadHandle, not_modified: &Headers) {
        let mut record = handle.record().clone();
        if let Some(cache_control) = not_modified.get("cache-control") {
            record.cache_control = cache_control.to_string();
            record.cache_max_age = CacheControl::parse(cache_control)
                .freshness_lifetime()
                .as_secs();
        }
        record.downloaded_at = now_unix();

        let update = record.clone();
        match self
            .datastore
            .with_index("freshen", move |index| {
                index.freshen(
                    &update.lookup_key,
                    update.downloaded_at,
                    update.cache_max_age,
                    &update.cache_control,
                )
            })
            .await
        {
            Ok(_) => handle.replace_record(record),
            Err(err) => warn!(error = ?err, "failed to freshen revalidated cache entry"),
        }
    }
}
