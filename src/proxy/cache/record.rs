use super::cache_control::CacheControl;

/// One committed cache entry as stored in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub lookup_key: String,
    pub remote_url: String,
    pub etag: String,
    /// Relative to the storage root, e.g. `cache/files/<safe key>`.
    pub relative_path: String,
    pub size_on_disk: u64,
    /// Unix seconds.
    pub downloaded_at: i64,
    /// Unix milliseconds.
    pub last_access: i64,
    pub resource_age: u64,
    pub cache_max_age: u64,
    pub cache_control: String,
}

impl FileRecord {
    pub fn is_stale(&self, now_unix: i64) -> bool {
        let max_age = i64::try_from(self.cache_max_age).unwrap_or(i64::MAX);
        now_unix > self.downloaded_at.saturating_add(max_age)
    }

    pub fn requires_revalidation(&self, now_unix: i64) -> bool {
        self.is_stale(now_unix) || CacheControl::parse(&self.cache_control).no_cache
    }
}

#[cfg(test)]
pub(crate) fn sample_record(key: &str, size: u64, last_access: i64) -> FileRecord {
    FileRecord {
        lookup_key: key.to_string(),
        remote_url: format!("https://cdn.example.com{key}"),
        etag: "\"abc\"".to_string(),
        relative_path: format!("cache/files/{}", super::key::safe_cache_key(key)),
        size_on_disk: size,
        downloaded_at: 1_700_000_000,
        last_access,
        resource_age: 0,
        cache_max_age: 600,
        cache_control: "max-age=600".to_string(),
    }
}
