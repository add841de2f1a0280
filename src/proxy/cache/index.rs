use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, warn};

use super::record::FileRecord;

pub const SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const CREATE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS files (
    lookup_key TEXT PRIMARY KEY NOT NULL,
    remote_url TEXT NOT NULL,
    etag TEXT NOT NULL,
    file_path TEXT NOT NULL,
    disk_size INTEGER NOT NULL,
    downloaded_at_unix_time INTEGER NOT NULL,
    last_access INTEGER NOT NULL,
    resource_age INTEGER NOT NULL DEFAULT 0,
    max_age_unix_time INTEGER NOT NULL,
    cache_control TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS files_last_access ON files (last_access);
";

const SELECT_COLUMNS: &str = "lookup_key, remote_url, etag, file_path, disk_size, \
    downloaded_at_unix_time, last_access, resource_age, max_age_unix_time, cache_control";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvictionStats {
    pub entries: u64,
    pub bytes: u64,
}

/// SQLite index of committed cache files.
///
/// Every operation opens its own connection; SQLite serialises writers and WAL lets readers
/// proceed alongside them. All methods block and belong on `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct CacheIndex {
    path: PathBuf,
    storage_root: PathBuf,
}

impl CacheIndex {
    /// Opens (creating or migrating) the index at `path`. Record paths are relative to
    /// `storage_root`.
    pub fn open(path: &Path, storage_root: &Path) -> Result<Self> {
        let index = Self {
            path: path.to_path_buf(),
            storage_root: storage_root.to_path_buf(),
        };
        index.migrate()?;
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("failed to open cache index at {}", self.path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL for cache index")?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("failed to set cache index busy timeout")?;
        Ok(conn)
    }

    fn with_immediate_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start cache index transaction")?;
        let result = f(&tx)?;
        tx.commit().context("failed to commit cache index transaction")?;
        Ok(result)
    }

    fn migrate(&self) -> Result<()> {
        self.with_immediate_tx(|tx| {
            let version: i64 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
            if version > SCHEMA_VERSION {
                bail!(
                    "cache index {} has schema version {version}, newer than supported {SCHEMA_VERSION}",
                    self.path.display()
                );
            }
            tx.execute_batch(CREATE_SCHEMA)
                .context("failed to create cache index schema")?;
            if version < SCHEMA_VERSION {
                tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
                debug!(from = version, to = SCHEMA_VERSION, "migrated cache index schema");
            }
            Ok(())
        })
    }

    /// Inserts or replaces the row for `record.lookup_key`.
    pub fn upsert(&self, record: &FileRecord) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO files (lookup_key, remote_url, etag, file_path, disk_size, \
             downloaded_at_unix_time, last_access, resource_age, max_age_unix_time, cache_control) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.lookup_key,
                record.remote_url,
                record.etag,
                record.relative_path,
                to_sql_int(record.size_on_disk),
                record.downloaded_at,
                record.last_access,
                to_sql_int(record.resource_age),
                to_sql_int(record.cache_max_age),
                record.cache_control,
            ],
        )
        .with_context(|| format!("failed to index cache entry {}", record.lookup_key))?;
        Ok(())
    }

    pub fn read_by_key(&self, lookup_key: &str) -> Result<Option<FileRecord>> {
        let conn = self.connection()?;
        let record = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM files WHERE lookup_key = ?1"),
                params![lookup_key],
                record_from_row,
            )
            .optional()
            .with_context(|| format!("failed to read cache entry {lookup_key}"))?;
        Ok(record)
    }

    /// Records an access; returns false when the row no longer exists.
    pub fn touch(&self, lookup_key: &str, last_access: i64) -> Result<bool> {
        let conn = self.connection()?;
        let updated = conn.execute(
            "UPDATE files SET last_access = ?2 WHERE lookup_key = ?1",
            params![lookup_key, last_access],
        )?;
        Ok(updated > 0)
    }

    /// Restarts the freshness window of an entry the origin confirmed as unchanged.
    pub fn freshen(
        &self,
        lookup_key: &str,
        downloaded_at: i64,
        cache_max_age: u64,
        cache_control: &str,
    ) -> Result<bool> {
        let conn = self.connection()?;
        let updated = conn.execute(
            "UPDATE files SET downloaded_at_unix_time = ?2, max_age_unix_time = ?3, \
             cache_control = ?4 WHERE lookup_key = ?1",
            params![
                lookup_key,
                downloaded_at,
                to_sql_int(cache_max_age),
                cache_control
            ],
        )?;
        Ok(updated > 0)
    }

    pub fn total_size(&self) -> Result<u64> {
        let conn = self.connection()?;
        let total: i64 =
            conn.query_row("SELECT COALESCE(SUM(disk_size), 0) FROM files", [], |row| {
                row.get(0)
            })?;
        Ok(from_sql_int(total))
    }

    pub fn len(&self) -> Result<u64> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        Ok(from_sql_int(count))
    }

    /// Drops the coldest entries until the retained total fits in `quota_bytes`.
    ///
    /// Entries are ranked most-recently-accessed first and every entry whose running size total
    /// exceeds the quota is removed: backing file first, then its row, all inside one immediate
    /// transaction. A file whose removal fails for a reason other than `NotFound` keeps its row
    /// so the next pass retries it.
    ///
    /// Readers are not pinned. A reader that opened a file before this pass deletes it keeps its
    /// open descriptor on unix, but a reader that looked up the row and has not yet opened the
    /// file finds it gone and treats the lookup as a miss.
    pub fn evict_by_lru(&self, quota_bytes: u64) -> Result<EvictionStats> {
        self.with_immediate_tx(|tx| {
            let candidates = {
                let mut stmt = tx.prepare(
                    "SELECT lookup_key, file_path, disk_size FROM ( \
                         SELECT lookup_key, file_path, disk_size, \
                             SUM(disk_size) OVER ( \
                                 ORDER BY last_access DESC, lookup_key ASC \
                                 ROWS BETWEEN UNBOUNDED PRECEDING AND CURRENT ROW \
                             ) AS running_total \
                         FROM files \
                     ) WHERE running_total > ?1",
                )?;
                let rows = stmt.query_map(params![to_sql_int(quota_bytes)], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            let mut stats = EvictionStats::default();
            for (lookup_key, relative_path, size) in candidates {
                let file_path = self.storage_root.join(&relative_path);
                match std::fs::remove_file(&file_path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => {
                        warn!(
                            error = %err,
                            path = %file_path.display(),
                            "failed to remove evicted cache file; keeping index row"
                        );
                        continue;
                    }
                }
                tx.execute(
                    "DELETE FROM files WHERE lookup_key = ?1",
                    params![lookup_key],
                )?;
                stats.entries += 1;
                stats.bytes += from_sql_int(size);
            }
            Ok(stats)
        })
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        lookup_key: row.get(0)?,
        remote_url: row.get(1)?,
        etag: row.get(2)?,
        relative_path: row.get(3)?,
        size_on_disk: from_sql_int(row.get(4)?),
        downloaded_at: row.get(5)?,
        last_access: row.get(6)?,
        resource_age: from_sql_int(row.get(7)?),
        cache_max_age: from_sql_int(row.get(8)?),
        cache_control: row.get(9)?,
    })
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::cache::record::sample_record;
    use tempfile::TempDir;

    fn open_index(dir: &TempDir) -> Result<CacheIndex> {
        std::fs::create_dir_all(dir.path().join("private"))?;
        std::fs::create_dir_all(dir.path().join("cache/files"))?;
        CacheIndex::open(&dir.path().join("private/index.db"), dir.path())
    }

    fn insert_with_file(
        index: &CacheIndex,
        root: &Path,
        key: &str,
        size: u64,
        last_access: i64,
    ) -> Result<FileRecord> {
        let record = sample_record(key, size, last_access);
        std::fs::write(root.join(&record.relative_path), vec![0u8; size as usize])?;
        index.upsert(&record)?;
        Ok(record)
    }

    #[test]
    fn record_round_trips() -> Result<()> {
        let dir = TempDir::new()?;
        let index = open_index(&dir)?;
        let mut record = sample_record("/v1/chunk/abc/0.ts", 1024, 1_700_000_000_123);
        record.resource_age = 17;
        record.cache_control = "max-age=600, no-cache".into();
        index.upsert(&record)?;

        assert_eq!(index.read_by_key(&record.lookup_key)?, Some(record.clone()));
        assert_eq!(index.read_by_key("/missing")?, None);
        Ok(())
    }

    #[test]
    fn upsert_replaces_existing_row() -> Result<()> {
        let dir = TempDir::new()?;
        let index = open_index(&dir)?;
        let mut record = sample_record("/v1/chunk/abc/0.ts", 10, 1);
        index.upsert(&record)?;
        record.size_on_disk = 20;
        record.etag = "\"def\"".into();
        index.upsert(&record)?;
        assert_eq!(index.len()?, 1);
        assert_eq!(index.read_by_key(&record.lookup_key)?, Some(record));
        Ok(())
    }

    #[test]
    fn touch_and_freshen_update_rows() -> Result<()> {
        let dir = TempDir::new()?;
        let index = open_index(&dir)?;
        let record = sample_record("/v1/chunk/abc/0.ts", 10, 1);
        index.upsert(&record)?;

        assert!(index.touch(&record.lookup_key, 99)?);
        assert!(!index.touch("/missing", 99)?);
        assert!(index.freshen(&record.lookup_key, 1_800_000_000, 30, "max-age=30")?);

        let stored = index
            .read_by_key(&record.lookup_key)?
            .expect("record present");
        assert_eq!(stored.last_access, 99);
        assert_eq!(stored.downloaded_at, 1_800_000_000);
        assert_eq!(stored.cache_max_age, 30);
        assert_eq!(stored.cache_control, "max-age=30");
        Ok(())
    }

    #[test]
    fn eviction_removes_minimal_coldest_suffix() -> Result<()> {
        let dir = TempDir::new()?;
        let index = open_index(&dir)?;
        let mut records = Vec::new();
        for (i, size) in [100u64, 300, 50, 200, 150].into_iter().enumerate() {
            let key = format!("/v1/chunk/a/{i}.ts");
            records.push(insert_with_file(&index, dir.path(), &key, size, i as i64 + 1)?);
        }
        // Hottest first: 4 (150), 3 (200), 2 (50), 1 (300), 0 (100). Running totals 150, 350,
        // 400, 700, 800; a 400 byte quota keeps the first three.
        let stats = index.evict_by_lru(400)?;
        assert_eq!(stats, EvictionStats { entries: 2, bytes: 400 });

        for (i, record) in records.iter().enumerate() {
            let kept = i >= 2;
            assert_eq!(index.read_by_key(&record.lookup_key)?.is_some(), kept, "row {i}");
            assert_eq!(
                dir.path().join(&record.relative_path).exists(),
                kept,
                "file {i}"
            );
        }
        assert_eq!(index.total_size()?, 400);
        Ok(())
    }

    #[test]
    fn eviction_is_a_no_op_under_quota() -> Result<()> {
        let dir = TempDir::new()?;
        let index = open_index(&dir)?;
        for i in 0..3 {
            insert_with_file(&index, dir.path(), &format!("/k/{i}"), 100, i)?;
        }
        assert_eq!(index.evict_by_lru(300)?, EvictionStats::default());
        assert_eq!(index.len()?, 3);
        Ok(())
    }

    #[test]
    fn eviction_tolerates_missing_files() -> Result<()> {
        let dir = TempDir::new()?;
        let index = open_index(&dir)?;
        let record = sample_record("/gone", 500, 1);
        index.upsert(&record)?;
        let stats = index.evict_by_lru(100)?;
        assert_eq!(stats.entries, 1);
        assert_eq!(index.read_by_key("/gone")?, None);
        Ok(())
    }

    #[test]
    fn refuses_newer_schema() -> Result<()> {
        let dir = TempDir::new()?;
        let index = open_index(&dir)?;
        let conn = Connection::open(index.path())?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)?;
        drop(conn);

        let err = CacheIndex::open(index.path(), dir.path()).expect_err("newer schema");
        assert!(err.to_string().contains("newer than supported"), "{err}");
        Ok(())
    }

    #[test]
    fn reopening_keeps_rows() -> Result<()> {
        let dir = TempDir::new()?;
        let index = open_index(&dir)?;
        index.upsert(&sample_record("/v1/chunk/a/0.ts", 10, 1))?;
        let reopened = CacheIndex::open(index.path(), dir.path())?;
        assert_eq!(reopened.len()?, 1);
        Ok(())
    }
}
