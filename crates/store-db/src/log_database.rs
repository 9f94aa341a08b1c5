//! Per-device append-only log table, backed by SQLite (spec §4.4).
//!
//! Journal mode: **rollback journal** (`PRAGMA journal_mode=DELETE`, the
//! SQLite default), not WAL. WAL mode leaves `-wal`/`-shm` sidecar files
//! next to the database that a whole-file cloud-sync service (Dropbox,
//! iCloud Drive, a shared folder) has no reason to replicate atomically
//! with the main file, so a peer could observe a `logs.db` with missing
//! committed pages. A rollback journal keeps every committed state in the
//! single `logs.db` file, at the cost of serializing local writers — which
//! is fine, because exactly one device ever writes to its own database
//! (spec Non-goals).
//!
//! Concurrent access is restricted by construction: `open(path, true)`
//! opens `SQLITE_OPEN_READ_ONLY` and every mutating method on a read-only
//! handle returns [`syncstore_core::Error::IoFailure`].

use std::path::{Path, PathBuf};
use std::time::Instant;

use rusqlite::{Connection, OpenFlags, OptionalExtension};
use syncstore_core::{Error, LogEntry, Result, Timestamp};

const CREATE_TABLE_SQL: &str = "
CREATE TABLE IF NOT EXISTS Log (
    timestamp INTEGER NOT NULL,
    parentTimestamp INTEGER NULL,
    key TEXT NOT NULL,
    blob BLOB NULL
)";

const CREATE_INDEXES_SQL: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS log_timestamp_idx ON Log(timestamp)",
    "CREATE INDEX IF NOT EXISTS log_parent_timestamp_idx ON Log(parentTimestamp)",
    "CREATE INDEX IF NOT EXISTS log_key_idx ON Log(key)",
];

/// Sort order for a streaming fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// One row streamed back from `Log`, tagged with nothing else — the caller
/// (`MergeEngine`) knows which database it came from.
pub type Row = LogEntry;

/// A single device's append-only `Log` table.
///
/// May be lazily closed by its owner after inactivity (spec §4.4); this
/// type exposes `close`/`reopen` but does not schedule the timer itself —
/// that is `syncstore-sync`'s `SerialExecutor` concern.
pub struct LogDatabase {
    path: PathBuf,
    readonly: bool,
    conn: Option<Connection>,
    last_used: Instant,
}

impl LogDatabase {
    /// Opens (creating if necessary, unless `readonly`) the `Log` table at
    /// `path`.
    pub fn open(path: impl Into<PathBuf>, readonly: bool) -> Result<Self> {
        let path = path.into();
        let mut db = Self {
            path,
            readonly,
            conn: None,
            last_used: Instant::now(),
        };
        db.ensure_open()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    fn ensure_open(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let flags = if self.readonly {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        };
        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|e| Error::io(format!("opening {}: {e}", self.path.display())))?;
        conn.pragma_update(None, "journal_mode", "DELETE")
            .map_err(|e| Error::io(e.to_string()))?;
        if !self.readonly {
            conn.execute(CREATE_TABLE_SQL, [])
                .map_err(|e| Error::io(e.to_string()))?;
            for stmt in CREATE_INDEXES_SQL {
                conn.execute(stmt, []).map_err(|e| Error::io(e.to_string()))?;
            }
        }
        self.conn = Some(conn);
        self.last_used = Instant::now();
        Ok(())
    }

    fn conn(&mut self) -> Result<&Connection> {
        self.ensure_open()?;
        self.last_used = Instant::now();
        Ok(self.conn.as_ref().expect("ensure_open populates conn"))
    }

    /// Releases the underlying connection. Reopens lazily on next use
    /// (spec §4.4 auto-close).
    pub fn close(&mut self) {
        self.conn = None;
    }

    /// Best-effort lock release after a successful save, so an external
    /// file-sync service can upload the file (spec §4.4). SQLite already
    /// releases its write lock at transaction-commit with a rollback
    /// journal, so on this backend `blink` is a no-op placeholder for the
    /// platform-specific file-coordination hook `syncstore-sync` wraps it
    /// with.
    pub fn blink(&self) {}

    /// Appends one entry. Returns `IoFailure` if this handle is read-only.
    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        if self.readonly {
            return Err(Error::io("append on a read-only LogDatabase"));
        }
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO Log (timestamp, parentTimestamp, key, blob) VALUES (?1, ?2, ?3, ?4)",
            (
                entry.timestamp,
                entry.parent_timestamp,
                &entry.key,
                entry.blob.as_deref(),
            ),
        )
        .map_err(|e| Error::io(e.to_string()))?;
        Ok(())
    }

    /// Appends a batch of entries in one transaction, for `insert_changes`
    /// (spec §4.7.8) and burst writes.
    pub fn append_batch(&mut self, entries: &[LogEntry]) -> Result<()> {
        if self.readonly {
            return Err(Error::io("append on a read-only LogDatabase"));
        }
        let conn = self.conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::io(e.to_string()))?;
        for entry in entries {
            tx.execute(
                "INSERT INTO Log (timestamp, parentTimestamp, key, blob) VALUES (?1, ?2, ?3, ?4)",
                (
                    entry.timestamp,
                    entry.parent_timestamp,
                    &entry.key,
                    entry.blob.as_deref(),
                ),
            )
            .map_err(|e| Error::io(e.to_string()))?;
        }
        tx.commit().map_err(|e| Error::io(e.to_string()))?;
        Ok(())
    }

    /// Commits any pending writes. With `rusqlite`'s auto-commit mode every
    /// `execute` is already durable on return, so this is a `PRAGMA
    /// wal_checkpoint`-style no-op kept for symmetry with §4.7.5's save
    /// step and as the hook platforms with deferred commits would use.
    pub fn save(&mut self) -> Result<()> {
        self.conn()?;
        Ok(())
    }

    /// Streams rows with `timestamp > timestamp_exclusive`, in `order`,
    /// `batch_size` at a time, invoking `on_batch` per batch. Returning
    /// `Ok(false)` from `on_batch` stops the scan early (spec §4.7.1 step 3:
    /// "stop a database's scan early only when the set of keys of interest
    /// becomes empty").
    pub fn fetch_after(
        &mut self,
        timestamp_exclusive: Timestamp,
        order: Order,
        batch_size: usize,
        mut on_batch: impl FnMut(&[Row]) -> Result<bool>,
    ) -> Result<()> {
        let order_sql = match order {
            Order::Ascending => "ASC",
            Order::Descending => "DESC",
        };
        let conn = self.conn()?;
        let sql = format!(
            "SELECT timestamp, parentTimestamp, key, blob FROM Log \
             WHERE timestamp > ?1 ORDER BY timestamp {order_sql} LIMIT ?2 OFFSET ?3"
        );
        let mut offset: usize = 0;
        loop {
            let mut stmt = conn.prepare_cached(&sql).map_err(|e| Error::io(e.to_string()))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![timestamp_exclusive, batch_size as i64, offset as i64],
                    row_to_entry,
                )
                .map_err(|e| Error::io(e.to_string()))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| Error::io(e.to_string()))?;
            if rows.is_empty() {
                return Ok(());
            }
            let fetched = rows.len();
            let keep_going = on_batch(&rows)?;
            if !keep_going || fetched < batch_size {
                return Ok(());
            }
            offset += fetched;
        }
    }

    /// Newest row for `key` with `timestamp <= at_or_before`, if any.
    pub fn fetch_latest_for_key(
        &mut self,
        key: &str,
        at_or_before: Timestamp,
    ) -> Result<Option<Row>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT timestamp, parentTimestamp, key, blob FROM Log \
             WHERE key = ?1 AND timestamp <= ?2 ORDER BY timestamp DESC LIMIT 1",
            rusqlite::params![key, at_or_before],
            row_to_entry,
        )
        .optional()
        .map_err(|e| Error::io(e.to_string()))
    }

    /// Rows with `from <= timestamp <= to`, ascending (spec §4.7.7).
    pub fn fetch_range(&mut self, from: Timestamp, to: Timestamp) -> Result<Vec<Row>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT timestamp, parentTimestamp, key, blob FROM Log \
                      WHERE timestamp >= ?1 AND timestamp <= ?2 ORDER BY timestamp ASC")
            .map_err(|e| Error::io(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![from, to], row_to_entry)
            .map_err(|e| Error::io(e.to_string()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::io(e.to_string()))?;
        Ok(rows)
    }

    /// The greatest timestamp currently stored, or `None` if the log is
    /// empty (used to seed/validate `cursors[d]`, spec §8 invariant).
    pub fn max_timestamp(&mut self) -> Result<Option<Timestamp>> {
        let conn = self.conn()?;
        conn.query_row("SELECT MAX(timestamp) FROM Log", [], |row| row.get(0))
            .map_err(|e| Error::io(e.to_string()))
    }

    /// Number of rows whose `(timestamp, key)` exactly matches one already
    /// present, used by `insert_changes`'s overwrite-mode duplicate skip
    /// (spec §4.7.8).
    pub fn contains_exact(&mut self, timestamp: Timestamp, key: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM Log WHERE timestamp = ?1 AND key = ?2",
                rusqlite::params![timestamp, key],
                |row| row.get(0),
            )
            .map_err(|e| Error::io(e.to_string()))?;
        Ok(count > 0)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    Ok(LogEntry {
        timestamp: row.get(0)?,
        parent_timestamp: row.get(1)?,
        key: row.get(2)?,
        blob: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(ts: Timestamp, key: &str, value: &str) -> LogEntry {
        LogEntry::new(ts, None, key.to_string()).with_blob(value.as_bytes().to_vec())
    }

    #[test]
    fn append_then_fetch_latest_for_key() {
        let dir = tempdir().unwrap();
        let mut db = LogDatabase::open(dir.path().join("logs.db"), false).unwrap();
        db.append(&entry(100, "title", "first")).unwrap();
        db.append(&entry(200, "title", "second")).unwrap();

        let latest = db
            .fetch_latest_for_key("title", Timestamp::MAX)
            .unwrap()
            .unwrap();
        assert_eq!(latest.blob.unwrap(), b"second");
    }

    #[test]
    fn fetch_after_streams_in_batches() {
        let dir = tempdir().unwrap();
        let mut db = LogDatabase::open(dir.path().join("logs.db"), false).unwrap();
        for i in 0..10 {
            db.append(&entry(i, &format!("k{i}"), "v")).unwrap();
        }

        let mut seen = Vec::new();
        db.fetch_after(-1, Order::Ascending, 3, |batch| {
            seen.extend(batch.iter().map(|r| r.timestamp));
            Ok(true)
        })
        .unwrap();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn fetch_after_honors_early_stop() {
        let dir = tempdir().unwrap();
        let mut db = LogDatabase::open(dir.path().join("logs.db"), false).unwrap();
        for i in 0..10 {
            db.append(&entry(i, &format!("k{i}"), "v")).unwrap();
        }

        let mut batches = 0;
        db.fetch_after(-1, Order::Descending, 2, |_| {
            batches += 1;
            Ok(batches < 2)
        })
        .unwrap();
        assert_eq!(batches, 2);
    }

    #[test]
    fn readonly_handle_rejects_append() {
        let dir = tempdir().unwrap();
        {
            LogDatabase::open(dir.path().join("logs.db"), false).unwrap();
        }
        let mut db = LogDatabase::open(dir.path().join("logs.db"), true).unwrap();
        assert!(db.append(&entry(1, "k", "v")).is_err());
    }

    #[test]
    fn close_and_reopen_preserves_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs.db");
        let mut db = LogDatabase::open(&path, false).unwrap();
        db.append(&entry(1, "k", "v")).unwrap();
        db.close();
        assert!(!db.is_open());

        let latest = db.fetch_latest_for_key("k", Timestamp::MAX).unwrap();
        assert!(latest.is_some());
        assert!(db.is_open());
    }

    #[test]
    fn max_timestamp_tracks_cursor() {
        let dir = tempdir().unwrap();
        let mut db = LogDatabase::open(dir.path().join("logs.db"), false).unwrap();
        assert_eq!(db.max_timestamp().unwrap(), None);
        db.append(&entry(5, "k", "v")).unwrap();
        db.append(&entry(9, "k", "v")).unwrap();
        assert_eq!(db.max_timestamp().unwrap(), Some(9));
    }

    #[test]
    fn contains_exact_detects_duplicates() {
        let dir = tempdir().unwrap();
        let mut db = LogDatabase::open(dir.path().join("logs.db"), false).unwrap();
        db.append(&entry(5, "k", "v")).unwrap();
        assert!(db.contains_exact(5, "k").unwrap());
        assert!(!db.contains_exact(5, "other").unwrap());
    }
}
