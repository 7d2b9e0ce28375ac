//! Durable write-ahead journal for buffered records.
//!
//! Every record accepted by the buffer is appended here before it is
//! acknowledged; rows are deleted only after the persistent store confirms
//! the flush. On startup, unacknowledged rows are loaded back into the
//! in-memory buffer, so a crash between enqueue and flush loses nothing.
//!
//! Uses SQLite in WAL mode. The connection is wrapped in a `parking_lot`
//! mutex: journal operations are short, single-statement affairs and the
//! contention window is tiny compared to batch flushes.

use std::path::Path;

use chronicle_core::{BufferedRecord, RecordKind};
use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::Result;

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 1;

/// A journal row: the record plus its stable row id for acknowledgement.
#[derive(Debug)]
pub struct JournalEntry {
    pub id: i64,
    pub record: BufferedRecord,
}

/// Append-only journal backed by SQLite WAL.
pub struct Journal {
    conn: Mutex<Connection>,
}

impl Journal {
    /// Open (or create) the journal file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory journal for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Ok(())
    }

    /// Append a record, returning its journal id.
    pub fn append(&self, record: &BufferedRecord) -> Result<i64> {
        let payload = serde_json::to_string(record)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO journal_records (kind, payload, enqueued_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                record.kind().as_str(),
                payload,
                record.enqueued_at.timestamp(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Delete acknowledged rows after a successful flush.
    pub fn ack(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM journal_records WHERE id = ?1")?;
            for id in ids {
                stmt.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Load all unacknowledged rows, oldest first.
    ///
    /// Rows whose payload no longer deserializes (schema drift across a
    /// version upgrade) are deleted and counted, not retried forever.
    pub fn load_all(&self) -> Result<Vec<JournalEntry>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, payload FROM journal_records ORDER BY id ASC")?;
        let rows: Vec<(i64, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        let mut entries = Vec::with_capacity(rows.len());
        let mut corrupt = Vec::new();
        for (id, payload) in rows {
            match serde_json::from_str::<BufferedRecord>(&payload) {
                Ok(record) => entries.push(JournalEntry { id, record }),
                Err(e) => {
                    tracing::warn!(id, "dropping undecodable journal row: {}", e);
                    corrupt.push(id);
                }
            }
        }

        if !corrupt.is_empty() {
            let mut stmt = conn.prepare_cached("DELETE FROM journal_records WHERE id = ?1")?;
            for id in &corrupt {
                stmt.execute([id])?;
            }
            metrics::counter!("buffer_events_invalid_total").increment(corrupt.len() as u64);
        }

        Ok(entries)
    }

    /// Number of unacknowledged rows.
    pub fn depth(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM journal_records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Number of unacknowledged rows for one kind.
    pub fn depth_for(&self, kind: RecordKind) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM journal_records WHERE kind = ?1",
            [kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Cheap liveness probe for the health check loop.
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

/// Initialize the journal schema.
///
/// Creates all tables if they don't exist and runs any pending migrations.
fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    }
    // No migrations yet; add a migrate() chain when SCHEMA_VERSION moves.

    Ok(())
}

/// Get the current schema version (0 if not initialized).
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

/// Set the schema version.
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

/// Create all tables for a fresh database.
fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Unflushed records, one row per buffered record
        CREATE TABLE IF NOT EXISTS journal_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_journal_records_kind ON journal_records(kind);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use chronicle_core::{EventRecord, MessageRecord};

    fn sample(message_id: i64) -> BufferedRecord {
        BufferedRecord::new(EventRecord::Message(MessageRecord {
            tenant_id: 1,
            user_id: 2,
            channel_id: 3,
            category_id: None,
            message_id,
            display_name: "hsh:aa".to_string(),
            length: 4,
            mention_ids: vec![],
            has_attachment: false,
            has_embed: false,
            created_at: Utc::now(),
            is_bot: false,
        }))
    }

    #[test]
    fn test_append_and_load() {
        let journal = Journal::open_in_memory().unwrap();
        let id1 = journal.append(&sample(1)).unwrap();
        let id2 = journal.append(&sample(2)).unwrap();
        assert!(id2 > id1);

        let entries = journal.load_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, id1);
        assert_eq!(entries[0].record.kind(), RecordKind::Message);
    }

    #[test]
    fn test_ack_removes_rows() {
        let journal = Journal::open_in_memory().unwrap();
        let id1 = journal.append(&sample(1)).unwrap();
        let _id2 = journal.append(&sample(2)).unwrap();

        journal.ack(&[id1]).unwrap();
        let entries = journal.load_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(journal.depth().unwrap(), 1);
    }

    #[test]
    fn test_ack_empty_is_noop() {
        let journal = Journal::open_in_memory().unwrap();
        journal.ack(&[]).unwrap();
    }

    #[test]
    fn test_depth_for_kind() {
        let journal = Journal::open_in_memory().unwrap();
        journal.append(&sample(1)).unwrap();
        assert_eq!(journal.depth_for(RecordKind::Message).unwrap(), 1);
        assert_eq!(journal.depth_for(RecordKind::Emoji).unwrap(), 0);
    }

    #[test]
    fn test_corrupt_payload_dropped_on_load() {
        let journal = Journal::open_in_memory().unwrap();
        journal.append(&sample(1)).unwrap();
        {
            let conn = journal.conn.lock();
            conn.execute(
                "INSERT INTO journal_records (kind, payload, enqueued_at) VALUES ('message', 'not json', 0)",
                [],
            )
            .unwrap();
        }

        let entries = journal.load_all().unwrap();
        assert_eq!(entries.len(), 1);
        // The corrupt row is gone on a second load too.
        assert_eq!(journal.depth().unwrap(), 1);
    }

    #[test]
    fn test_open_creates_file_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        {
            let journal = Journal::open(&path).unwrap();
            journal.append(&sample(9)).unwrap();
        }
        let journal = Journal::open(&path).unwrap();
        let entries = journal.load_all().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_ping() {
        let journal = Journal::open_in_memory().unwrap();
        journal.ping().unwrap();
    }
}
