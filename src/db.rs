use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const JOURNAL_FILE_NAME: &str = ".mosa.db";

/// Append-only log of the renames performed under one project root.
pub struct Database {
    conn: Connection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameRecord {
    pub file_id: u64,
    pub old_path: String,
    pub new_path: String,
    pub operation: String,
    pub renamed_at: i64,
}

impl RenameRecord {
    pub fn new(file_id: u64, old_path: &Path, new_path: &Path, operation: &str) -> Self {
        Self {
            file_id,
            old_path: old_path.to_string_lossy().to_string(),
            new_path: new_path.to_string_lossy().to_string(),
            operation: operation.to_string(),
            renamed_at: Utc::now().timestamp(),
        }
    }

    pub fn renamed_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.renamed_at, 0)
    }
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        log::debug!("Opening rename journal at: {:?}", db_path);
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS renames (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id INTEGER NOT NULL,
                old_path TEXT NOT NULL,
                new_path TEXT NOT NULL,
                operation TEXT NOT NULL,
                renamed_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn })
    }

    pub fn record_rename(&self, record: &RenameRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO renames (file_id, old_path, new_path, operation, renamed_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.file_id as i64,
                record.old_path,
                record.new_path,
                record.operation,
                record.renamed_at
            ],
        )?;
        Ok(())
    }

    /// Most recent renames first.
    pub fn history(&self, limit: usize) -> Result<Vec<RenameRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT file_id, old_path, new_path, operation, renamed_at FROM renames ORDER BY seq DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(RenameRecord {
                file_id: row.get::<_, i64>(0)? as u64,
                old_path: row.get(1)?,
                new_path: row.get(2)?,
                operation: row.get(3)?,
                renamed_at: row.get(4)?,
            })
        })?;

        let mut records = Vec::new();
        for record in rows {
            records.push(record?);
        }
        Ok(records)
    }
}

pub fn resolve_db_path(root: &Path) -> PathBuf {
    root.join(JOURNAL_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_newest_first() {
        let db = Database::in_memory().unwrap();
        db.record_rename(&RenameRecord::new(1, Path::new("/a.raw"), Path::new("/a_dbfid1n.raw"), "assign"))
            .unwrap();
        db.record_rename(&RenameRecord::new(2, Path::new("/b.raw"), Path::new("/b_dbfid2n.raw"), "tag"))
            .unwrap();

        let history = db.history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].file_id, 2);
        assert_eq!(history[0].operation, "tag");
        assert_eq!(history[1].new_path, "/a_dbfid1n.raw");
        assert!(history[1].renamed_at().is_some());

        assert_eq!(db.history(1).unwrap().len(), 1);
    }

    #[test]
    fn test_journal_persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = resolve_db_path(dir.path());
        {
            let db = Database::new(&path).unwrap();
            db.record_rename(&RenameRecord::new(9, Path::new("x"), Path::new("x_dbfid9n"), "assign"))
                .unwrap();
        }
        let db = Database::new(&path).unwrap();
        assert_eq!(db.history(5).unwrap()[0].file_id, 9);
    }
}
