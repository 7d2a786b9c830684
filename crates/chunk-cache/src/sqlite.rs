//! SQLite-backed chunk store.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::StoreError;
use crate::store::{ChunkStore, FileRecord};

/// Chunk store in a single SQLite database.
///
/// Two tables: `info` keyed by file id (metadata as JSON) and `chunks`
/// keyed by `(file_id, idx)`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens or creates the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS info (
                file_id TEXT PRIMARY KEY,
                record TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS chunks (
                file_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (file_id, idx)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl ChunkStore for SqliteStore {
    fn load_info(&self, file_id: &str) -> Result<Option<FileRecord>, StoreError> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT record FROM info WHERE file_id = ?1",
                params![file_id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
            .transpose()
    }

    fn save_info(&self, record: &FileRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO info (file_id, record) VALUES (?1, ?2)",
            params![record.id(), json],
        )?;
        Ok(())
    }

    fn write_chunks(&self, file_id: &str, chunks: &[(u64, Vec<u8>)]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO chunks (file_id, idx, data) VALUES (?1, ?2, ?3)",
            )?;
            for (index, data) in chunks {
                stmt.execute(params![file_id, *index as i64, data])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn read_chunk(&self, file_id: &str, index: u64) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT data FROM chunks WHERE file_id = ?1 AND idx = ?2",
                params![file_id, index as i64],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn chunk_keys(&self, file_id: &str) -> Result<Vec<u64>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT idx FROM chunks WHERE file_id = ?1 ORDER BY idx")?;
        let keys = stmt
            .query_map(params![file_id], |row| row.get::<_, i64>(0))?
            .map(|r| r.map(|i| i as u64))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn read_all_chunks(&self, file_id: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT idx, data FROM chunks WHERE file_id = ?1 ORDER BY idx")?;
        let chunks = stmt
            .query_map(params![file_id], |row| {
                Ok((row.get::<_, i64>(0)? as u64, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(chunks)
    }

    fn clear_chunks(&self, file_id: &str) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute("DELETE FROM chunks WHERE file_id = ?1", params![file_id])?;
        Ok(())
    }

    fn delete_file(&self, file_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chunks WHERE file_id = ?1", params![file_id])?;
        tx.execute("DELETE FROM info WHERE file_id = ?1", params![file_id])?;
        tx.commit()?;
        Ok(())
    }

    fn file_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT file_id FROM info ORDER BY file_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}
