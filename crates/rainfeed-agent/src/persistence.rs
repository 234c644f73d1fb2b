//! Record persistence.
//!
//! The merge engine only needs to load a section's record once and write it
//! back whole after every change. [`SqliteStore`] keeps one row per section
//! with the record CBOR-encoded; [`MemoryStore`] keeps everything in
//! process and remembers each write.

use async_trait::async_trait;
use rainfeed_core::Record;
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Load/store gateway for section records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch the stored record for a section, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read or the stored record is
    /// unreadable.
    async fn load(&self, section_id: &str) -> Result<Option<Record>, PersistenceError>;

    /// Replace the stored record for `record.section_id`.
    ///
    /// # Errors
    ///
    /// Returns error if the write does not complete.
    async fn store(&self, record: &Record) -> Result<(), PersistenceError>;
}

/// `SQLite`-backed record store.
pub struct SqliteStore {
    conn: tokio::sync::Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, PersistenceError> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS section_records (
                section_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                record_bytes BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    /// Number of stored section records.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count(&self) -> Result<usize, PersistenceError> {
        let conn = self.conn.lock().await;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM section_records", [], |row| row.get(0))?;
        usize::try_from(count).map_err(|e| PersistenceError::Database(e.to_string()))
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn load(&self, section_id: &str) -> Result<Option<Record>, PersistenceError> {
        let bytes: Option<Vec<u8>> = {
            let conn = self.conn.lock().await;
            conn.query_row(
                "SELECT record_bytes FROM section_records WHERE section_id = ?1",
                [section_id],
                |row| row.get(0),
            )
            .optional()?
        };

        bytes
            .map(|bytes| {
                ciborium::from_reader(bytes.as_slice())
                    .map_err(|e| PersistenceError::Decode(format!("section {section_id}: {e}")))
            })
            .transpose()
    }

    async fn store(&self, record: &Record) -> Result<(), PersistenceError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(record, &mut bytes)
            .map_err(|e| PersistenceError::Encode(e.to_string()))?;
        let now = chrono::Utc::now().timestamp();

        let conn = self.conn.lock().await;
        conn.execute(
            r"
            INSERT OR REPLACE INTO section_records (section_id, name, record_bytes, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            (&record.section_id, &record.name, &bytes, now),
        )?;
        Ok(())
    }
}

/// In-process record store that keeps a log of every write.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Record>>,
    writes: Mutex<Vec<Record>>,
    failures: AtomicU32,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record as if it had been stored earlier. Not logged as a write.
    pub fn insert(&self, record: Record) {
        lock(&self.records).insert(record.section_id.clone(), record);
    }

    /// Make the next `count` stores fail.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Every record passed to a successful `store`, oldest first.
    #[must_use]
    pub fn writes(&self) -> Vec<Record> {
        lock(&self.writes).clone()
    }

    /// Number of successful stores.
    #[must_use]
    pub fn write_count(&self) -> usize {
        lock(&self.writes).len()
    }

    /// Current stored record for a section.
    #[must_use]
    pub fn get(&self, section_id: &str) -> Option<Record> {
        lock(&self.records).get(section_id).cloned()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load(&self, section_id: &str) -> Result<Option<Record>, PersistenceError> {
        Ok(self.get(section_id))
    }

    async fn store(&self, record: &Record) -> Result<(), PersistenceError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PersistenceError::Unavailable(format!(
                "injected failure storing section {}",
                record.section_id
            )));
        }

        lock(&self.records).insert(record.section_id.clone(), record.clone());
        lock(&self.writes).push(record.clone());
        Ok(())
    }
}

/// Errors for record persistence.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PersistenceError {
    /// Database rejected the operation
    #[error("database error: {0}")]
    Database(String),
    /// Record could not be serialized
    #[error("record encode failed: {0}")]
    Encode(String),
    /// Stored record could not be read back
    #[error("record decode failed: {0}")]
    Decode(String),
    /// Store temporarily unable to accept writes
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rainfeed_core::{Calibration, Measure, Reading, Station};

    fn record() -> Record {
        let mut record = Record::new("section-1", "Upper Dart");
        let mut measure = Measure::new(
            Station {
                alias_url: "rloi://5012".to_string(),
                ..Station::default()
            },
            Calibration {
                url: "rloi://5012".to_string(),
                low: Some(0.4),
                ..Calibration::default()
            },
        );
        measure.readings = vec![
            Reading::at_epoch(1_700_000_000, 0.61).unwrap(),
            Reading::at_epoch(1_700_000_900, 0.63).unwrap(),
        ];
        record.measures.push(measure);
        record
    }

    #[tokio::test]
    async fn sqlite_store_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.load("section-1").await.unwrap(), None);

        let before = record();
        store.store(&before).await.unwrap();
        store.store(&before).await.unwrap();

        assert_eq!(store.load("section-1").await.unwrap(), Some(before));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rainfeed.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.store(&record()).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.load("section-1").await.unwrap().unwrap();
        assert_eq!(loaded.measures[0].readings.len(), 2);
    }

    #[tokio::test]
    async fn memory_store_injected_failures() {
        let store = MemoryStore::new();
        store.fail_next(2);

        assert!(matches!(
            store.store(&record()).await,
            Err(PersistenceError::Unavailable(_))
        ));
        assert!(store.store(&record()).await.is_err());
        store.store(&record()).await.unwrap();

        assert_eq!(store.write_count(), 1);
        assert_eq!(store.get("section-1"), Some(record()));
    }
}
