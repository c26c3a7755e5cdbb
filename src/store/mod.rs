// Persistent storage layer
//
// *Le Stockage* (The Storage) - Five logical KV stores over one SQLite database

pub mod journal;

pub use journal::{Journal, JournalEntry};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::codec;
use crate::error::Result;
use crate::record::RecordMeta;

/// Meta key for the per-instance content-hash salt.
pub const META_SALT: &str = "salt";

/// Meta key for the exportable symmetric key material.
pub const META_ENCRYPTION_KEY: &str = "encryption_key";

/// Meta key for the persisted journal counter.
pub const META_JOURNAL_COUNTER: &str = "journal_counter";

/// The string-keyed logical stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreName {
    /// Reserved for future use
    Core,
    /// WARM records, float16 embeddings
    Warm,
    /// COLD records, int8 embeddings
    Cold,
    /// Singleton entries: salt, key material, journal counter
    Meta,
}

impl StoreName {
    fn table(self) -> &'static str {
        match self {
            StoreName::Core => "kv_core",
            StoreName::Warm => "kv_warm",
            StoreName::Cold => "kv_cold",
            StoreName::Meta => "kv_meta",
        }
    }
}

/// Quantized embedding payload of a stored record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StoredEmbedding {
    /// IEEE-754 binary16 bit patterns (WARM tier)
    Half(Vec<u16>),
    /// Int8 components (COLD tier)
    Int8(Vec<i8>),
}

impl StoredEmbedding {
    /// Decode back to float32.
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            StoredEmbedding::Half(bits) => codec::dequantize_vec_f16(bits),
            StoredEmbedding::Int8(bytes) => codec::dequantize_vec_i8(bytes),
        }
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        match self {
            StoredEmbedding::Half(bits) => bits.len(),
            StoredEmbedding::Int8(bytes) => bytes.len(),
        }
    }

    /// True when the payload holds no components.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// KV row for a WARM or COLD record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Scalar record fields
    pub meta: RecordMeta,
    /// Quantized embedding
    pub embedding: StoredEmbedding,
    /// Live WARM index handle, when the row belongs to the WARM tier
    pub warm_index_handle: Option<u64>,
}

impl StoredRecord {
    /// Serialize for storage.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from a stored value.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv_core (key TEXT PRIMARY KEY, value BLOB NOT NULL);
CREATE TABLE IF NOT EXISTS kv_warm (key TEXT PRIMARY KEY, value BLOB NOT NULL);
CREATE TABLE IF NOT EXISTS kv_cold (key TEXT PRIMARY KEY, value BLOB NOT NULL);
CREATE TABLE IF NOT EXISTS kv_meta (key TEXT PRIMARY KEY, value BLOB NOT NULL);
CREATE TABLE IF NOT EXISTS journal (seq INTEGER PRIMARY KEY, value BLOB NOT NULL);
";

/// Async adapter over the five logical stores.
///
/// A single writer connection in WAL mode, shared behind a tokio mutex;
/// every operation suspends at the lock and runs its statement inline
/// (single logical executor, no cross-call transactions).
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Storage {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Path of the underlying database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace one value.
    pub async fn put(&self, store: StoreName, key: &str, value: &[u8]) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
                store.table()
            ),
            params![key, value],
        )?;
        Ok(())
    }

    /// Insert or replace many values in one transaction.
    pub async fn put_batch(&self, store: StoreName, items: &[(String, Vec<u8>)]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
                store.table()
            ))?;
            for (key, value) in items {
                stmt.execute(params![key, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Fetch one value.
    pub async fn get(&self, store: StoreName, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", store.table()),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Fetch every (key, value) pair, key-ordered.
    pub async fn get_all(&self, store: StoreName) -> Result<Vec<(String, Vec<u8>)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT key, value FROM {} ORDER BY key",
            store.table()
        ))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Chunked cursor over a store, bounding peak memory for large scans.
    pub fn scan_chunks(&self, store: StoreName, chunk_size: usize) -> KvScan {
        KvScan {
            storage: self.clone(),
            store,
            after: None,
            chunk_size: chunk_size.max(1),
            done: false,
        }
    }

    pub(crate) async fn scan_after(
        &self,
        store: StoreName,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT key, value FROM {} WHERE key > ?1 ORDER BY key LIMIT ?2",
            store.table()
        ))?;
        let rows = stmt
            .query_map(params![after.unwrap_or(""), limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Delete one key; returns true when a row was removed.
    pub async fn delete(&self, store: StoreName, key: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            &format!("DELETE FROM {} WHERE key = ?1", store.table()),
            params![key],
        )?;
        Ok(removed > 0)
    }

    /// Count the rows of a store.
    pub async fn count(&self, store: StoreName) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", store.table()),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// List the keys of a store, key-ordered.
    pub async fn keys(&self, store: StoreName) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!("SELECT key FROM {} ORDER BY key", store.table()))?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    /// Remove every row of a store.
    pub async fn clear(&self, store: StoreName) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(&format!("DELETE FROM {}", store.table()), [])?;
        Ok(())
    }

    // Journal table operations: integer keyed, append-only.

    /// Write a journal row and persist the counter in the same transaction.
    pub(crate) async fn journal_append(&self, seq: u64, value: &[u8]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO journal (seq, value) VALUES (?1, ?2)",
            params![seq as i64, value],
        )?;
        let stored: Option<Vec<u8>> = tx
            .query_row(
                "SELECT value FROM kv_meta WHERE key = ?1",
                params![META_JOURNAL_COUNTER],
                |row| row.get(0),
            )
            .optional()?;
        let current = stored
            .as_deref()
            .and_then(decode_counter)
            .unwrap_or(0)
            .max(seq);
        tx.execute(
            "INSERT OR REPLACE INTO kv_meta (key, value) VALUES (?1, ?2)",
            params![META_JOURNAL_COUNTER, current.to_be_bytes().to_vec()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Read journal rows with seq greater than `after`, ascending.
    pub async fn journal_scan(&self, after: u64, limit: usize) -> Result<Vec<(u64, Vec<u8>)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT seq, value FROM journal WHERE seq > ?1 ORDER BY seq LIMIT ?2")?;
        let rows = stmt
            .query_map(params![after as i64, limit as i64], |row| {
                Ok((row.get::<_, i64>(0)? as u64, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Count journal rows.
    pub async fn journal_count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM journal", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Keep only the newest `keep` journal rows; returns how many were removed.
    pub async fn journal_trim(&self, keep: u64) -> Result<u64> {
        let conn = self.conn.lock().await;
        let cutoff: Option<i64> = conn
            .query_row(
                "SELECT seq FROM journal ORDER BY seq DESC LIMIT 1 OFFSET ?1",
                params![keep.saturating_sub(1) as i64],
                |row| row.get(0),
            )
            .optional()?;
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };
        let removed = conn.execute("DELETE FROM journal WHERE seq < ?1", params![cutoff])?;
        Ok(removed as u64)
    }

    /// Remove every journal row. The persisted counter is left untouched.
    pub async fn journal_clear(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM journal", [])?;
        Ok(())
    }
}

fn decode_counter(bytes: &[u8]) -> Option<u64> {
    bytes.try_into().ok().map(u64::from_be_bytes)
}

/// Read the persisted journal counter, defaulting to zero.
pub async fn load_journal_counter(storage: &Storage) -> Result<u64> {
    let value = storage.get(StoreName::Meta, META_JOURNAL_COUNTER).await?;
    Ok(value.as_deref().and_then(decode_counter).unwrap_or(0))
}

/// Chunked scan cursor produced by [`Storage::scan_chunks`].
pub struct KvScan {
    storage: Storage,
    store: StoreName,
    after: Option<String>,
    chunk_size: usize,
    done: bool,
}

impl KvScan {
    /// Fetch the next chunk, or `None` once the store is exhausted.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<(String, Vec<u8>)>>> {
        if self.done {
            return Ok(None);
        }
        let rows = self
            .storage
            .scan_after(self.store, self.after.as_deref(), self.chunk_size)
            .await?;
        if rows.len() < self.chunk_size {
            self.done = true;
        }
        if rows.is_empty() {
            return Ok(None);
        }
        self.after = rows.last().map(|(k, _)| k.clone());
        Ok(Some(rows))
    }
}
