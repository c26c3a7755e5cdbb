// Append-only write journal
//
// *Le Journal* (The Journal) - Monotonic write-ahead log of record snapshots

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::store::{load_journal_counter, Storage, StoredRecord};

/// One journal row: a write-ahead snapshot of a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Strictly monotonic sequence number
    pub seq: u64,
    /// Id of the journaled record
    pub record_id: String,
    /// Append time (epoch ms)
    pub timestamp: i64,
    /// The record as it was written, WARM (float16) form
    pub snapshot: StoredRecord,
}

/// Monotonic append-only journal over the `journal` store.
///
/// The sequence counter is persisted to the meta store inside the same
/// transaction as every append, so it survives restart even if the
/// process dies immediately after the write.
pub struct Journal {
    storage: Storage,
    counter: AtomicU64,
    rotation_size: u64,
}

impl Journal {
    /// Build a journal handle with the counter at zero; call
    /// [`restore`](Self::restore) before appending.
    pub fn new(storage: Storage, rotation_size: u64) -> Self {
        Self {
            storage,
            counter: AtomicU64::new(0),
            rotation_size,
        }
    }

    /// Open the journal, restoring the persisted counter.
    pub async fn open(storage: Storage, rotation_size: u64) -> Result<Self> {
        let journal = Self::new(storage, rotation_size);
        journal.restore().await?;
        Ok(journal)
    }

    /// Reload the persisted counter; never moves the counter backwards.
    pub async fn restore(&self) -> Result<()> {
        let persisted = load_journal_counter(&self.storage).await?;
        self.counter.fetch_max(persisted, Ordering::SeqCst);
        debug!(counter = self.counter(), "journal counter restored");
        Ok(())
    }

    /// Current value of the sequence counter.
    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Append a record snapshot; returns the assigned sequence number.
    pub async fn append(&self, record_id: &str, snapshot: StoredRecord) -> Result<u64> {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = JournalEntry {
            seq,
            record_id: record_id.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            snapshot,
        };
        let bytes = bincode::serialize(&entry)?;
        self.storage.journal_append(seq, &bytes).await?;
        Ok(seq)
    }

    /// Number of rows currently held.
    pub async fn len(&self) -> Result<u64> {
        self.storage.journal_count().await
    }

    /// True when no rows are held.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Decode every held entry, oldest first.
    pub async fn entries(&self) -> Result<Vec<JournalEntry>> {
        let mut out = Vec::new();
        let mut after = 0u64;
        loop {
            let rows = self.storage.journal_scan(after, 1000).await?;
            if rows.is_empty() {
                break;
            }
            after = rows.last().map(|(seq, _)| *seq).unwrap_or(after);
            for (_, bytes) in rows {
                out.push(bincode::deserialize(&bytes)?);
            }
        }
        Ok(out)
    }

    /// Trim the oldest rows if the journal has reached its rotation size.
    ///
    /// Keeps the newest half so recent write-ahead history survives the
    /// rotation. Returns how many rows were removed.
    pub async fn rotate_if_needed(&self) -> Result<u64> {
        if self.storage.journal_count().await? < self.rotation_size {
            return Ok(0);
        }
        self.rotate().await
    }

    /// Unconditionally trim down to the newest half of the rotation size.
    pub async fn rotate(&self) -> Result<u64> {
        let keep = (self.rotation_size / 2).max(1);
        let removed = self.storage.journal_trim(keep).await?;
        if removed > 0 {
            info!(removed, keep, "journal rotated");
        }
        Ok(removed)
    }

    /// Drop all rows. The persisted counter is preserved so sequence
    /// numbers stay monotonic across a clear.
    pub async fn clear(&self) -> Result<()> {
        self.storage.journal_clear().await
    }
}
