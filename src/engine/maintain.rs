// Weight-based pruning and integrity verification

use tracing::{debug, info, warn};

use crate::codec;
use crate::engine::MemoryEngine;
use crate::error::Result;
use crate::record::{MemoryRecord, MemoryTier};
use crate::store::{StoreName, StoredRecord};

impl MemoryEngine {
    /// Remove COLD records whose effective weight has decayed below the
    /// prune floor and that were never accessed. Returns the removed ids
    /// (or the would-be-removed ids when simulating).
    pub async fn prune(&self, simulate: bool) -> Result<Vec<String>> {
        self.ensure_initialized()?;
        let Ok(_guard) = self.locks.prune.try_lock() else {
            info!("prune already in progress, skipping");
            return Ok(Vec::new());
        };

        let now = chrono::Utc::now().timestamp_millis();
        let mut pruned = Vec::new();
        let mut scan = self
            .storage
            .scan_chunks(StoreName::Cold, self.config.cold_search_chunk_size);
        while let Some(chunk) = scan.next_chunk().await? {
            for (id, bytes) in chunk {
                let stored = StoredRecord::decode(&bytes)?;
                let record = MemoryRecord::from_meta(
                    stored.meta,
                    Vec::new(),
                    MemoryTier::Cold,
                    None,
                    None,
                );
                if record.usage_count == 0
                    && record.effective_weight(now) < self.config.prune_epsilon
                {
                    pruned.push(id);
                }
            }
            tokio::task::yield_now().await;
        }

        if simulate || pruned.is_empty() {
            debug!(candidates = pruned.len(), simulate, "prune pass finished");
            return Ok(pruned);
        }

        for id in &pruned {
            self.storage.delete(StoreName::Cold, id).await?;
            self.recon_cache.lock().await.pop(id);
        }
        let compaction_due = {
            let mut indexes = self.indexes.lock().await;
            indexes.note_soft_deletes(pruned.len() as u64)
        };
        self.note_mutations(pruned.len() as u64);
        if compaction_due {
            self.schedule_compaction();
        }
        info!(removed = pruned.len(), "pruned decayed COLD records");
        Ok(pruned)
    }

    /// Recompute every live record's content hash; quarantine records
    /// whose hash no longer matches and return their ids.
    ///
    /// Quarantine removes the record from its ANN indexes and KV rows;
    /// no repair is attempted, so a second run returns an empty list.
    pub async fn verify_integrity(&self) -> Result<Vec<String>> {
        self.ensure_initialized()?;
        let salt = self.salt()?.to_string();
        let mut corrupted = Vec::new();
        let mut deletions = 0u64;

        // HOT: node metadata is the record
        let hot_nodes = {
            let indexes = self.indexes.lock().await;
            indexes.hot().all_metadata()
        };
        for (handle, meta) in hot_nodes {
            if codec::content_hash(&meta.text, &salt) != meta.integrity_hash {
                warn!(id = %meta.id, "integrity violation in HOT, quarantining");
                let mut indexes = self.indexes.lock().await;
                if indexes.hot_mut().soft_delete(handle) {
                    deletions += 1;
                }
                corrupted.push(meta.id);
            }
        }

        // WARM rows (and their mirrored index nodes)
        for (id, bytes) in self.storage.get_all(StoreName::Warm).await? {
            let stored = StoredRecord::decode(&bytes)?;
            if codec::content_hash(&stored.meta.text, &salt) != stored.meta.integrity_hash {
                warn!(id = %id, "integrity violation in WARM, quarantining");
                if let Some(handle) = stored.warm_index_handle {
                    let mut indexes = self.indexes.lock().await;
                    if indexes.warm_mut().soft_delete(handle) {
                        deletions += 1;
                    }
                }
                self.storage.delete(StoreName::Warm, &id).await?;
                corrupted.push(id);
            }
        }

        // COLD rows
        for (id, bytes) in self.storage.get_all(StoreName::Cold).await? {
            let stored = StoredRecord::decode(&bytes)?;
            if codec::content_hash(&stored.meta.text, &salt) != stored.meta.integrity_hash {
                warn!(id = %id, "integrity violation in COLD, quarantining");
                self.storage.delete(StoreName::Cold, &id).await?;
                corrupted.push(id);
            }
        }

        if !corrupted.is_empty() {
            {
                let mut cache = self.recon_cache.lock().await;
                for id in &corrupted {
                    cache.pop(id);
                }
            }
            let compaction_due = {
                let mut indexes = self.indexes.lock().await;
                deletions > 0 && indexes.note_soft_deletes(deletions)
            };
            self.note_mutations(corrupted.len() as u64);
            if compaction_due {
                self.schedule_compaction();
            }
        }

        corrupted.sort_unstable();
        corrupted.dedup();
        Ok(corrupted)
    }
}
