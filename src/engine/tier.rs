// Tier placement: promotion, demotion, and embedding reconstruction

use tracing::{debug, warn};

use crate::codec;
use crate::engine::MemoryEngine;
use crate::error::Result;
use crate::record::{MemoryRecord, MemoryTier};
use crate::store::{StoreName, StoredEmbedding, StoredRecord};

impl MemoryEngine {
    /// Recover a record's float32 embedding by id: reconstruction cache,
    /// then WARM (float16), then COLD (int8).
    pub(crate) async fn reconstruct_embedding(&self, id: &str) -> Result<Option<Vec<f32>>> {
        if let Some(hit) = self.recon_cache.lock().await.get(id) {
            return Ok(Some(hit.clone()));
        }

        let stored = match self.storage.get(StoreName::Warm, id).await? {
            Some(bytes) => Some(StoredRecord::decode(&bytes)?),
            None => match self.storage.get(StoreName::Cold, id).await? {
                Some(bytes) => Some(StoredRecord::decode(&bytes)?),
                None => None,
            },
        };

        let Some(stored) = stored else {
            return Ok(None);
        };
        let embedding = stored.embedding.to_f32();
        self.recon_cache
            .lock()
            .await
            .put(id.to_string(), embedding.clone());
        Ok(Some(embedding))
    }

    /// Make sure `record.embedding` holds the full vector, reloading it
    /// from the index side-table or the tier stores when missing.
    pub(crate) async fn ensure_embedding(&self, record: &mut MemoryRecord) -> Result<bool> {
        if record.embedding.len() == self.config.embed_dim {
            return Ok(true);
        }
        if let Some(handle) = record.hot_index_handle {
            let indexes = self.indexes.lock().await;
            if let Some(vector) = indexes.hot().get_vector(handle) {
                record.embedding = vector;
                return Ok(true);
            }
        }
        match self.reconstruct_embedding(&record.id).await? {
            Some(embedding) => {
                record.embedding = embedding;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Apply the promotion rule, then the demotion rule, to one record.
    /// Returns true when the record changed tier.
    pub(crate) async fn evaluate_tiering(&self, record: &mut MemoryRecord) -> Result<bool> {
        let now = chrono::Utc::now().timestamp_millis();

        if record.current_tier != MemoryTier::Hot
            && (record.effective_weight(now) >= self.config.hot_weight_threshold
                || record.usage_count >= self.config.hot_usage_threshold)
        {
            return self.promote_to_hot(record).await;
        }

        if record.decay_score(now) < self.config.warm_decay_threshold
            && record.usage_count < self.config.demotion_usage_threshold
        {
            return match record.current_tier {
                MemoryTier::Hot => self.demote_hot_to_warm(record).await,
                MemoryTier::Warm => self.demote_warm_to_cold(record).await,
                _ => Ok(false),
            };
        }

        Ok(false)
    }

    /// Move a WARM or COLD record into the HOT index.
    pub(crate) async fn promote_to_hot(&self, record: &mut MemoryRecord) -> Result<bool> {
        if !self.ensure_embedding(record).await? {
            warn!(id = %record.id, "cannot promote without an embedding");
            return Ok(false);
        }

        self.storage.delete(StoreName::Warm, &record.id).await?;
        self.storage.delete(StoreName::Cold, &record.id).await?;

        let compaction_due = {
            let mut indexes = self.indexes.lock().await;
            let mut deletions = 0;
            if let Some(handle) = record.warm_index_handle.take() {
                if indexes.warm_mut().soft_delete(handle) {
                    deletions += 1;
                }
            }
            let handle = indexes
                .hot_mut()
                .insert_with_metadata(&record.embedding, record.meta())?;
            record.hot_index_handle = Some(handle);
            deletions > 0 && indexes.note_soft_deletes(deletions)
        };

        record.current_tier = MemoryTier::Hot;
        self.recon_cache
            .lock()
            .await
            .put(record.id.clone(), record.embedding.clone());
        debug!(id = %record.id, "promoted to HOT");
        self.note_mutations(1);
        if compaction_due {
            self.schedule_compaction();
        }
        Ok(true)
    }

    /// Move a HOT record back into the WARM tier.
    pub(crate) async fn demote_hot_to_warm(&self, record: &mut MemoryRecord) -> Result<bool> {
        // Reload the vector before touching the HOT node; demoting from
        // stale in-memory metadata would write an empty embedding
        if !self.ensure_embedding(record).await? {
            warn!(id = %record.id, "cannot demote without an embedding");
            return Ok(false);
        }

        let (warm_handle, compaction_due) = {
            let mut indexes = self.indexes.lock().await;
            let mut deletions = 0;
            if let Some(handle) = record.hot_index_handle.take() {
                if indexes.hot_mut().soft_delete(handle) {
                    deletions += 1;
                }
            }
            let handle = indexes
                .warm_mut()
                .insert_with_metadata(&record.embedding, record.meta())?;
            (handle, deletions > 0 && indexes.note_soft_deletes(deletions))
        };

        record.warm_index_handle = Some(warm_handle);
        record.current_tier = MemoryTier::Warm;
        let stored = StoredRecord {
            meta: record.meta(),
            embedding: StoredEmbedding::Half(codec::quantize_vec_f16(&record.embedding)),
            warm_index_handle: Some(warm_handle),
        };
        self.storage
            .put(StoreName::Warm, &record.id, &stored.encode()?)
            .await?;

        debug!(id = %record.id, "demoted to WARM");
        self.note_mutations(1);
        if compaction_due {
            self.schedule_compaction();
        }
        Ok(true)
    }

    /// Move a WARM record into the COLD store.
    pub(crate) async fn demote_warm_to_cold(&self, record: &mut MemoryRecord) -> Result<bool> {
        if !self.ensure_embedding(record).await? {
            warn!(id = %record.id, "cannot demote without an embedding");
            return Ok(false);
        }

        let compaction_due = {
            let mut indexes = self.indexes.lock().await;
            let mut deletions = 0;
            if let Some(handle) = record.warm_index_handle.take() {
                if indexes.warm_mut().soft_delete(handle) {
                    deletions += 1;
                }
            }
            deletions > 0 && indexes.note_soft_deletes(deletions)
        };
        self.storage.delete(StoreName::Warm, &record.id).await?;

        record.hot_index_handle = None;
        record.current_tier = MemoryTier::Cold;
        let stored = StoredRecord {
            meta: record.meta(),
            embedding: StoredEmbedding::Int8(codec::quantize_vec_i8(&record.embedding)),
            warm_index_handle: None,
        };
        self.storage
            .put(StoreName::Cold, &record.id, &stored.encode()?)
            .await?;

        debug!(id = %record.id, "demoted to COLD");
        self.note_mutations(1);
        if compaction_due {
            self.schedule_compaction();
        }
        Ok(true)
    }

    /// Persist a record's scalar fields to its current tier backing.
    pub(crate) async fn persist_record(&self, record: &MemoryRecord) -> Result<()> {
        match record.current_tier {
            MemoryTier::Hot => {
                if let Some(handle) = record.hot_index_handle {
                    let mut indexes = self.indexes.lock().await;
                    indexes.hot_mut().update_metadata(handle, record.meta())?;
                }
            }
            MemoryTier::Warm => {
                let stored = StoredRecord {
                    meta: record.meta(),
                    embedding: StoredEmbedding::Half(codec::quantize_vec_f16(&record.embedding)),
                    warm_index_handle: record.warm_index_handle,
                };
                self.storage
                    .put(StoreName::Warm, &record.id, &stored.encode()?)
                    .await?;
                if let Some(handle) = record.warm_index_handle {
                    let mut indexes = self.indexes.lock().await;
                    // The WARM node mirrors the row; a missing node only
                    // means the row was restored after a crash
                    if indexes.warm_mut().update_metadata(handle, record.meta()).is_err() {
                        debug!(id = %record.id, handle, "warm node missing during persist");
                    }
                }
            }
            MemoryTier::Cold => {
                let stored = StoredRecord {
                    meta: record.meta(),
                    embedding: StoredEmbedding::Int8(codec::quantize_vec_i8(&record.embedding)),
                    warm_index_handle: None,
                };
                self.storage
                    .put(StoreName::Cold, &record.id, &stored.encode()?)
                    .await?;
            }
            MemoryTier::Unknown => {
                warn!(id = %record.id, "refusing to persist a record with no tier");
            }
        }
        Ok(())
    }
}
