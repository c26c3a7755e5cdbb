// Cascaded HOT → WARM → COLD retrieval with decay-weighted rescoring

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec;
use crate::engine::MemoryEngine;
use crate::error::{MemoryError, Result};
use crate::provider::call_with_retry;
use crate::record::{MemoryRecord, MemoryTier};
use crate::store::{StoreName, StoredRecord};

/// How long a non-simulated search waits for the search lock.
const SEARCH_LOCK_WAIT: Duration = Duration::from_secs(30);

/// Result filters applied after rescoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Keep only records with this episodic flag
    pub episodic: Option<bool>,
    /// Keep only records at or above this importance
    pub min_importance: Option<f32>,
    /// Keep only candidates at or above this raw ANN similarity
    pub min_similarity: Option<f32>,
    /// Keep only records whose metadata contains these exact pairs
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Search options.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Side-effect-free dry run: no access bumps, no persistence, no
    /// tier transitions, and no search lock
    pub simulate: bool,
    /// Result filters
    pub filters: SearchFilters,
}

/// One scored search result.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    /// The matched record
    pub record: MemoryRecord,
    /// Raw ANN cosine similarity in [0, 1]
    pub similarity: f32,
    /// Composite score: similarity · effective_weight
    pub score: f32,
}

impl MemoryEngine {
    /// Retrieve the top `k` records for `query`, cascading HOT → WARM →
    /// COLD until enough candidates are pooled, rescoring by decay
    /// weight, and driving promotion/demotion from the returned top-k.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        options: SearchOptions,
    ) -> Result<Vec<ScoredRecord>> {
        self.ensure_initialized()?;
        if query.trim().is_empty() {
            return Err(MemoryError::InvalidInput("query must not be empty".to_string()));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        // Simulated searches are read-only and skip the lock entirely
        let _guard = if options.simulate {
            None
        } else {
            match tokio::time::timeout(SEARCH_LOCK_WAIT, self.locks.search.lock()).await {
                Ok(guard) => Some(guard),
                Err(_) => {
                    return Err(MemoryError::LockTimeout {
                        lock: "search",
                        waited_ms: SEARCH_LOCK_WAIT.as_millis() as u64,
                    })
                }
            }
        };

        let provider = self.provider.clone();
        let owned = query.to_string();
        let query_vec = call_with_retry("embed", || {
            let provider = provider.clone();
            let text = owned.clone();
            async move { provider.embed(&text).await }
        })
        .await?;
        self.check_dimension(&query_vec)?;

        let now = chrono::Utc::now().timestamp_millis();
        let mut candidates = self.collect_candidates(&query_vec, k).await?;

        // Access bump for every candidate; only the top-k get persisted
        for (record, _) in candidates.iter_mut() {
            record.access(options.simulate);
        }

        let mut scored: Vec<ScoredRecord> = candidates
            .into_iter()
            .map(|(record, similarity)| {
                let score = similarity * record.effective_weight(now);
                ScoredRecord {
                    record,
                    similarity,
                    score,
                }
            })
            .filter(|s| passes_filters(s, &options.filters))
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        if !options.simulate {
            for result in scored.iter_mut() {
                let moved = self.evaluate_tiering(&mut result.record).await?;
                if !moved {
                    self.persist_record(&result.record).await?;
                }
            }
            self.note_mutations(scored.len() as u64);
        }

        Ok(scored)
    }

    /// Pool up to 2k candidates: HOT first, WARM for the remainder, then
    /// a chunked linear scan over COLD.
    async fn collect_candidates(
        &self,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<(MemoryRecord, f32)>> {
        let want = 2 * k;
        let mut seen: HashSet<String> = HashSet::new();
        let mut out: Vec<(MemoryRecord, f32)> = Vec::new();

        {
            let indexes = self.indexes.lock().await;

            for (handle, meta, similarity) in indexes.hot().search(query_vec, want) {
                if !seen.insert(meta.id.clone()) {
                    continue;
                }
                let embedding = indexes.hot().get_vector(handle).unwrap_or_default();
                out.push((
                    MemoryRecord::from_meta(meta, embedding, MemoryTier::Hot, Some(handle), None),
                    similarity,
                ));
            }

            if out.len() < want {
                let warm_hits = indexes.warm().search(query_vec, want - out.len());
                for (handle, meta, similarity) in warm_hits {
                    if seen.contains(&meta.id) {
                        continue;
                    }
                    // The WARM row is authoritative; the node metadata is a mirror
                    let record = match self.storage.get(StoreName::Warm, &meta.id).await? {
                        Some(bytes) => {
                            let stored = StoredRecord::decode(&bytes)?;
                            let embedding = stored.embedding.to_f32();
                            MemoryRecord::from_meta(
                                stored.meta,
                                embedding,
                                MemoryTier::Warm,
                                None,
                                stored.warm_index_handle.or(Some(handle)),
                            )
                        }
                        None => {
                            let embedding = indexes.warm().get_vector(handle).unwrap_or_default();
                            MemoryRecord::from_meta(
                                meta,
                                embedding,
                                MemoryTier::Warm,
                                None,
                                Some(handle),
                            )
                        }
                    };
                    seen.insert(record.id.clone());
                    out.push((record, similarity));
                }
            }
        }

        if out.len() < want {
            let cold = self.scan_cold(query_vec, k, &seen).await?;
            let remaining = want - out.len();
            out.extend(cold.into_iter().take(remaining));
        }

        debug!(candidates = out.len(), "candidate pool assembled");
        Ok(out)
    }

    /// Chunked linear cosine scan over the COLD store, exiting early once
    /// the scored pool reaches 5·limit.
    async fn scan_cold(
        &self,
        query_vec: &[f32],
        limit: usize,
        seen: &HashSet<String>,
    ) -> Result<Vec<(MemoryRecord, f32)>> {
        let mut pool: Vec<(MemoryRecord, f32)> = Vec::new();
        let mut scan = self
            .storage
            .scan_chunks(StoreName::Cold, self.config.cold_search_chunk_size);

        'scan: while let Some(chunk) = scan.next_chunk().await? {
            for (id, bytes) in chunk {
                if seen.contains(&id) {
                    continue;
                }
                let stored = StoredRecord::decode(&bytes)?;
                let embedding = stored.embedding.to_f32();
                let similarity = match codec::cosine_similarity(query_vec, &embedding) {
                    Ok(sim) => sim.clamp(0.0, 1.0),
                    Err(_) => {
                        warn!(id = %id, "cold record has a mismatched dimension, skipping");
                        continue;
                    }
                };
                pool.push((
                    MemoryRecord::from_meta(
                        stored.meta,
                        embedding,
                        MemoryTier::Cold,
                        None,
                        None,
                    ),
                    similarity,
                ));
                if pool.len() >= 5 * limit {
                    break 'scan;
                }
            }
            tokio::task::yield_now().await;
        }

        pool.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(pool)
    }
}

fn passes_filters(result: &ScoredRecord, filters: &SearchFilters) -> bool {
    if let Some(min) = filters.min_similarity {
        if result.similarity < min {
            return false;
        }
    }
    if let Some(episodic) = filters.episodic {
        if result.record.episodic != episodic {
            return false;
        }
    }
    if let Some(min) = filters.min_importance {
        if result.record.importance < min {
            return false;
        }
    }
    for (key, expected) in &filters.metadata {
        if result.record.metadata.get(key) != Some(expected) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordOptions;

    fn scored(similarity: f32, record: MemoryRecord) -> ScoredRecord {
        ScoredRecord {
            score: similarity,
            similarity,
            record,
        }
    }

    fn record_with(episodic: bool, importance: f32) -> MemoryRecord {
        let mut metadata = serde_json::Map::new();
        metadata.insert("topic".to_string(), serde_json::json!("geography"));
        MemoryRecord::new(
            "text".to_string(),
            vec![0.0; 3],
            RecordOptions {
                episodic: Some(episodic),
                importance: Some(importance),
                metadata: Some(metadata),
            },
            "salt",
        )
    }

    #[test]
    fn test_episodic_filter() {
        let filters = SearchFilters {
            episodic: Some(false),
            ..Default::default()
        };
        assert!(!passes_filters(&scored(0.9, record_with(true, 0.5)), &filters));
        assert!(passes_filters(&scored(0.9, record_with(false, 0.5)), &filters));
    }

    #[test]
    fn test_min_importance_filter() {
        let filters = SearchFilters {
            min_importance: Some(0.6),
            ..Default::default()
        };
        assert!(!passes_filters(&scored(0.9, record_with(true, 0.5)), &filters));
        assert!(passes_filters(&scored(0.9, record_with(true, 0.7)), &filters));
    }

    #[test]
    fn test_min_similarity_filter() {
        let filters = SearchFilters {
            min_similarity: Some(0.5),
            ..Default::default()
        };
        assert!(!passes_filters(&scored(0.4, record_with(true, 0.5)), &filters));
        assert!(passes_filters(&scored(0.6, record_with(true, 0.5)), &filters));
    }

    #[test]
    fn test_metadata_equality_filter() {
        let mut filters = SearchFilters::default();
        filters
            .metadata
            .insert("topic".to_string(), serde_json::json!("geography"));
        assert!(passes_filters(&scored(0.9, record_with(true, 0.5)), &filters));

        filters
            .metadata
            .insert("topic".to_string(), serde_json::json!("history"));
        assert!(!passes_filters(&scored(0.9, record_with(true, 0.5)), &filters));

        filters.metadata.clear();
        filters
            .metadata
            .insert("missing".to_string(), serde_json::json!(true));
        assert!(!passes_filters(&scored(0.9, record_with(true, 0.5)), &filters));
    }
}
