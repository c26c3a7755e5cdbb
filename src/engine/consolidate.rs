// Semantic consolidation: cluster WARM records, synthesize summary records

use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use crate::codec;
use crate::engine::MemoryEngine;
use crate::error::Result;
use crate::index::{AnnIndex, HnswAnnIndex};
use crate::provider::{call_with_retry, GenerateOptions};
use crate::record::{MemoryRecord, MemoryTier, RecordOptions};
use crate::store::{StoreName, StoredRecord};

/// Importance given to synthesized semantic records.
const SUMMARY_IMPORTANCE: f32 = 0.7;

/// Importance attenuation applied to consolidated members.
const MEMBER_ATTENUATION: f32 = 0.8;

/// Neighbors considered per seed during graph-based clustering.
const GRAPH_NEIGHBORS: usize = 50;

/// Member texts included in a summary prompt.
const PROMPT_TEXT_CAP: usize = 20;

impl MemoryEngine {
    /// Cluster the WARM tier and synthesize one semantic summary record
    /// per cluster of two or more members.
    ///
    /// Single-flight: returns empty immediately when a pass is already
    /// running. With `simulate` the would-be summary records are
    /// computed and returned but nothing is written.
    pub async fn consolidate(&self, simulate: bool) -> Result<Vec<MemoryRecord>> {
        self.ensure_initialized()?;
        let Ok(_guard) = self.locks.consolidate.try_lock() else {
            info!("consolidation already in progress, skipping");
            return Ok(Vec::new());
        };

        let members = self.load_warm_records().await?;
        if members.len() < 2 {
            self.records_since_consolidation.store(0, Ordering::SeqCst);
            return Ok(Vec::new());
        }

        let advanced = self.config.use_advanced_clustering
            && members.len() >= self.config.advanced_clustering_threshold;
        let clusters = if advanced {
            self.graph_clusters(&members)?
        } else {
            self.agglomerative_clusters(&members).await?
        };
        debug!(
            records = members.len(),
            clusters = clusters.len(),
            advanced,
            "clustering complete"
        );

        // Centroids of existing semantic records, for redundancy checks
        let existing_semantics: Vec<Vec<f32>> = members
            .iter()
            .filter(|r| !r.episodic)
            .map(|r| r.embedding.clone())
            .collect();

        let mut summaries = Vec::new();
        for cluster in clusters {
            if cluster.len() < 2 {
                continue;
            }
            match self
                .consolidate_cluster(&members, &cluster, &existing_semantics, simulate)
                .await?
            {
                Some(summary) => summaries.push(summary),
                None => continue,
            }
            tokio::task::yield_now().await;
        }

        self.records_since_consolidation.store(0, Ordering::SeqCst);
        info!(
            summaries = summaries.len(),
            simulate, "consolidation pass finished"
        );
        Ok(summaries)
    }

    /// Read every WARM record in configured chunks, yielding between them.
    async fn load_warm_records(&self) -> Result<Vec<MemoryRecord>> {
        let mut records = Vec::new();
        let mut scan = self
            .storage
            .scan_chunks(StoreName::Warm, self.config.consolidation_chunk_size);
        while let Some(chunk) = scan.next_chunk().await? {
            for (_, bytes) in chunk {
                let stored = StoredRecord::decode(&bytes)?;
                let embedding = stored.embedding.to_f32();
                if embedding.len() != self.config.embed_dim {
                    continue;
                }
                records.push(MemoryRecord::from_meta(
                    stored.meta,
                    embedding,
                    MemoryTier::Warm,
                    None,
                    stored.warm_index_handle,
                ));
            }
            tokio::task::yield_now().await;
        }
        Ok(records)
    }

    /// Graph-based clustering: seed a temporary ANN with every vector,
    /// then grow one cluster per unprocessed seed from its near
    /// neighbors, capped per pass.
    fn graph_clusters(&self, members: &[MemoryRecord]) -> Result<Vec<Vec<usize>>> {
        let min_similarity = 1.0 - self.config.cluster_diameter;
        let mut temp = HnswAnnIndex::new(self.config.embed_dim, self.config.hnsw.clone());
        for record in members {
            // Fresh index: handles are assigned densely from zero, so a
            // handle doubles as the member's position
            temp.insert_with_metadata(&record.embedding, record.meta())?;
        }

        let mut processed = vec![false; members.len()];
        let mut clusters = Vec::new();
        for seed in 0..members.len() {
            if processed[seed] {
                continue;
            }
            if clusters.len() >= self.config.max_clusters_per_pass {
                break;
            }
            processed[seed] = true;
            let mut cluster = vec![seed];
            for (handle, _, similarity) in temp.search(&members[seed].embedding, GRAPH_NEIGHBORS) {
                let idx = handle as usize;
                if idx == seed || processed[idx] || similarity < min_similarity {
                    continue;
                }
                processed[idx] = true;
                cluster.push(idx);
            }
            clusters.push(cluster);
        }
        Ok(clusters)
    }

    /// Hierarchical agglomerative clustering (cosine distance, average
    /// linkage) over chunks of WARM records.
    async fn agglomerative_clusters(&self, members: &[MemoryRecord]) -> Result<Vec<Vec<usize>>> {
        let mut clusters = Vec::new();
        let chunk_size = self.config.consolidation_chunk_size;
        let mut offset = 0;
        while offset < members.len() {
            let end = (offset + chunk_size).min(members.len());
            let chunk: Vec<&[f32]> = members[offset..end]
                .iter()
                .map(|r| r.embedding.as_slice())
                .collect();
            for cluster in average_linkage(&chunk, self.config.cluster_diameter)? {
                clusters.push(cluster.into_iter().map(|i| i + offset).collect());
            }
            offset = end;
            tokio::task::yield_now().await;
        }
        Ok(clusters)
    }

    /// Summarize one cluster into a semantic record and link its members.
    async fn consolidate_cluster(
        &self,
        members: &[MemoryRecord],
        cluster: &[usize],
        existing_semantics: &[Vec<f32>],
        simulate: bool,
    ) -> Result<Option<MemoryRecord>> {
        let texts: Vec<&str> = cluster
            .iter()
            .take(PROMPT_TEXT_CAP)
            .map(|&i| members[i].text.as_str())
            .collect();
        let prompt = format!(
            "Summarize the following related notes in one sentence:\n- {}",
            texts.join("\n- ")
        );

        let provider = self.provider.clone();
        let summary = match call_with_retry("generate", || {
            let provider = provider.clone();
            let prompt = prompt.clone();
            async move { provider.generate(&prompt, &GenerateOptions::default()).await }
        })
        .await
        {
            Ok(summary) if !summary.trim().is_empty() => summary.trim().to_string(),
            Ok(_) => {
                warn!("generator returned an empty summary, skipping cluster");
                return Ok(None);
            }
            Err(e) => {
                warn!("summary generation failed, skipping cluster: {e}");
                return Ok(None);
            }
        };

        let mut member_ids: Vec<&str> = cluster.iter().map(|&i| members[i].id.as_str()).collect();
        member_ids.sort_unstable();
        let cluster_id = codec::content_hash(&summary, &member_ids.join(","))[..32].to_string();

        let centroid = centroid_of(cluster.iter().map(|&i| members[i].embedding.as_slice()));

        // Redundant with an existing semantic record: keep the cluster
        // assignment but do not synthesize a duplicate summary
        let redundant = existing_semantics.iter().any(|existing| {
            codec::cosine_similarity(&centroid, existing)
                .map(|sim| sim >= self.config.redundancy_threshold)
                .unwrap_or(false)
        });

        let summary_record = if redundant {
            debug!(cluster_id = %cluster_id, "summary redundant with an existing semantic record");
            None
        } else {
            let mut metadata = serde_json::Map::new();
            metadata.insert(
                "cluster_id".to_string(),
                serde_json::Value::String(cluster_id.clone()),
            );
            metadata.insert(
                "member_count".to_string(),
                serde_json::Value::from(cluster.len()),
            );
            let mut record = MemoryRecord::new(
                summary,
                centroid,
                RecordOptions {
                    episodic: Some(false),
                    importance: Some(SUMMARY_IMPORTANCE),
                    metadata: Some(metadata),
                },
                self.salt()?,
            );
            if !simulate {
                self.insert_warm_record(&mut record).await?;
                self.note_mutations(1);
            }
            Some(record)
        };

        if !simulate {
            for &i in cluster {
                let mut member = members[i].clone();
                member.access(false);
                member.semantic_cluster_id = Some(cluster_id.clone());
                member.importance = (member.importance * MEMBER_ATTENUATION).clamp(0.0, 1.0);
                let moved = self.evaluate_tiering(&mut member).await?;
                if !moved {
                    self.persist_record(&member).await?;
                }
            }
            self.note_mutations(cluster.len() as u64);
        }

        Ok(summary_record)
    }
}

/// Component-wise mean of a set of equal-length vectors.
fn centroid_of<'a>(vectors: impl Iterator<Item = &'a [f32]>) -> Vec<f32> {
    let mut centroid: Vec<f32> = Vec::new();
    let mut count = 0usize;
    for vector in vectors {
        if centroid.is_empty() {
            centroid = vec![0.0; vector.len()];
        }
        for (c, v) in centroid.iter_mut().zip(vector) {
            *c += v;
        }
        count += 1;
    }
    if count > 0 {
        for c in &mut centroid {
            *c /= count as f32;
        }
    }
    centroid
}

/// Average-linkage agglomerative clustering under a cosine-distance
/// diameter. Merges the closest pair until no pair is within `diameter`.
fn average_linkage(vectors: &[&[f32]], diameter: f32) -> Result<Vec<Vec<usize>>> {
    let n = vectors.len();
    if n == 0 {
        return Ok(Vec::new());
    }

    // Pairwise cosine distances
    let mut dist = vec![vec![0.0f32; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d = 1.0 - codec::cosine_similarity(vectors[i], vectors[j])?;
            dist[i][j] = d;
            dist[j][i] = d;
        }
    }

    let mut clusters: Vec<Option<Vec<usize>>> = (0..n).map(|i| Some(vec![i])).collect();
    loop {
        // Closest live pair
        let mut best: Option<(usize, usize, f32)> = None;
        for i in 0..n {
            if clusters[i].is_none() {
                continue;
            }
            for j in (i + 1)..n {
                if clusters[j].is_none() {
                    continue;
                }
                let d = dist[i][j];
                if best.map(|(_, _, bd)| d < bd).unwrap_or(true) {
                    best = Some((i, j, d));
                }
            }
        }
        let Some((i, j, d)) = best else { break };
        if d > diameter {
            break;
        }

        // Lance-Williams update for average linkage
        let size_i = clusters[i].as_ref().map(Vec::len).unwrap_or(0) as f32;
        let size_j = clusters[j].as_ref().map(Vec::len).unwrap_or(0) as f32;
        for k in 0..n {
            if k == i || k == j || clusters[k].is_none() {
                continue;
            }
            let merged =
                (size_i * dist[i][k] + size_j * dist[j][k]) / (size_i + size_j);
            dist[i][k] = merged;
            dist[k][i] = merged;
        }
        let absorbed = clusters[j].take().unwrap_or_default();
        if let Some(target) = clusters[i].as_mut() {
            target.extend(absorbed);
        }
    }

    Ok(clusters.into_iter().flatten().collect())
}
