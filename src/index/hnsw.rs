// HNSW-backed ANN index
//
// Wraps hnsw_rs with engine-assigned handles, a side-table of live
// vectors, tombstoned deletion, and snapshot persistence. The graph
// itself cannot return vectors or drop nodes, so the side-table is
// authoritative for reconstruction, compaction, and save/load.

use std::collections::HashMap;
use std::path::Path;

use hnsw_rs::prelude::{DistCosine, Hnsw};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MemoryError, Result};
use crate::index::{AnnIndex, CompactStats, Handle};
use crate::record::RecordMeta;

/// HNSW construction and search parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswParams {
    /// Bidirectional links per node
    pub m: usize,
    /// Neighbors considered during construction
    pub ef_construction: usize,
    /// Neighbors considered during search
    pub ef_search: usize,
    /// Capacity hint for the graph
    pub max_elements: usize,
    /// Maximum graph layers
    pub max_layer: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 50,
            max_elements: 100_000,
            max_layer: 16,
        }
    }
}

impl HnswParams {
    /// Validate parameter sanity.
    pub fn validate(&self) -> Result<()> {
        if self.m == 0 {
            return Err(MemoryError::Index("m must be > 0".to_string()));
        }
        if self.ef_construction < self.m {
            return Err(MemoryError::Index("ef_construction must be >= m".to_string()));
        }
        if self.ef_search == 0 {
            return Err(MemoryError::Index("ef_search must be > 0".to_string()));
        }
        if self.max_elements == 0 || self.max_layer == 0 {
            return Err(MemoryError::Index(
                "max_elements and max_layer must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

struct NodeEntry {
    vector: Vec<f32>,
    meta: RecordMeta,
    internal_id: usize,
    deleted: bool,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    dimension: usize,
    next_handle: Handle,
    params: HnswParams,
    nodes: Vec<(Handle, Vec<f32>, RecordMeta)>,
}

/// Production [`AnnIndex`] backed by an HNSW graph.
pub struct HnswAnnIndex {
    hnsw: Hnsw<f32, DistCosine>,
    nodes: HashMap<Handle, NodeEntry>,
    by_internal: HashMap<usize, Handle>,
    next_handle: Handle,
    next_internal: usize,
    live: usize,
    dimension: usize,
    params: HnswParams,
}

impl HnswAnnIndex {
    /// Create an empty index for vectors of `dimension` components.
    pub fn new(dimension: usize, params: HnswParams) -> Self {
        let hnsw = build_graph(&params);
        Self {
            hnsw,
            nodes: HashMap::new(),
            by_internal: HashMap::new(),
            next_handle: 0,
            next_internal: 0,
            live: 0,
            dimension,
            params,
        }
    }

    fn deleted_count(&self) -> usize {
        self.nodes.len() - self.live
    }

    fn rebuild_from_live(&mut self) {
        self.hnsw = build_graph(&self.params);
        self.by_internal.clear();
        self.next_internal = 0;
        self.nodes.retain(|_, node| !node.deleted);
        for (handle, node) in self.nodes.iter_mut() {
            let internal_id = self.next_internal;
            self.next_internal += 1;
            node.internal_id = internal_id;
            self.hnsw.insert((&node.vector, internal_id));
            self.by_internal.insert(internal_id, *handle);
        }
        self.live = self.nodes.len();
    }
}

fn build_graph(params: &HnswParams) -> Hnsw<f32, DistCosine> {
    Hnsw::new(
        params.m,
        params.max_elements,
        params.max_layer,
        params.ef_construction,
        DistCosine {},
    )
}

impl AnnIndex for HnswAnnIndex {
    fn insert_with_metadata(&mut self, vector: &[f32], meta: RecordMeta) -> Result<Handle> {
        if vector.len() != self.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }

        let handle = self.next_handle;
        self.next_handle += 1;
        let internal_id = self.next_internal;
        self.next_internal += 1;

        let vector = vector.to_vec();
        self.hnsw.insert((&vector, internal_id));
        self.by_internal.insert(internal_id, handle);
        self.nodes.insert(
            handle,
            NodeEntry {
                vector,
                meta,
                internal_id,
                deleted: false,
            },
        );
        self.live += 1;
        Ok(handle)
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(Handle, RecordMeta, f32)> {
        if query.len() != self.dimension || self.live == 0 || k == 0 {
            return Vec::new();
        }

        // Over-fetch by the tombstone count so filtering cannot starve k
        let knbn = (k + self.deleted_count()).min(self.nodes.len());
        let ef = self.params.ef_search.max(knbn);
        let neighbours = self.hnsw.search(query, knbn, ef);

        let mut output = Vec::new();
        for neighbour in neighbours {
            let Some(handle) = self.by_internal.get(&neighbour.d_id) else {
                continue;
            };
            let Some(node) = self.nodes.get(handle) else {
                continue;
            };
            if node.deleted {
                continue;
            }
            // DistCosine distance = 1 - cosine_similarity
            let similarity = (1.0 - neighbour.distance).clamp(0.0, 1.0);
            output.push((*handle, node.meta.clone(), similarity));
        }

        output.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        output.truncate(k);
        output
    }

    fn update_metadata(&mut self, handle: Handle, meta: RecordMeta) -> Result<()> {
        match self.nodes.get_mut(&handle) {
            Some(node) if !node.deleted => {
                node.meta = meta;
                Ok(())
            }
            _ => Err(MemoryError::Index(format!("no live node for handle {handle}"))),
        }
    }

    fn soft_delete(&mut self, handle: Handle) -> bool {
        match self.nodes.get_mut(&handle) {
            Some(node) if !node.deleted => {
                node.deleted = true;
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    fn compact(&mut self) -> Result<CompactStats> {
        let removed = self.deleted_count();
        if removed == 0 {
            return Ok(CompactStats {
                active: self.live,
                removed: 0,
                duration_ms: 0,
            });
        }

        let start = std::time::Instant::now();
        self.rebuild_from_live();
        let stats = CompactStats {
            active: self.live,
            removed,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            active = stats.active,
            removed = stats.removed,
            duration_ms = stats.duration_ms,
            "index compacted"
        );
        Ok(stats)
    }

    fn all_metadata(&self) -> Vec<(Handle, RecordMeta)> {
        let mut out: Vec<(Handle, RecordMeta)> = self
            .nodes
            .iter()
            .filter(|(_, node)| !node.deleted)
            .map(|(handle, node)| (*handle, node.meta.clone()))
            .collect();
        out.sort_by_key(|(handle, _)| *handle);
        out
    }

    fn get_vector(&self, handle: Handle) -> Option<Vec<f32>> {
        self.nodes
            .get(&handle)
            .filter(|node| !node.deleted)
            .map(|node| node.vector.clone())
    }

    fn get_metadata(&self, handle: Handle) -> Option<RecordMeta> {
        self.nodes
            .get(&handle)
            .filter(|node| !node.deleted)
            .map(|node| node.meta.clone())
    }

    fn len(&self) -> usize {
        self.live
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn clear(&mut self) {
        self.hnsw = build_graph(&self.params);
        self.nodes.clear();
        self.by_internal.clear();
        self.next_internal = 0;
        self.live = 0;
    }

    fn save(&self, dir: &Path, name: &str) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let snapshot = Snapshot {
            dimension: self.dimension,
            next_handle: self.next_handle,
            params: self.params.clone(),
            nodes: self
                .nodes
                .iter()
                .filter(|(_, node)| !node.deleted)
                .map(|(handle, node)| (*handle, node.vector.clone(), node.meta.clone()))
                .collect(),
        };
        let bytes = bincode::serialize(&snapshot)?;
        let path = dir.join(format!("{name}.ann"));
        std::fs::write(&path, bytes)?;
        debug!(path = %path.display(), nodes = snapshot.nodes.len(), "index saved");
        Ok(())
    }

    fn load(&mut self, dir: &Path, name: &str) -> Result<bool> {
        let path = dir.join(format!("{name}.ann"));
        if !path.exists() {
            return Ok(false);
        }
        let bytes = std::fs::read(&path)?;
        let snapshot: Snapshot = bincode::deserialize(&bytes)?;
        if snapshot.dimension != self.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension,
                got: snapshot.dimension,
            });
        }

        self.params = snapshot.params;
        self.clear();
        self.next_handle = snapshot.next_handle;
        for (handle, vector, meta) in snapshot.nodes {
            let internal_id = self.next_internal;
            self.next_internal += 1;
            self.hnsw.insert((&vector, internal_id));
            self.by_internal.insert(internal_id, handle);
            self.nodes.insert(
                handle,
                NodeEntry {
                    vector,
                    meta,
                    internal_id,
                    deleted: false,
                },
            );
        }
        self.live = self.nodes.len();
        debug!(path = %path.display(), nodes = self.live, "index loaded");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{MemoryRecord, RecordOptions};

    fn meta_for(text: &str) -> RecordMeta {
        MemoryRecord::new(
            text.to_string(),
            vec![0.0; 3],
            RecordOptions::default(),
            "salt",
        )
        .meta()
    }

    fn index() -> HnswAnnIndex {
        HnswAnnIndex::new(3, HnswParams::default())
    }

    #[test]
    fn test_insert_returns_distinct_handles() {
        let mut idx = index();
        let a = idx
            .insert_with_metadata(&[1.0, 0.0, 0.0], meta_for("a"))
            .unwrap();
        let b = idx
            .insert_with_metadata(&[0.0, 1.0, 0.0], meta_for("b"))
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn test_insert_dimension_mismatch() {
        let mut idx = index();
        let result = idx.insert_with_metadata(&[1.0, 0.0], meta_for("a"));
        assert!(matches!(result, Err(MemoryError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_search_ranks_by_similarity() {
        let mut idx = index();
        idx.insert_with_metadata(&[1.0, 0.0, 0.0], meta_for("a"))
            .unwrap();
        idx.insert_with_metadata(&[0.0, 1.0, 0.0], meta_for("b"))
            .unwrap();
        idx.insert_with_metadata(&[0.9, 0.1, 0.0], meta_for("c"))
            .unwrap();

        let results = idx.search(&[1.0, 0.0, 0.0], 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].1.text, "a");
        assert!(results[0].2 > 0.99);
        assert_eq!(results[1].1.text, "c");
    }

    #[test]
    fn test_soft_deleted_nodes_never_surface() {
        let mut idx = index();
        let a = idx
            .insert_with_metadata(&[1.0, 0.0, 0.0], meta_for("a"))
            .unwrap();
        idx.insert_with_metadata(&[0.8, 0.2, 0.0], meta_for("b"))
            .unwrap();

        assert!(idx.soft_delete(a));
        assert!(!idx.soft_delete(a), "double delete is a no-op");
        assert_eq!(idx.len(), 1);

        let results = idx.search(&[1.0, 0.0, 0.0], 2);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.text, "b");
        assert!(idx.get_vector(a).is_none());
    }

    #[test]
    fn test_update_metadata_targets_the_handle() {
        let mut idx = index();
        let a = idx
            .insert_with_metadata(&[1.0, 0.0, 0.0], meta_for("a"))
            .unwrap();
        let mut meta = idx.get_metadata(a).unwrap();
        meta.usage_count = 42;
        idx.update_metadata(a, meta).unwrap();
        assert_eq!(idx.get_metadata(a).unwrap().usage_count, 42);

        idx.soft_delete(a);
        let stale = meta_for("stale");
        assert!(idx.update_metadata(a, stale).is_err());
    }

    #[test]
    fn test_compact_preserves_handles_and_search() {
        let mut idx = index();
        let a = idx
            .insert_with_metadata(&[1.0, 0.0, 0.0], meta_for("a"))
            .unwrap();
        let b = idx
            .insert_with_metadata(&[0.0, 1.0, 0.0], meta_for("b"))
            .unwrap();
        let c = idx
            .insert_with_metadata(&[0.0, 0.0, 1.0], meta_for("c"))
            .unwrap();

        idx.soft_delete(b);
        let stats = idx.compact().unwrap();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.removed, 1);

        // Handles survive the rebuild
        assert_eq!(idx.get_metadata(a).unwrap().text, "a");
        assert_eq!(idx.get_metadata(c).unwrap().text, "c");
        assert!(idx.get_metadata(b).is_none());

        let results = idx.search(&[1.0, 0.0, 0.0], 3);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, a);
    }

    #[test]
    fn test_compact_without_tombstones_is_free() {
        let mut idx = index();
        idx.insert_with_metadata(&[1.0, 0.0, 0.0], meta_for("a"))
            .unwrap();
        let stats = idx.compact().unwrap();
        assert_eq!(stats.removed, 0);
        assert_eq!(stats.active, 1);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut idx = index();
        let a = idx
            .insert_with_metadata(&[1.0, 0.0, 0.0], meta_for("a"))
            .unwrap();
        let b = idx
            .insert_with_metadata(&[0.0, 1.0, 0.0], meta_for("b"))
            .unwrap();
        idx.soft_delete(b);
        idx.save(dir.path(), "hot").unwrap();

        let mut restored = HnswAnnIndex::new(3, HnswParams::default());
        assert!(restored.load(dir.path(), "hot").unwrap());
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.get_metadata(a).unwrap().text, "a");
        // Tombstoned nodes are not persisted
        assert!(restored.get_metadata(b).is_none());

        // New handles never collide with restored ones
        let c = restored
            .insert_with_metadata(&[0.0, 0.0, 1.0], meta_for("c"))
            .unwrap();
        assert!(c > a && c > b);
    }

    #[test]
    fn test_load_missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut idx = index();
        assert!(!idx.load(dir.path(), "absent").unwrap());
    }

    #[test]
    fn test_all_metadata_lists_live_only() {
        let mut idx = index();
        let a = idx
            .insert_with_metadata(&[1.0, 0.0, 0.0], meta_for("a"))
            .unwrap();
        let b = idx
            .insert_with_metadata(&[0.0, 1.0, 0.0], meta_for("b"))
            .unwrap();
        idx.soft_delete(a);
        let all = idx.all_metadata();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, b);
    }

    #[test]
    fn test_clear() {
        let mut idx = index();
        idx.insert_with_metadata(&[1.0, 0.0, 0.0], meta_for("a"))
            .unwrap();
        idx.clear();
        assert!(idx.is_empty());
        assert!(idx.search(&[1.0, 0.0, 0.0], 1).is_empty());
    }
}
