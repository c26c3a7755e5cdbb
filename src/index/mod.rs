// Approximate nearest neighbor indexing
//
// *L'Index* (The Index) - ANN capability contract, HNSW backend, and the HOT/WARM manager

pub mod hnsw;
pub mod manager;

pub use hnsw::{HnswAnnIndex, HnswParams};
pub use manager::IndexManager;

use std::path::Path;

use crate::error::Result;
use crate::record::RecordMeta;

/// Opaque, stable identifier of an index node.
///
/// Handles are assigned by the wrapper, never by the underlying graph,
/// so compaction rebuilds cannot invalidate a handle a record carries.
pub type Handle = u64;

/// Statistics from an index compaction.
#[derive(Debug, Clone, Copy)]
pub struct CompactStats {
    /// Live nodes in the rebuilt index
    pub active: usize,
    /// Soft-deleted nodes physically removed
    pub removed: usize,
    /// Rebuild duration in milliseconds
    pub duration_ms: u64,
}

/// Capability contract for an ANN index.
///
/// The engine stores the handle returned by `insert_with_metadata` on the
/// record and uses it for every later mutation; search never returns
/// soft-deleted nodes.
pub trait AnnIndex: Send {
    /// Insert a vector with its metadata; returns a stable handle.
    fn insert_with_metadata(&mut self, vector: &[f32], meta: RecordMeta) -> Result<Handle>;

    /// Approximate top-k by cosine similarity, scores in [0, 1].
    fn search(&self, query: &[f32], k: usize) -> Vec<(Handle, RecordMeta, f32)>;

    /// Replace the metadata of a live node.
    fn update_metadata(&mut self, handle: Handle, meta: RecordMeta) -> Result<()>;

    /// Logically remove a node; memory is reclaimed by `compact`.
    fn soft_delete(&mut self, handle: Handle) -> bool;

    /// Physically remove soft-deleted nodes and rebuild adjacency.
    fn compact(&mut self) -> Result<CompactStats>;

    /// Metadata of every live node.
    fn all_metadata(&self) -> Vec<(Handle, RecordMeta)>;

    /// Vector of a live node, when the backend retains it.
    fn get_vector(&self, handle: Handle) -> Option<Vec<f32>>;

    /// Metadata of a live node.
    fn get_metadata(&self, handle: Handle) -> Option<RecordMeta>;

    /// Number of live nodes.
    fn len(&self) -> usize;

    /// True when no live nodes exist.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vector dimension.
    fn dimension(&self) -> usize;

    /// Drop every node, live or deleted.
    fn clear(&mut self);

    /// Persist the index under `dir` as `<name>.ann`.
    fn save(&self, dir: &Path, name: &str) -> Result<()>;

    /// Restore from `dir/<name>.ann`; returns false when no snapshot exists.
    fn load(&mut self, dir: &Path, name: &str) -> Result<bool>;
}
