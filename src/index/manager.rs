// HOT/WARM index ownership and compaction scheduling

use std::path::Path;

use tracing::debug;

use crate::config::{HOT_INDEX_NAME, WARM_INDEX_NAME};
use crate::error::Result;
use crate::index::{AnnIndex, CompactStats};

/// Owns the HOT and WARM ANN indexes and tracks soft-delete pressure.
///
/// Each soft-delete feeds a counter; once it reaches the configured
/// threshold the engine schedules a compaction of both indexes followed
/// by a persistence save. Compaction itself is single-flight behind the
/// engine's compact lock.
pub struct IndexManager {
    hot: Box<dyn AnnIndex>,
    warm: Box<dyn AnnIndex>,
    deletions_since_compaction: u64,
    compaction_threshold: u64,
}

impl IndexManager {
    /// Build a manager over the two injected indexes.
    pub fn new(hot: Box<dyn AnnIndex>, warm: Box<dyn AnnIndex>, compaction_threshold: u64) -> Self {
        Self {
            hot,
            warm,
            deletions_since_compaction: 0,
            compaction_threshold: compaction_threshold.max(1),
        }
    }

    /// The HOT index.
    pub fn hot(&self) -> &dyn AnnIndex {
        self.hot.as_ref()
    }

    /// The HOT index, mutable.
    pub fn hot_mut(&mut self) -> &mut dyn AnnIndex {
        self.hot.as_mut()
    }

    /// The WARM index.
    pub fn warm(&self) -> &dyn AnnIndex {
        self.warm.as_ref()
    }

    /// The WARM index, mutable.
    pub fn warm_mut(&mut self) -> &mut dyn AnnIndex {
        self.warm.as_mut()
    }

    /// Soft-deletes observed since the last compaction.
    pub fn deletions_since_compaction(&self) -> u64 {
        self.deletions_since_compaction
    }

    /// Count soft-deletes; returns true once the compaction threshold is met.
    pub fn note_soft_deletes(&mut self, count: u64) -> bool {
        self.deletions_since_compaction += count;
        self.deletions_since_compaction >= self.compaction_threshold
    }

    /// Compact both indexes and reset the soft-delete counter.
    pub fn compact_all(&mut self) -> Result<(CompactStats, CompactStats)> {
        let hot_stats = self.hot.compact()?;
        let warm_stats = self.warm.compact()?;
        self.deletions_since_compaction = 0;
        debug!(
            hot_removed = hot_stats.removed,
            warm_removed = warm_stats.removed,
            "compacted both indexes"
        );
        Ok((hot_stats, warm_stats))
    }

    /// Persist both indexes under `dir`.
    pub fn save_all(&self, dir: &Path) -> Result<()> {
        self.hot.save(dir, HOT_INDEX_NAME)?;
        self.warm.save(dir, WARM_INDEX_NAME)?;
        Ok(())
    }

    /// Restore both indexes from `dir`; returns (hot_loaded, warm_loaded).
    pub fn load_all(&mut self, dir: &Path) -> Result<(bool, bool)> {
        let hot = self.hot.load(dir, HOT_INDEX_NAME)?;
        let warm = self.warm.load(dir, WARM_INDEX_NAME)?;
        Ok((hot, warm))
    }

    /// Drop every node from both indexes and reset the counter.
    pub fn clear_all(&mut self) {
        self.hot.clear();
        self.warm.clear();
        self.deletions_since_compaction = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{HnswAnnIndex, HnswParams};
    use crate::record::{MemoryRecord, RecordOptions};

    fn manager(threshold: u64) -> IndexManager {
        IndexManager::new(
            Box::new(HnswAnnIndex::new(3, HnswParams::default())),
            Box::new(HnswAnnIndex::new(3, HnswParams::default())),
            threshold,
        )
    }

    fn meta_for(text: &str) -> crate::record::RecordMeta {
        MemoryRecord::new(
            text.to_string(),
            vec![0.0; 3],
            RecordOptions::default(),
            "salt",
        )
        .meta()
    }

    #[test]
    fn test_soft_delete_counter_reaches_threshold() {
        let mut mgr = manager(3);
        assert!(!mgr.note_soft_deletes(1));
        assert!(!mgr.note_soft_deletes(1));
        assert!(mgr.note_soft_deletes(1));
        assert_eq!(mgr.deletions_since_compaction(), 3);
    }

    #[test]
    fn test_compact_all_resets_counter() {
        let mut mgr = manager(2);
        let h = mgr
            .hot_mut()
            .insert_with_metadata(&[1.0, 0.0, 0.0], meta_for("a"))
            .unwrap();
        mgr.hot_mut().soft_delete(h);
        mgr.note_soft_deletes(2);

        let (hot_stats, warm_stats) = mgr.compact_all().unwrap();
        assert_eq!(hot_stats.removed, 1);
        assert_eq!(warm_stats.removed, 0);
        assert_eq!(mgr.deletions_since_compaction(), 0);
    }

    #[test]
    fn test_save_and_load_both() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager(10);
        mgr.hot_mut()
            .insert_with_metadata(&[1.0, 0.0, 0.0], meta_for("hot record"))
            .unwrap();
        mgr.warm_mut()
            .insert_with_metadata(&[0.0, 1.0, 0.0], meta_for("warm record"))
            .unwrap();
        mgr.save_all(dir.path()).unwrap();

        let mut restored = manager(10);
        let (hot, warm) = restored.load_all(dir.path()).unwrap();
        assert!(hot && warm);
        assert_eq!(restored.hot().len(), 1);
        assert_eq!(restored.warm().len(), 1);
    }

    #[test]
    fn test_clear_all() {
        let mut mgr = manager(10);
        mgr.warm_mut()
            .insert_with_metadata(&[0.0, 1.0, 0.0], meta_for("warm record"))
            .unwrap();
        mgr.note_soft_deletes(5);
        mgr.clear_all();
        assert_eq!(mgr.warm().len(), 0);
        assert_eq!(mgr.deletions_since_compaction(), 0);
    }
}
