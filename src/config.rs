// Engine configuration
//
// *La Configuration* (The Configuration) - Tiering, maintenance, and storage settings

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::index::HnswParams;

/// Database file name inside the data directory
pub const DATABASE_FILE: &str = "lememoire.db";

/// Persisted snapshot name for the HOT ANN index
pub const HOT_INDEX_NAME: &str = "hot";

/// Persisted snapshot name for the WARM ANN index
pub const WARM_INDEX_NAME: &str = "warm";

/// Engine configuration
///
/// All thresholds that drive tiering, consolidation, pruning, and
/// maintenance cadence. `Default` gives the production tuning; tests
/// usually shrink the dimension and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Directory holding the database and index snapshots
    pub data_dir: PathBuf,

    /// Embedding dimension D; every stored vector must match
    pub embed_dim: usize,

    /// Usage count at or above which a record is promoted to HOT
    pub hot_usage_threshold: u32,

    /// Effective weight at or above which a record is promoted to HOT
    pub hot_weight_threshold: f32,

    /// Decay score below which a record is demoted a tier
    pub warm_decay_threshold: f32,

    /// Centroid similarity at or above which a consolidation summary is
    /// considered redundant with an existing semantic record and skipped
    pub redundancy_threshold: f32,

    /// Effective-weight floor below which unused COLD records are pruned
    pub prune_epsilon: f32,

    /// Writes between automatic consolidation passes
    pub consolidation_interval: u64,

    /// WARM records read per consolidation chunk
    pub consolidation_chunk_size: usize,

    /// Journal row count that triggers rotation
    pub journal_rotation_size: u64,

    /// COLD rows read per chunk during linear scans
    pub cold_search_chunk_size: usize,

    /// Usage count at or above which demotion is suppressed
    pub demotion_usage_threshold: u32,

    /// Soft-deletes that trigger index compaction and a save
    pub compaction_threshold: u64,

    /// Free-space floor (bytes) for the maintenance warning path
    pub memory_warning_threshold: u64,

    /// Free-space floor (bytes) for the emergency cleanup path
    pub memory_critical_threshold: u64,

    /// Milliseconds between memory-pressure checks
    pub memory_check_interval_ms: u64,

    /// Whether the periodic autosave task runs
    pub autosave_enabled: bool,

    /// Milliseconds between autosave checks
    pub autosave_interval_ms: u64,

    /// Mutations that trigger an immediate save
    pub mutation_batch_size: u64,

    /// Whether large WARM sets use graph-based clustering
    pub use_advanced_clustering: bool,

    /// WARM record count at which graph-based clustering kicks in
    pub advanced_clustering_threshold: usize,

    /// Maximum cosine distance between members of one cluster
    pub cluster_diameter: f32,

    /// Clusters formed per graph-based consolidation pass
    pub max_clusters_per_pass: usize,

    /// Parameters for the HOT and WARM HNSW indexes
    pub hnsw: HnswParams,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".lememoire"),
            embed_dim: 768,
            hot_usage_threshold: 10,
            hot_weight_threshold: 0.8,
            warm_decay_threshold: 0.1,
            redundancy_threshold: 0.9,
            prune_epsilon: 0.01,
            consolidation_interval: 100,
            consolidation_chunk_size: 500,
            journal_rotation_size: 10_000,
            cold_search_chunk_size: 1000,
            demotion_usage_threshold: 2,
            compaction_threshold: 100,
            memory_warning_threshold: 100 * 1024 * 1024,
            memory_critical_threshold: 50 * 1024 * 1024,
            memory_check_interval_ms: 60_000,
            autosave_enabled: true,
            autosave_interval_ms: 300_000,
            mutation_batch_size: 10,
            use_advanced_clustering: true,
            advanced_clustering_threshold: 5000,
            cluster_diameter: 0.3,
            max_clusters_per_pass: 100,
            hnsw: HnswParams::default(),
        }
    }
}

impl MemoryConfig {
    /// Create a configuration rooted at `data_dir` with default tuning.
    pub fn at<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Path to the SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    /// Validate threshold sanity.
    pub fn validate(&self) -> Result<()> {
        if self.embed_dim == 0 {
            return Err(MemoryError::InvalidInput("embed_dim must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.hot_weight_threshold) {
            return Err(MemoryError::InvalidInput(
                "hot_weight_threshold must be in [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.warm_decay_threshold) {
            return Err(MemoryError::InvalidInput(
                "warm_decay_threshold must be in [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.cluster_diameter) {
            return Err(MemoryError::InvalidInput(
                "cluster_diameter must be in [0, 1]".to_string(),
            ));
        }
        if self.consolidation_chunk_size == 0 || self.cold_search_chunk_size == 0 {
            return Err(MemoryError::InvalidInput(
                "chunk sizes must be > 0".to_string(),
            ));
        }
        if self.memory_critical_threshold > self.memory_warning_threshold {
            return Err(MemoryError::InvalidInput(
                "critical threshold must not exceed warning threshold".to_string(),
            ));
        }
        self.hnsw
            .validate()
            .map_err(|e| MemoryError::InvalidInput(e.to_string()))
    }

    /// Load a configuration from a JSON file, or defaults if it does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        if !path.as_ref().exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
