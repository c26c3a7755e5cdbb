// Memory record model
//
// *Le Souvenir* (The Memory Record) - Decay-weighted record entity and tier tags

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::codec;

/// Half-life of the exponential decay score: 14 days in milliseconds.
pub const DECAY_HALF_LIFE_MS: i64 = 14 * 24 * 60 * 60 * 1000;

/// Scale of the hyperbolic temporal weight: 7 days in milliseconds.
pub const TEMPORAL_SCALE_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Storage tier a record currently occupies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MemoryTier {
    /// In the in-memory HOT ANN index
    Hot,
    /// Persisted float16 + WARM ANN index
    Warm,
    /// Persisted int8, linear scan only
    Cold,
    /// Not yet placed
    Unknown,
}

impl MemoryTier {
    /// Return the string representation of the tier.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::Hot => "hot",
            MemoryTier::Warm => "warm",
            MemoryTier::Cold => "cold",
            MemoryTier::Unknown => "unknown",
        }
    }
}

/// Scalar fields of a record, shared between KV rows and ANN node metadata.
///
/// The embedding and tier placement are deliberately not part of this
/// struct: vectors live in the tier backing, and placement is implied by
/// which backing holds the row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordMeta {
    /// Stable opaque identifier
    pub id: String,
    /// Original text
    pub text: String,
    /// Creation time (epoch ms)
    pub timestamp: i64,
    /// Last read/update time (epoch ms)
    pub last_accessed: i64,
    /// True for short-term episodic records, false for semantic ones
    pub episodic: bool,
    /// Importance in [0, 1]
    pub importance: f32,
    /// Number of accesses; reset only by consolidation
    pub usage_count: u32,
    /// Cluster handle assigned by consolidation
    pub semantic_cluster_id: Option<String>,
    /// SHA-256 of text ‖ salt, fixed at creation
    pub integrity_hash: String,
    /// SHA-256 fingerprint of the original embedding
    pub embedding_hash: String,
    /// Free-form key/value bag
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Options accepted by the write path.
#[derive(Debug, Clone, Default)]
pub struct RecordOptions {
    /// Episodic flag; defaults to true (short-term on write)
    pub episodic: Option<bool>,
    /// Importance in [0, 1]; defaults to 0.5
    pub importance: Option<f32>,
    /// Caller metadata
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// A memory record with its full-precision embedding and placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Stable opaque identifier derived from text and a creation nonce
    pub id: String,
    /// Original text
    pub text: String,
    /// Dense embedding of the configured dimension
    pub embedding: Vec<f32>,
    /// Creation time (epoch ms)
    pub timestamp: i64,
    /// Last read/update time (epoch ms)
    pub last_accessed: i64,
    /// True for short-term episodic records
    pub episodic: bool,
    /// Importance in [0, 1]
    pub importance: f32,
    /// Number of accesses
    pub usage_count: u32,
    /// Cluster handle assigned by consolidation
    pub semantic_cluster_id: Option<String>,
    /// SHA-256 of text ‖ salt
    pub integrity_hash: String,
    /// SHA-256 fingerprint of the embedding
    pub embedding_hash: String,
    /// Current tier placement
    pub current_tier: MemoryTier,
    /// Live HOT index node handle, if placed in HOT
    pub hot_index_handle: Option<u64>,
    /// Live WARM index node handle, if placed in WARM
    pub warm_index_handle: Option<u64>,
    /// Free-form key/value bag
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl MemoryRecord {
    /// Build a new record from text and its embedding.
    ///
    /// The id is derived from the text and a random creation nonce so
    /// identical texts stored twice get distinct records.
    pub fn new(text: String, embedding: Vec<f32>, options: RecordOptions, salt: &str) -> Self {
        let now = Utc::now().timestamp_millis();
        let nonce: u64 = rand::random();
        let id = format!(
            "mem_{}",
            &codec::content_hash(&text, &format!("{nonce:016x}"))[..32]
        );
        let integrity_hash = codec::content_hash(&text, salt);
        let embedding_hash = codec::embedding_fingerprint(&embedding);

        Self {
            id,
            text,
            embedding,
            timestamp: now,
            last_accessed: now,
            episodic: options.episodic.unwrap_or(true),
            importance: options.importance.unwrap_or(0.5).clamp(0.0, 1.0),
            usage_count: 0,
            semantic_cluster_id: None,
            integrity_hash,
            embedding_hash,
            current_tier: MemoryTier::Unknown,
            hot_index_handle: None,
            warm_index_handle: None,
            metadata: options.metadata.unwrap_or_default(),
        }
    }

    /// Reassemble a record from its scalar metadata plus placement.
    pub fn from_meta(
        meta: RecordMeta,
        embedding: Vec<f32>,
        tier: MemoryTier,
        hot_index_handle: Option<u64>,
        warm_index_handle: Option<u64>,
    ) -> Self {
        Self {
            id: meta.id,
            text: meta.text,
            embedding,
            timestamp: meta.timestamp,
            last_accessed: meta.last_accessed,
            episodic: meta.episodic,
            importance: meta.importance,
            usage_count: meta.usage_count,
            semantic_cluster_id: meta.semantic_cluster_id,
            integrity_hash: meta.integrity_hash,
            embedding_hash: meta.embedding_hash,
            current_tier: tier,
            hot_index_handle,
            warm_index_handle,
            metadata: meta.metadata,
        }
    }

    /// Snapshot the scalar fields for KV rows and ANN node metadata.
    pub fn meta(&self) -> RecordMeta {
        RecordMeta {
            id: self.id.clone(),
            text: self.text.clone(),
            timestamp: self.timestamp,
            last_accessed: self.last_accessed,
            episodic: self.episodic,
            importance: self.importance,
            usage_count: self.usage_count,
            semantic_cluster_id: self.semantic_cluster_id.clone(),
            integrity_hash: self.integrity_hash.clone(),
            embedding_hash: self.embedding_hash.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Age in milliseconds since the last access.
    fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.last_accessed.max(self.timestamp)).max(0)
    }

    /// Exponential recency decay: `exp(-age / half_life)`, in (0, 1].
    pub fn decay_score(&self, now_ms: i64) -> f32 {
        let age = self.age_ms(now_ms) as f64;
        (-(age / DECAY_HALF_LIFE_MS as f64)).exp() as f32
    }

    /// Hyperbolic temporal weight: `1 / (1 + age / scale)`, in (0, 1].
    pub fn temporal_weight(&self, now_ms: i64) -> f32 {
        let age = self.age_ms(now_ms) as f64;
        (1.0 / (1.0 + age / TEMPORAL_SCALE_MS as f64)) as f32
    }

    /// Combined ranking weight: `importance · decay · temporal`, in [0, 1].
    pub fn effective_weight(&self, now_ms: i64) -> f32 {
        self.importance.clamp(0.0, 1.0) * self.decay_score(now_ms) * self.temporal_weight(now_ms)
    }

    /// Record an access: bump usage and last_accessed unless simulating.
    pub fn access(&mut self, simulate: bool) {
        if simulate {
            return;
        }
        self.usage_count = self.usage_count.saturating_add(1);
        self.last_accessed = Utc::now().timestamp_millis();
    }

    /// Recompute the content hash and compare against the stored one.
    pub fn integrity_ok(&self, salt: &str) -> bool {
        codec::content_hash(&self.text, salt) == self.integrity_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_record(importance: f32) -> MemoryRecord {
        MemoryRecord::new(
            "a test memory".to_string(),
            vec![0.1, 0.2, 0.3],
            RecordOptions {
                importance: Some(importance),
                ..Default::default()
            },
            "salt",
        )
    }

    #[test]
    fn test_new_record_defaults() {
        let record = test_record(0.5);
        assert!(record.id.starts_with("mem_"));
        assert!(record.episodic);
        assert_eq!(record.usage_count, 0);
        assert_eq!(record.current_tier, MemoryTier::Unknown);
        assert!(record.hot_index_handle.is_none());
        assert!(record.integrity_ok("salt"));
        assert!(!record.integrity_ok("other-salt"));
    }

    #[test]
    fn test_ids_are_unique_for_identical_text() {
        let a = test_record(0.5);
        let b = test_record(0.5);
        assert_ne!(a.id, b.id);
        assert_eq!(a.integrity_hash, b.integrity_hash);
    }

    #[test]
    fn test_fresh_record_has_full_weight_factors() {
        let record = test_record(0.5);
        let now = record.timestamp;
        assert!((record.decay_score(now) - 1.0).abs() < 1e-6);
        assert!((record.temporal_weight(now) - 1.0).abs() < 1e-6);
        assert!((record.effective_weight(now) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_decay_at_half_life() {
        let record = test_record(1.0);
        let later = record.timestamp + DECAY_HALF_LIFE_MS;
        let decay = record.decay_score(later);
        assert!((decay - (-1.0f32).exp()).abs() < 1e-4);
    }

    #[test]
    fn test_temporal_weight_at_scale() {
        let record = test_record(1.0);
        let later = record.timestamp + TEMPORAL_SCALE_MS;
        assert!((record.temporal_weight(later) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_access_bumps_unless_simulating() {
        let mut record = test_record(0.5);
        record.access(true);
        assert_eq!(record.usage_count, 0);
        record.access(false);
        record.access(false);
        assert_eq!(record.usage_count, 2);
        assert!(record.last_accessed >= record.timestamp);
    }

    #[test]
    fn test_meta_roundtrip() {
        let record = test_record(0.7);
        let rebuilt = MemoryRecord::from_meta(
            record.meta(),
            record.embedding.clone(),
            MemoryTier::Warm,
            None,
            Some(9),
        );
        assert_eq!(rebuilt.id, record.id);
        assert_eq!(rebuilt.text, record.text);
        assert_eq!(rebuilt.current_tier, MemoryTier::Warm);
        assert_eq!(rebuilt.warm_index_handle, Some(9));
    }

    #[test]
    fn test_tier_strings() {
        assert_eq!(MemoryTier::Hot.as_str(), "hot");
        assert_eq!(MemoryTier::Warm.as_str(), "warm");
        assert_eq!(MemoryTier::Cold.as_str(), "cold");
        assert_eq!(MemoryTier::Unknown.as_str(), "unknown");
    }

    proptest! {
        #[test]
        fn prop_effective_weight_in_unit_interval(
            importance in -1.0f32..2.0f32,
            age_days in 0i64..3650,
        ) {
            let mut record = test_record(importance.clamp(0.0, 1.0));
            record.importance = importance; // even out-of-range importance stays bounded
            let now = record.timestamp + age_days * 24 * 60 * 60 * 1000;
            let w = record.effective_weight(now);
            prop_assert!((0.0..=1.0).contains(&w));
        }

        #[test]
        fn prop_weight_monotonically_decays(age_a in 0i64..365, age_b in 0i64..365) {
            let record = test_record(0.8);
            let day = 24 * 60 * 60 * 1000;
            let (early, late) = if age_a <= age_b { (age_a, age_b) } else { (age_b, age_a) };
            let w_early = record.effective_weight(record.timestamp + early * day);
            let w_late = record.effective_weight(record.timestamp + late * day);
            prop_assert!(w_late <= w_early + 1e-6);
        }
    }
}
