// End-to-end engine scenarios: write/read laws, tiering, consolidation,
// quarantine, restart recovery, and lock behavior.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lememoire::{
    EmbeddingProvider, GenerateOptions, HashedEmbedder, MemoryConfig, MemoryEngine, MemoryTier,
    RecordOptions, Result, SearchFilters, SearchOptions, Storage, StoreName, StoredRecord,
};

const DIM: usize = 64;

/// Test provider: hashed embeddings plus a fixed (optionally slow) summary.
struct FixedSummaryProvider {
    inner: HashedEmbedder,
    summary: String,
    delay: Duration,
}

impl FixedSummaryProvider {
    fn new(summary: &str, delay: Duration) -> Self {
        Self {
            inner: HashedEmbedder::new(DIM),
            summary: summary.to_string(),
            delay,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for FixedSummaryProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.inner.embed(text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.inner.embed_batch(texts).await
    }

    async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> Result<String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.summary.clone())
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

fn test_config(dir: &std::path::Path) -> MemoryConfig {
    let mut config = MemoryConfig::at(dir);
    config.embed_dim = DIM;
    // Keep background cadence out of the way unless a test opts in
    config.consolidation_interval = 1_000_000;
    config.autosave_enabled = false;
    config
}

async fn open_engine(config: MemoryConfig) -> Arc<MemoryEngine> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let provider = Arc::new(HashedEmbedder::new(DIM));
    let engine = MemoryEngine::new(config, provider).unwrap();
    engine.initialize().await.unwrap();
    engine
}

#[tokio::test]
async fn operations_before_initialize_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(HashedEmbedder::new(DIM));
    let engine = MemoryEngine::new(test_config(dir.path()), provider).unwrap();
    let err = engine
        .create_memory_record("too early", RecordOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, lememoire::MemoryError::NotInitialized));
}

#[tokio::test]
async fn write_then_read_returns_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(test_config(dir.path())).await;

    let record = engine
        .create_memory_record("the mitochondria is the powerhouse of the cell", RecordOptions::default())
        .await
        .unwrap();
    assert_eq!(record.current_tier, MemoryTier::Warm);

    let results = engine
        .search(
            "the mitochondria is the powerhouse of the cell",
            1,
            SearchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].record.id, record.id);
    assert!(results[0].similarity >= 0.99);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_1_capital_of_france() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(test_config(dir.path())).await;

    for text in [
        "Paris is the capital of France",
        "The Eiffel Tower is in Paris",
        "The Seine flows through Paris",
    ] {
        engine
            .create_memory_record(text, RecordOptions::default())
            .await
            .unwrap();
    }

    let results = engine
        .search(
            "capital of France",
            1,
            SearchOptions {
                filters: SearchFilters {
                    min_similarity: Some(0.5),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].record.text, "Paris is the capital of France");

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_2_two_searches_promote_to_hot() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.hot_usage_threshold = 2;
    let engine = open_engine(config).await;

    engine
        .create_memory_record("a frequently needed fact", RecordOptions::default())
        .await
        .unwrap();

    for _ in 0..2 {
        let results = engine
            .search("a frequently needed fact", 1, SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.hot, 1);
    assert_eq!(stats.warm, 0);

    // The promoted record is still retrievable, now from HOT
    let results = engine
        .search("a frequently needed fact", 1, SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(results[0].record.current_tier, MemoryTier::Hot);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn promotion_monotonicity_within_usage_threshold_queries() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.hot_usage_threshold = 4;
    let engine = open_engine(config).await;

    engine
        .create_memory_record("repeatedly searched text", RecordOptions::default())
        .await
        .unwrap();

    for _ in 0..4 {
        engine
            .search("repeatedly searched text", 1, SearchOptions::default())
            .await
            .unwrap();
    }
    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.hot, 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn simulated_search_has_no_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.hot_usage_threshold = 1;
    let engine = open_engine(config).await;

    engine
        .create_memory_record("observed but untouched", RecordOptions::default())
        .await
        .unwrap();
    let before = engine.get_stats().await.unwrap();

    let results = engine
        .search(
            "observed but untouched",
            1,
            SearchOptions {
                simulate: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);

    let after = engine.get_stats().await.unwrap();
    // No promotion, no persisted access, no extra mutations
    assert_eq!(after.hot, 0);
    assert_eq!(after.warm, before.warm);
    assert_eq!(
        after.mutations_since_last_save,
        before.mutations_since_last_save
    );
    let all = engine.get_all_records().await.unwrap();
    assert_eq!(all[0].usage_count, 0);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_3_consolidation_creates_semantic_summary() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    let provider = Arc::new(FixedSummaryProvider::new("SUMMARY", Duration::ZERO));
    config.embed_dim = DIM;
    let engine = MemoryEngine::new(config, provider).unwrap();
    engine.initialize().await.unwrap();

    let texts: Vec<String> = (0..10)
        .map(|_| "the quick brown fox jumps over the lazy dog".to_string())
        .collect();
    engine
        .create_memory_records(&texts, RecordOptions::default())
        .await
        .unwrap();

    let summaries = engine.consolidate(false).await.unwrap();
    assert!(!summaries.is_empty());
    let summary = &summaries[0];
    assert_eq!(summary.text, "SUMMARY");
    assert!(!summary.episodic);
    assert!((summary.importance - 0.7).abs() < 1e-6);
    let cluster_id = summary
        .metadata
        .get("cluster_id")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    let all = engine.get_all_records().await.unwrap();
    let linked: Vec<_> = all
        .iter()
        .filter(|r| r.semantic_cluster_id.as_deref() == Some(cluster_id.as_str()))
        .collect();
    assert!(linked.len() >= 2);
    for member in linked {
        // importance attenuated from the 0.5 default
        assert!((member.importance - 0.4).abs() < 1e-6);
    }

    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.records_since_consolidation, 0);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_4_integrity_quarantine() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let db_path = config.database_path();
    let engine = open_engine(config).await;

    let keep = engine
        .create_memory_record("an honest record", RecordOptions::default())
        .await
        .unwrap();
    let victim = engine
        .create_memory_record("a record about to be corrupted", RecordOptions::default())
        .await
        .unwrap();

    // Rewrite the text field in the WARM store behind the engine's back
    let raw = Storage::open(&db_path).unwrap();
    let bytes = raw.get(StoreName::Warm, &victim.id).await.unwrap().unwrap();
    let mut stored = StoredRecord::decode(&bytes).unwrap();
    stored.meta.text = "tampered".to_string();
    raw.put(StoreName::Warm, &victim.id, &stored.encode().unwrap())
        .await
        .unwrap();

    let corrupted = engine.verify_integrity().await.unwrap();
    assert_eq!(corrupted, vec![victim.id.clone()]);

    let all = engine.get_all_records().await.unwrap();
    assert!(all.iter().any(|r| r.id == keep.id));
    assert!(all.iter().all(|r| r.id != victim.id));

    // Quarantine is idempotent
    assert!(engine.verify_integrity().await.unwrap().is_empty());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_5_restart_preserves_counter_and_totals() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.mutation_batch_size = 1_000_000;
    config.memory_warning_threshold = 0;
    config.memory_critical_threshold = 0;

    let (counter_before, total_before) = {
        let engine = open_engine(config.clone()).await;
        let texts: Vec<String> = (0..2000).map(|i| format!("stored fact number {i}")).collect();
        engine
            .create_memory_records(&texts, RecordOptions::default())
            .await
            .unwrap();
        engine.save().await.unwrap();
        let stats = engine.get_stats().await.unwrap();
        engine.shutdown().await.unwrap();
        (stats.journal_counter, stats.total)
    };
    assert_eq!(counter_before, 2000);
    assert_eq!(total_before, 2000);

    let engine = open_engine(config).await;
    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.journal_counter, counter_before);
    assert_eq!(stats.total, total_before);
    assert_eq!(stats.warm, 2000);

    // Still searchable after the restart
    let results = engine
        .search("stored fact number 1234", 1, SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(results[0].record.text, "stored fact number 1234");

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_6_search_proceeds_while_consolidation_holds_its_lock() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    let provider = Arc::new(FixedSummaryProvider::new(
        "SUMMARY",
        Duration::from_millis(600),
    ));
    config.embed_dim = DIM;
    let engine = MemoryEngine::new(config, provider).unwrap();
    engine.initialize().await.unwrap();

    for _ in 0..3 {
        engine
            .create_memory_record("a repeated memory for clustering", RecordOptions::default())
            .await
            .unwrap();
    }

    let background = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.consolidate(false).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Search uses a different lock and proceeds
    let results = engine
        .search("a repeated memory for clustering", 1, SearchOptions::default())
        .await
        .unwrap();
    assert!(!results.is_empty());

    // A second consolidation skips without blocking
    let second = engine.consolidate(false).await.unwrap();
    assert!(second.is_empty());

    let first = background.await.unwrap().unwrap();
    assert!(!first.is_empty());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn journal_tail_is_replayed_after_a_crash() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());

    // Simulate a crash between journal append and the WARM insert by
    // journaling a record that reaches no tier store
    let orphan_id = {
        let storage = Storage::open(config.database_path())?;
        let journal = lememoire::Journal::open(storage, config.journal_rotation_size).await?;
        let record = lememoire::MemoryRecord::new(
            "write that never landed".to_string(),
            HashedEmbedder::new(DIM).embed("write that never landed").await?,
            RecordOptions::default(),
            "whatever-salt",
        );
        let stored = StoredRecord {
            meta: record.meta(),
            embedding: lememoire::StoredEmbedding::Half(
                lememoire::codec::quantize_vec_f16(&record.embedding),
            ),
            warm_index_handle: None,
        };
        journal.append(&record.id, stored).await?;
        record.id
    };

    let engine = open_engine(config).await;
    let stats = engine.get_stats().await?;
    assert_eq!(stats.warm, 1);
    let all = engine.get_all_records().await?;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, orphan_id);
    assert_eq!(all[0].text, "write that never landed");

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn prune_removes_only_decayed_unused_cold_records() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let db_path = config.database_path();
    let engine = open_engine(config).await;

    engine
        .create_memory_record("a fresh warm record", RecordOptions::default())
        .await
        .unwrap();

    // Plant COLD rows directly: one long-decayed and unused, one used
    let raw = Storage::open(&db_path).unwrap();
    let embedder = HashedEmbedder::new(DIM);
    let month_ms: i64 = 30 * 24 * 60 * 60 * 1000;
    let mut planted_ids = Vec::new();
    for (text, usage) in [("forgotten trivia", 0u32), ("old but used", 3u32)] {
        let mut record = lememoire::MemoryRecord::new(
            text.to_string(),
            embedder.embed(text).await.unwrap(),
            RecordOptions::default(),
            "planted-salt",
        );
        record.timestamp -= 12 * month_ms;
        record.last_accessed = record.timestamp;
        record.usage_count = usage;
        let stored = StoredRecord {
            meta: record.meta(),
            embedding: lememoire::StoredEmbedding::Int8(
                lememoire::codec::quantize_vec_i8(&record.embedding),
            ),
            warm_index_handle: None,
        };
        raw.put(StoreName::Cold, &record.id, &stored.encode().unwrap())
            .await
            .unwrap();
        planted_ids.push(record.id);
    }

    // Dry run reports without deleting
    let simulated = engine.prune(true).await.unwrap();
    assert_eq!(simulated, vec![planted_ids[0].clone()]);
    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.cold, 2);

    let pruned = engine.prune(false).await.unwrap();
    assert_eq!(pruned, vec![planted_ids[0].clone()]);
    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.cold, 1);
    assert_eq!(stats.warm, 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn export_contains_records_without_embeddings_and_decrypts() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(test_config(dir.path())).await;

    engine
        .create_memory_record("exportable knowledge", RecordOptions::default())
        .await
        .unwrap();

    let payload = engine.export().await.unwrap();
    assert_eq!(payload.version, 1);
    assert_eq!(payload.records.len(), 1);
    assert_eq!(payload.records[0].text, "exportable knowledge");
    assert_eq!(payload.stats.total, 1);

    let sealed = engine.export_encrypted().await.unwrap();
    let as_json = serde_json::to_vec(&payload).unwrap();
    assert_ne!(sealed, as_json);
    assert!(sealed.len() > as_json.len());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn clear_empties_tiers_but_keeps_sequence_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(test_config(dir.path())).await;

    engine
        .create_memory_record("ephemeral", RecordOptions::default())
        .await
        .unwrap();
    let before = engine.get_stats().await.unwrap();
    assert_eq!(before.total, 1);

    engine.clear().await.unwrap();
    let cleared = engine.get_stats().await.unwrap();
    assert_eq!(cleared.total, 0);
    assert_eq!(cleared.journal, 0);
    assert_eq!(cleared.journal_counter, before.journal_counter);

    // New writes continue the sequence rather than restarting it
    engine
        .create_memory_record("reborn", RecordOptions::default())
        .await
        .unwrap();
    let after = engine.get_stats().await.unwrap();
    assert_eq!(after.journal_counter, before.journal_counter + 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn batch_writes_share_embedding_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(test_config(dir.path())).await;

    let texts: Vec<String> = (0..12).map(|i| format!("batched note {i}")).collect();
    let records = engine
        .create_memory_records(&texts, RecordOptions::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 12);

    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.warm, 12);
    assert_eq!(stats.journal_counter, 12);

    // Batch and single-path embeddings agree
    let single = engine
        .search("batched note 7", 1, SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(single[0].record.text, "batched note 7");
    assert!(single[0].similarity >= 0.99);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn empty_input_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(test_config(dir.path())).await;

    assert!(matches!(
        engine
            .create_memory_record("   ", RecordOptions::default())
            .await,
        Err(lememoire::MemoryError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.search("", 5, SearchOptions::default()).await,
        Err(lememoire::MemoryError::InvalidInput(_))
    ));

    engine.shutdown().await.unwrap();
}
