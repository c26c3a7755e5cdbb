// Tiered memory engine facade
//
// *Le Moteur* (The Engine) - Write path, tier orchestration, stats, and shutdown

mod consolidate;
mod lifecycle;
mod maintain;
mod search;
mod tier;

pub use search::{ScoredRecord, SearchFilters, SearchOptions};

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::MemoryConfig;
use crate::crypto::ExportCipher;
use crate::error::{MemoryError, Result};
use crate::index::{HnswAnnIndex, IndexManager};
use crate::provider::{call_with_retry, EmbeddingProvider};
use crate::record::{MemoryRecord, MemoryTier, RecordOptions};
use crate::store::{
    Journal, Storage, StoreName, StoredEmbedding, StoredRecord, META_ENCRYPTION_KEY, META_SALT,
};

/// Meta key recording the journal position covered by the last save;
/// recovery replays only entries past it.
const META_JOURNAL_WATERMARK: &str = "journal_watermark";

/// Entries held by the embedding reconstruction cache.
const RECON_CACHE_CAPACITY: usize = 4096;

/// Export format version.
const EXPORT_VERSION: u32 = 1;

/// Non-reentrant flag locks gating the engine's compound operations.
struct EngineLocks {
    search: Mutex<()>,
    consolidate: Mutex<()>,
    prune: Mutex<()>,
    compact: Mutex<()>,
}

struct Secrets {
    salt: String,
    cipher: ExportCipher,
}

pub(crate) struct LifecycleState {
    pub(crate) token: tokio_util::sync::CancellationToken,
    pub(crate) tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Host resource snapshot reported by [`MemoryEngine::get_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct MemoryUsage {
    /// Whether the host probe succeeded
    pub supported: bool,
    /// Bytes in use on the data volume
    pub usage: u64,
    /// Total bytes of the data volume
    pub quota: u64,
    /// Free bytes remaining
    pub remaining: u64,
}

/// Engine counters and placement totals.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    /// Records across all tiers
    pub total: u64,
    /// Records in the HOT index
    pub hot: u64,
    /// Records in the WARM store
    pub warm: u64,
    /// Records in the COLD store
    pub cold: u64,
    /// Journal rows currently held
    pub journal: u64,
    /// Monotonic journal sequence counter
    pub journal_counter: u64,
    /// Writes since the last consolidation pass
    pub records_since_consolidation: u64,
    /// Soft-deletes since the last compaction
    pub deletions_since_compaction: u64,
    /// Mutations since the last index save
    pub mutations_since_last_save: u64,
    /// Host storage snapshot
    pub memory: MemoryUsage,
    /// Active configuration
    pub config: MemoryConfig,
}

/// A record as it appears in an export: no embedding.
#[derive(Debug, Clone, Serialize)]
pub struct ExportedRecord {
    /// Record id
    pub id: String,
    /// Original text
    pub text: String,
    /// Creation time (epoch ms)
    pub timestamp: i64,
    /// Last access time (epoch ms)
    pub last_accessed: i64,
    /// Episodic flag
    pub episodic: bool,
    /// Importance in [0, 1]
    pub importance: f32,
    /// Access count
    pub usage_count: u32,
    /// Consolidation cluster handle
    pub semantic_cluster_id: Option<String>,
    /// Content hash
    pub integrity_hash: String,
    /// Embedding fingerprint
    pub embedding_hash: String,
    /// Tier placement at export time
    pub current_tier: MemoryTier,
    /// Caller metadata
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl From<&MemoryRecord> for ExportedRecord {
    fn from(record: &MemoryRecord) -> Self {
        Self {
            id: record.id.clone(),
            text: record.text.clone(),
            timestamp: record.timestamp,
            last_accessed: record.last_accessed,
            episodic: record.episodic,
            importance: record.importance,
            usage_count: record.usage_count,
            semantic_cluster_id: record.semantic_cluster_id.clone(),
            integrity_hash: record.integrity_hash.clone(),
            embedding_hash: record.embedding_hash.clone(),
            current_tier: record.current_tier,
            metadata: record.metadata.clone(),
        }
    }
}

/// Full export payload: everything except embeddings.
#[derive(Debug, Clone, Serialize)]
pub struct ExportPayload {
    /// Export format version
    pub version: u32,
    /// Export time (epoch ms)
    pub timestamp: i64,
    /// Active configuration
    pub config: MemoryConfig,
    /// Counters at export time
    pub stats: MemoryStats,
    /// Records without embeddings
    pub records: Vec<ExportedRecord>,
}

/// The tiered memory engine.
///
/// One instance owns the five KV stores, the journal, and both ANN
/// indexes. Multiple instances must use disjoint data directories.
pub struct MemoryEngine {
    config: MemoryConfig,
    provider: Arc<dyn EmbeddingProvider>,
    storage: Storage,
    journal: Journal,
    indexes: Mutex<IndexManager>,
    recon_cache: Mutex<LruCache<String, Vec<f32>>>,
    secrets: OnceLock<Secrets>,
    locks: EngineLocks,
    records_since_consolidation: AtomicU64,
    mutations_since_last_save: AtomicU64,
    initialized: AtomicBool,
    lifecycle: Mutex<LifecycleState>,
    self_ref: Weak<MemoryEngine>,
}

impl MemoryEngine {
    /// Build an engine over `config` with the injected provider.
    ///
    /// Opens the database but starts nothing; call
    /// [`initialize`](Self::initialize) before any other operation.
    pub fn new(config: MemoryConfig, provider: Arc<dyn EmbeddingProvider>) -> Result<Arc<Self>> {
        config.validate()?;
        if provider.dimension() != config.embed_dim {
            return Err(MemoryError::DimensionMismatch {
                expected: config.embed_dim,
                got: provider.dimension(),
            });
        }

        let storage = Storage::open(config.database_path())?;
        let journal = Journal::new(storage.clone(), config.journal_rotation_size);
        let indexes = IndexManager::new(
            Box::new(HnswAnnIndex::new(config.embed_dim, config.hnsw.clone())),
            Box::new(HnswAnnIndex::new(config.embed_dim, config.hnsw.clone())),
            config.compaction_threshold,
        );

        let cache_capacity =
            NonZeroUsize::new(RECON_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);

        Ok(Arc::new_cyclic(|weak| Self {
            config,
            provider,
            storage,
            journal,
            indexes: Mutex::new(indexes),
            recon_cache: Mutex::new(LruCache::new(cache_capacity)),
            secrets: OnceLock::new(),
            locks: EngineLocks {
                search: Mutex::new(()),
                consolidate: Mutex::new(()),
                prune: Mutex::new(()),
                compact: Mutex::new(()),
            },
            records_since_consolidation: AtomicU64::new(0),
            mutations_since_last_save: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            lifecycle: Mutex::new(LifecycleState {
                token: tokio_util::sync::CancellationToken::new(),
                tasks: Vec::new(),
            }),
            self_ref: weak.clone(),
        }))
    }

    /// Open stores, restore salt/key/journal state, replay the journal
    /// tail, load index snapshots, and start background maintenance.
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.journal.restore().await?;

        let salt = match self.storage.get(StoreName::Meta, META_SALT).await? {
            Some(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            None => {
                let salt = hex::encode(rand::random::<[u8; 16]>());
                self.storage
                    .put(StoreName::Meta, META_SALT, salt.as_bytes())
                    .await?;
                salt
            }
        };
        let cipher = match self.storage.get(StoreName::Meta, META_ENCRYPTION_KEY).await? {
            Some(bytes) => ExportCipher::from_bytes(&bytes)?,
            None => {
                let cipher = ExportCipher::generate();
                self.storage
                    .put(StoreName::Meta, META_ENCRYPTION_KEY, cipher.key_bytes())
                    .await?;
                cipher
            }
        };
        let _ = self.secrets.set(Secrets { salt, cipher });

        let (hot_loaded, warm_loaded) = {
            let mut indexes = self.indexes.lock().await;
            indexes.load_all(&self.config.data_dir)?
        };
        let replayed = self.replay_journal_tail().await?;
        self.spawn_background().await;
        self.initialized.store(true, Ordering::SeqCst);

        info!(
            data_dir = %self.config.data_dir.display(),
            journal_counter = self.journal.counter(),
            hot_loaded,
            warm_loaded,
            replayed,
            "memory engine initialized"
        );
        Ok(())
    }

    /// Re-materialize journaled writes newer than the save watermark
    /// whose records are present in no tier (crash between journal
    /// append and WARM insert).
    async fn replay_journal_tail(&self) -> Result<u64> {
        let watermark = self
            .storage
            .get(StoreName::Meta, META_JOURNAL_WATERMARK)
            .await?
            .and_then(|bytes| bytes.try_into().ok().map(u64::from_be_bytes))
            .unwrap_or(0);

        // Newest snapshot per record id past the watermark
        let mut tail: Vec<(String, StoredRecord)> = Vec::new();
        for entry in self.journal.entries().await? {
            if entry.seq <= watermark {
                continue;
            }
            if let Some(slot) = tail.iter_mut().find(|(id, _)| *id == entry.record_id) {
                slot.1 = entry.snapshot;
            } else {
                tail.push((entry.record_id, entry.snapshot));
            }
        }
        if tail.is_empty() {
            return Ok(0);
        }

        let hot_ids: std::collections::HashSet<String> = {
            let indexes = self.indexes.lock().await;
            indexes
                .hot()
                .all_metadata()
                .into_iter()
                .map(|(_, meta)| meta.id)
                .collect()
        };

        let mut replayed = 0u64;
        for (id, mut snapshot) in tail {
            if hot_ids.contains(&id)
                || self.storage.get(StoreName::Warm, &id).await?.is_some()
                || self.storage.get(StoreName::Cold, &id).await?.is_some()
            {
                continue;
            }
            let embedding = snapshot.embedding.to_f32();
            if embedding.len() != self.config.embed_dim {
                warn!(id = %id, "journal snapshot has a malformed embedding, skipping");
                continue;
            }
            let handle = {
                let mut indexes = self.indexes.lock().await;
                indexes
                    .warm_mut()
                    .insert_with_metadata(&embedding, snapshot.meta.clone())?
            };
            snapshot.warm_index_handle = Some(handle);
            self.storage
                .put(StoreName::Warm, &id, &snapshot.encode()?)
                .await?;
            replayed += 1;
        }
        if replayed > 0 {
            info!(replayed, "journal replay restored records into WARM");
        }
        Ok(replayed)
    }

    pub(crate) fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MemoryError::NotInitialized)
        }
    }

    pub(crate) fn salt(&self) -> Result<&str> {
        self.ensure_initialized()?;
        self.secrets
            .get()
            .map(|s| s.salt.as_str())
            .ok_or(MemoryError::NotInitialized)
    }

    fn cipher(&self) -> Result<&ExportCipher> {
        self.ensure_initialized()?;
        self.secrets
            .get()
            .map(|s| &s.cipher)
            .ok_or(MemoryError::NotInitialized)
    }

    /// Embed, journal, and store one text into the WARM tier.
    pub async fn create_memory_record(
        &self,
        text: &str,
        options: RecordOptions,
    ) -> Result<MemoryRecord> {
        self.ensure_initialized()?;
        let text = text.trim();
        if text.is_empty() {
            return Err(MemoryError::InvalidInput("text must not be empty".to_string()));
        }

        let provider = self.provider.clone();
        let owned = text.to_string();
        let embedding = call_with_retry("embed", || {
            let provider = provider.clone();
            let text = owned.clone();
            async move { provider.embed(&text).await }
        })
        .await?;
        self.check_dimension(&embedding)?;

        let mut record = MemoryRecord::new(
            text.to_string(),
            embedding,
            options,
            self.salt()?,
        );
        self.insert_warm_record(&mut record).await?;
        self.after_write(1);
        Ok(record)
    }

    /// Batch write path; embeddings are generated in chunks of five and
    /// each record is journaled and stored individually (no cross-record
    /// transactional guarantee).
    pub async fn create_memory_records(
        &self,
        texts: &[String],
        options: RecordOptions,
    ) -> Result<Vec<MemoryRecord>> {
        self.ensure_initialized()?;
        let trimmed: Vec<String> = texts.iter().map(|t| t.trim().to_string()).collect();
        if trimmed.iter().any(|t| t.is_empty()) {
            return Err(MemoryError::InvalidInput(
                "batch contains an empty text".to_string(),
            ));
        }

        let mut records = Vec::with_capacity(trimmed.len());
        for chunk in trimmed.chunks(5) {
            let provider = self.provider.clone();
            let batch: Vec<String> = chunk.to_vec();
            let embeddings = call_with_retry("embed_batch", || {
                let provider = provider.clone();
                let batch = batch.clone();
                async move { provider.embed_batch(&batch).await }
            })
            .await?;
            if embeddings.len() != chunk.len() {
                return Err(MemoryError::Encoder {
                    operation: "embed_batch",
                    attempts: 1,
                    message: format!(
                        "expected {} embeddings, got {}",
                        chunk.len(),
                        embeddings.len()
                    ),
                });
            }
            for (text, embedding) in chunk.iter().zip(embeddings) {
                self.check_dimension(&embedding)?;
                let mut record = MemoryRecord::new(
                    text.clone(),
                    embedding,
                    options.clone(),
                    self.salt()?,
                );
                self.insert_warm_record(&mut record).await?;
                self.after_write(1);
                records.push(record);
            }
        }
        Ok(records)
    }

    pub(crate) fn check_dimension(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.config.embed_dim {
            return Err(MemoryError::DimensionMismatch {
                expected: self.config.embed_dim,
                got: embedding.len(),
            });
        }
        Ok(())
    }

    /// Journal and place a record into the WARM tier (index + store).
    pub(crate) async fn insert_warm_record(&self, record: &mut MemoryRecord) -> Result<()> {
        let mut stored = StoredRecord {
            meta: record.meta(),
            embedding: StoredEmbedding::Half(codec::quantize_vec_f16(&record.embedding)),
            warm_index_handle: None,
        };
        self.journal.append(&record.id, stored.clone()).await?;

        let handle = {
            let mut indexes = self.indexes.lock().await;
            indexes
                .warm_mut()
                .insert_with_metadata(&record.embedding, record.meta())?
        };
        record.warm_index_handle = Some(handle);
        record.hot_index_handle = None;
        record.current_tier = MemoryTier::Warm;
        stored.warm_index_handle = Some(handle);
        self.storage
            .put(StoreName::Warm, &record.id, &stored.encode()?)
            .await?;

        self.recon_cache
            .lock()
            .await
            .put(record.id.clone(), record.embedding.clone());
        debug!(id = %record.id, handle, "record written to WARM");
        Ok(())
    }

    /// Write-path bookkeeping: consolidation cadence and save batching.
    fn after_write(&self, count: u64) {
        let writes = self
            .records_since_consolidation
            .fetch_add(count, Ordering::SeqCst)
            + count;
        if writes >= self.config.consolidation_interval {
            self.schedule_consolidation();
        }
        self.note_mutations(count);
    }

    /// Count mutations toward the batched save trigger.
    pub(crate) fn note_mutations(&self, count: u64) {
        let total = self
            .mutations_since_last_save
            .fetch_add(count, Ordering::SeqCst)
            + count;
        if total >= self.config.mutation_batch_size {
            self.schedule_save();
        }
    }

    fn upgrade(&self) -> Option<Arc<MemoryEngine>> {
        self.self_ref.upgrade()
    }

    /// Enqueue a save to the executor; never awaited inline.
    pub(crate) fn schedule_save(&self) {
        if let Some(engine) = self.upgrade() {
            tokio::spawn(async move {
                if let Err(e) = engine.save().await {
                    warn!("scheduled save failed: {e}");
                }
            });
        }
    }

    /// Enqueue a consolidation pass to the executor.
    pub(crate) fn schedule_consolidation(&self) {
        if let Some(engine) = self.upgrade() {
            tokio::spawn(async move {
                if let Err(e) = engine.consolidate(false).await {
                    warn!("scheduled consolidation failed: {e}");
                }
            });
        }
    }

    /// Enqueue an index compaction to the executor.
    pub(crate) fn schedule_compaction(&self) {
        if let Some(engine) = self.upgrade() {
            tokio::spawn(async move {
                if let Err(e) = engine.run_compaction().await {
                    warn!("scheduled compaction failed: {e}");
                }
            });
        }
    }

    /// Compact both indexes and persist them. Skips when a compaction
    /// is already in flight.
    pub(crate) async fn run_compaction(&self) -> Result<()> {
        let Ok(_guard) = self.locks.compact.try_lock() else {
            debug!("compaction already in flight, skipping");
            return Ok(());
        };
        let mut indexes = self.indexes.lock().await;
        indexes.compact_all()?;
        indexes.save_all(&self.config.data_dir)?;
        Ok(())
    }

    /// Every record across the three tiers, embeddings included.
    pub async fn get_all_records(&self) -> Result<Vec<MemoryRecord>> {
        self.ensure_initialized()?;
        let mut out = Vec::new();

        {
            let indexes = self.indexes.lock().await;
            for (handle, meta) in indexes.hot().all_metadata() {
                let embedding = indexes.hot().get_vector(handle).unwrap_or_default();
                out.push(MemoryRecord::from_meta(
                    meta,
                    embedding,
                    MemoryTier::Hot,
                    Some(handle),
                    None,
                ));
            }
        }

        for (_, bytes) in self.storage.get_all(StoreName::Warm).await? {
            let stored = StoredRecord::decode(&bytes)?;
            let embedding = stored.embedding.to_f32();
            out.push(MemoryRecord::from_meta(
                stored.meta,
                embedding,
                MemoryTier::Warm,
                None,
                stored.warm_index_handle,
            ));
        }

        for (_, bytes) in self.storage.get_all(StoreName::Cold).await? {
            let stored = StoredRecord::decode(&bytes)?;
            let embedding = stored.embedding.to_f32();
            out.push(MemoryRecord::from_meta(
                stored.meta,
                embedding,
                MemoryTier::Cold,
                None,
                None,
            ));
        }

        Ok(out)
    }

    /// Placement totals, counters, and the host storage snapshot.
    pub async fn get_stats(&self) -> Result<MemoryStats> {
        self.ensure_initialized()?;
        let (hot, deletions) = {
            let indexes = self.indexes.lock().await;
            (
                indexes.hot().len() as u64,
                indexes.deletions_since_compaction(),
            )
        };
        let warm = self.storage.count(StoreName::Warm).await?;
        let cold = self.storage.count(StoreName::Cold).await?;
        Ok(MemoryStats {
            total: hot + warm + cold,
            hot,
            warm,
            cold,
            journal: self.journal.len().await?,
            journal_counter: self.journal.counter(),
            records_since_consolidation: self.records_since_consolidation.load(Ordering::SeqCst),
            deletions_since_compaction: deletions,
            mutations_since_last_save: self.mutations_since_last_save.load(Ordering::SeqCst),
            memory: self.probe_memory(),
            config: self.config.clone(),
        })
    }

    pub(crate) fn probe_memory(&self) -> MemoryUsage {
        match psutil::disk::disk_usage(&self.config.data_dir) {
            Ok(usage) => MemoryUsage {
                supported: true,
                usage: usage.used(),
                quota: usage.total(),
                remaining: usage.free(),
            },
            Err(_) => MemoryUsage {
                supported: false,
                usage: 0,
                quota: 0,
                remaining: 0,
            },
        }
    }

    /// Persist both ANN indexes and advance the recovery watermark.
    pub async fn save(&self) -> Result<()> {
        self.ensure_initialized()?;
        {
            let indexes = self.indexes.lock().await;
            indexes.save_all(&self.config.data_dir)?;
        }
        self.storage
            .put(
                StoreName::Meta,
                META_JOURNAL_WATERMARK,
                &self.journal.counter().to_be_bytes(),
            )
            .await?;
        self.mutations_since_last_save.store(0, Ordering::SeqCst);
        debug!("indexes saved");
        Ok(())
    }

    /// Export every record (without embeddings) plus config and stats.
    pub async fn export(&self) -> Result<ExportPayload> {
        self.ensure_initialized()?;
        let stats = self.get_stats().await?;
        let records = self
            .get_all_records()
            .await?
            .iter()
            .map(ExportedRecord::from)
            .collect();
        Ok(ExportPayload {
            version: EXPORT_VERSION,
            timestamp: chrono::Utc::now().timestamp_millis(),
            config: self.config.clone(),
            stats,
            records,
        })
    }

    /// Export sealed with the instance key (AES-256-GCM, nonce-prefixed).
    pub async fn export_encrypted(&self) -> Result<Vec<u8>> {
        let payload = self.export().await?;
        let bytes = serde_json::to_vec(&payload)?;
        self.cipher()?.encrypt(&bytes)
    }

    /// Remove every record, journal row, and index node. The salt, the
    /// export key, and the journal counter survive so sequence numbers
    /// stay monotonic.
    pub async fn clear(&self) -> Result<()> {
        self.ensure_initialized()?;
        {
            let mut indexes = self.indexes.lock().await;
            indexes.clear_all();
        }
        self.storage.clear(StoreName::Warm).await?;
        self.storage.clear(StoreName::Cold).await?;
        self.storage.clear(StoreName::Core).await?;
        self.journal.clear().await?;
        self.storage
            .put(
                StoreName::Meta,
                META_JOURNAL_WATERMARK,
                &self.journal.counter().to_be_bytes(),
            )
            .await?;
        self.recon_cache.lock().await.clear();
        self.records_since_consolidation.store(0, Ordering::SeqCst);
        self.mutations_since_last_save.store(0, Ordering::SeqCst);
        info!("engine cleared");
        Ok(())
    }

    /// Active configuration.
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }
}
