// lememoire - Tiered Vector Memory Engine
//
// *La Mémoire* (The Memory) - Embedded semantic memory with HOT/WARM/COLD tiering

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod provider;
pub mod record;
pub mod store;

mod crypto;

pub use config::MemoryConfig;
pub use engine::{
    ExportPayload, ExportedRecord, MemoryEngine, MemoryStats, MemoryUsage, ScoredRecord,
    SearchFilters, SearchOptions,
};
pub use error::{MemoryError, Result};
pub use index::{AnnIndex, CompactStats, Handle, HnswAnnIndex, HnswParams, IndexManager};
pub use provider::{EmbeddingProvider, GenerateOptions, HashedEmbedder};
pub use record::{MemoryRecord, MemoryTier, RecordMeta, RecordOptions};
pub use store::{Journal, JournalEntry, Storage, StoreName, StoredEmbedding, StoredRecord};

/// Memory library initialization
pub fn init() {
    let _ = tracing::subscriber::set_default(tracing::subscriber::NoSubscriber::default());
}
