// Background maintenance: autosave, memory-pressure monitoring, shutdown

use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::MemoryEngine;
use crate::error::Result;
use crate::record::{MemoryRecord, MemoryTier};

/// HOT records below this usage count are demoted during emergency cleanup.
const EMERGENCY_USAGE_FLOOR: u32 = 5;

impl MemoryEngine {
    /// Start the autosave and memory-pressure tasks and, on Unix, a
    /// SIGTERM hook that performs a best-effort save.
    pub(crate) async fn spawn_background(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let token = lifecycle.token.clone();

        if self.config.autosave_enabled {
            let engine = self.self_ref.clone();
            let interval = Duration::from_millis(self.config.autosave_interval_ms.max(1));
            let autosave_token = token.clone();
            lifecycle.tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = autosave_token.cancelled() => {
                            debug!("autosave task stopping");
                            return;
                        }
                    }
                    let Some(engine) = engine.upgrade() else { return };
                    if engine.mutations_since_last_save.load(Ordering::SeqCst) > 0 {
                        if let Err(e) = engine.save().await {
                            warn!("autosave failed: {e}");
                        }
                    }
                    if let Err(e) = engine.journal.rotate_if_needed().await {
                        warn!("journal rotation failed: {e}");
                    }
                }
            }));
        }

        {
            let engine = self.self_ref.clone();
            let interval = Duration::from_millis(self.config.memory_check_interval_ms.max(1));
            let monitor_token = token.clone();
            lifecycle.tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = monitor_token.cancelled() => {
                            debug!("memory monitor stopping");
                            return;
                        }
                    }
                    let Some(engine) = engine.upgrade() else { return };
                    if let Err(e) = engine.check_memory_pressure().await {
                        warn!("memory pressure check failed: {e}");
                    }
                }
            }));
        }

        #[cfg(unix)]
        {
            let engine = self.self_ref.clone();
            let signal_token = token.clone();
            lifecycle.tasks.push(tokio::spawn(async move {
                let Ok(mut sigterm) =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                else {
                    return;
                };
                loop {
                    tokio::select! {
                        _ = sigterm.recv() => {}
                        _ = signal_token.cancelled() => return,
                    }
                    let Some(engine) = engine.upgrade() else { return };
                    engine.suspend().await;
                }
            }));
        }
    }

    /// Probe free space and run the warning or critical maintenance path.
    pub(crate) async fn check_memory_pressure(&self) -> Result<()> {
        let usage = self.probe_memory();
        if !usage.supported {
            return Ok(());
        }

        if usage.remaining < self.config.memory_critical_threshold {
            warn!(
                remaining = usage.remaining,
                "critical storage pressure, running emergency cleanup"
            );
            self.emergency_cleanup().await?;
        } else if usage.remaining < self.config.memory_warning_threshold {
            info!(
                remaining = usage.remaining,
                "storage pressure warning, pruning"
            );
            let pruned = self.prune(false).await?;
            if !pruned.is_empty() {
                self.run_compaction().await?;
            }
        }
        Ok(())
    }

    /// Critical-path maintenance: prune, aggressively demote barely-used
    /// HOT records, compact, and rotate the journal.
    pub(crate) async fn emergency_cleanup(&self) -> Result<()> {
        let _ = self.prune(false).await?;

        // Collect candidates first; demotion re-locks the indexes
        let candidates: Vec<(u64, crate::record::RecordMeta)> = {
            let indexes = self.indexes.lock().await;
            indexes
                .hot()
                .all_metadata()
                .into_iter()
                .filter(|(_, meta)| meta.usage_count < EMERGENCY_USAGE_FLOOR)
                .collect()
        };

        let mut demoted = 0usize;
        for (handle, meta) in candidates {
            // Reload the vector before demotion; the node metadata alone
            // would demote an empty embedding
            let embedding = {
                let indexes = self.indexes.lock().await;
                indexes.hot().get_vector(handle)
            };
            let embedding = match embedding {
                Some(v) => v,
                None => match self.reconstruct_embedding(&meta.id).await? {
                    Some(v) => v,
                    None => {
                        warn!(id = %meta.id, "no embedding recoverable, skipping demotion");
                        continue;
                    }
                },
            };
            let mut record = MemoryRecord::from_meta(
                meta,
                embedding,
                MemoryTier::Hot,
                Some(handle),
                None,
            );
            if self.demote_hot_to_warm(&mut record).await? {
                demoted += 1;
            }
        }

        self.run_compaction().await?;
        let rotated = self.journal.rotate().await?;
        info!(demoted, rotated, "emergency cleanup finished");
        Ok(())
    }

    /// Best-effort save for suspension events; failures are logged.
    pub async fn suspend(&self) {
        if self.ensure_initialized().is_err() {
            return;
        }
        info!("suspension event, saving");
        if let Err(e) = self.save().await {
            warn!("suspend save failed: {e}");
        }
    }

    /// Flush pending saves, stop the background tasks, and await them.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        // ensure_initialized is already false for new work; flush directly
        {
            let indexes = self.indexes.lock().await;
            indexes.save_all(&self.config.data_dir)?;
        }
        self.storage
            .put(
                crate::store::StoreName::Meta,
                super::META_JOURNAL_WATERMARK,
                &self.journal.counter().to_be_bytes(),
            )
            .await?;
        self.mutations_since_last_save.store(0, Ordering::SeqCst);

        let (token, tasks) = {
            let mut lifecycle = self.lifecycle.lock().await;
            let token = lifecycle.token.clone();
            // Fresh token so a later re-initialize can restart the tasks
            lifecycle.token = tokio_util::sync::CancellationToken::new();
            (token, std::mem::take(&mut lifecycle.tasks))
        };
        token.cancel();
        for task in tasks {
            let _ = task.await;
        }
        info!("memory engine shut down");
        Ok(())
    }
}
