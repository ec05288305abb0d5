//! src/services/staging_janitor.rs
//!
//! StagingJanitor: every path that ends a session's staging goes through
//! here: cleanup after assembly, explicit abandon, TTL sweep, and the orphan
//! purge run at startup.

use crate::{
    errors::{UploadError, UploadResult},
    models::session::{SessionState, UploadId},
    services::{
        assembler::ASSEMBLING_PREFIX,
        chunk_store::ChunkStore,
        staging_budget::StagingBudget,
        transfer_tracker::{Lookup, SessionEntry, SessionHandle, TransferTracker},
    },
};
use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::{
    fs,
    sync::MutexGuard,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

/// What one sweep removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub abandoned: Vec<UploadId>,
    pub bytes_freed: u64,
    pub tombstones_purged: usize,
}

#[derive(Clone, Debug)]
pub struct StagingJanitor {
    tracker: Arc<TransferTracker>,
    chunks: ChunkStore,
    budget: Arc<StagingBudget>,
    artifact_root: PathBuf,
}

impl StagingJanitor {
    pub fn new(
        tracker: Arc<TransferTracker>,
        chunks: ChunkStore,
        budget: Arc<StagingBudget>,
        artifact_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tracker,
            chunks,
            budget,
            artifact_root: artifact_root.into(),
        }
    }

    /// Remove staging and tracker state of an assembled session.
    ///
    /// The artifact is kept on the tombstone so late duplicates of the final
    /// chunk still receive it.
    pub async fn cleanup(&self, upload_id: &UploadId) -> UploadResult<()> {
        let handle = match self.tracker.lookup(upload_id) {
            Lookup::Live(handle) => handle,
            Lookup::Closed(_) => return Ok(()),
            Lookup::Unknown => return Err(UploadError::UnknownUpload(upload_id.to_string())),
        };

        let mut entry = handle.lock().await;
        if entry.session.state != SessionState::Assembled {
            return Err(UploadError::Validation(format!(
                "upload `{upload_id}` is {:?}, not assembled",
                entry.session.state
            )));
        }
        let freed = self.close(&handle, &mut entry).await?;
        info!(upload_id = %upload_id, bytes_freed = freed, "cleaned up staging");
        Ok(())
    }

    /// Cancel a session that is neither assembling nor assembled.
    ///
    /// Subsequent chunks for the id fail with `SessionClosed`.
    pub async fn abandon(&self, upload_id: &UploadId) -> UploadResult<u64> {
        let handle = match self.tracker.lookup(upload_id) {
            Lookup::Live(handle) => handle,
            Lookup::Closed(_) => return Err(UploadError::SessionClosed(upload_id.to_string())),
            Lookup::Unknown => return Err(UploadError::UnknownUpload(upload_id.to_string())),
        };

        let mut entry = handle.lock().await;
        if !entry.session.state.is_sweepable() {
            return Err(UploadError::SessionClosed(upload_id.to_string()));
        }
        entry.session.state = SessionState::Abandoned;
        let freed = self.close(&handle, &mut entry).await?;
        warn!(upload_id = %upload_id, bytes_freed = freed, "abandoned upload session");
        Ok(freed)
    }

    /// Drop tombstones older than `ttl`, then abandon every session idle for
    /// at least `ttl` that [`SessionState::is_sweepable`] allows.
    pub async fn sweep_expired(&self, ttl: Duration) -> SweepReport {
        // Purge first so tombstones created by this sweep live a full `ttl`.
        let mut report = SweepReport {
            tombstones_purged: self.tracker.purge_tombstones(ttl),
            ..SweepReport::default()
        };

        for handle in self.tracker.live_sessions() {
            let mut entry = handle.lock().await;
            if !entry.session.state.is_sweepable() || entry.session.last_activity.elapsed() < ttl {
                continue;
            }
            entry.session.state = SessionState::Abandoned;
            match self.close(&handle, &mut entry).await {
                Ok(freed) => {
                    report.bytes_freed += freed;
                    report.abandoned.push(handle.id().clone());
                }
                Err(err) => {
                    warn!(upload_id = %handle.id(), error = %err, "failed to sweep session")
                }
            }
        }

        if !report.abandoned.is_empty() {
            info!(
                sessions = report.abandoned.len(),
                bytes_freed = report.bytes_freed,
                "swept expired upload sessions"
            );
        }
        report
    }

    /// Undo a session whose first chunk was refused. The id is forgotten
    /// rather than closed, so the client may try again.
    ///
    /// Does nothing once any chunk of the session has been recorded.
    pub async fn discard_unstaged(&self, handle: &Arc<SessionHandle>) -> UploadResult<bool> {
        let mut entry = handle.lock().await;
        if entry.session.state != SessionState::Created || entry.received() > 0 {
            return Ok(false);
        }
        // Other holders of the handle must not stage into a forgotten session.
        entry.session.state = SessionState::Abandoned;
        self.tracker.forget(handle);
        self.chunks.remove_session(handle.id()).await?;
        debug!(upload_id = %handle.id(), "discarded session refused on first chunk");
        Ok(true)
    }

    /// Remove staging directories and half-written artifacts left behind by a
    /// previous process. Only safe before any session is opened.
    pub async fn purge_orphans(&self) -> UploadResult<usize> {
        if self.tracker.live_count() > 0 {
            warn!("skipping orphan purge: sessions are already open");
            return Ok(0);
        }

        let mut removed = 0;
        let staging_root = self.chunks.staging_root();
        match fs::read_dir(staging_root).await {
            Ok(mut shards) => {
                while let Some(shard) = shards.next_entry().await? {
                    if shard.file_type().await?.is_dir() {
                        fs::remove_dir_all(shard.path()).await?;
                    } else {
                        fs::remove_file(shard.path()).await?;
                    }
                    removed += 1;
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(UploadError::Storage(err)),
        }

        match fs::read_dir(&self.artifact_root).await {
            Ok(mut kinds) => {
                while let Some(kind_dir) = kinds.next_entry().await? {
                    if !kind_dir.file_type().await?.is_dir() {
                        continue;
                    }
                    let mut files = fs::read_dir(kind_dir.path()).await?;
                    while let Some(file) = files.next_entry().await? {
                        if file.file_name().to_string_lossy().starts_with(ASSEMBLING_PREFIX) {
                            fs::remove_file(file.path()).await?;
                            removed += 1;
                        }
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(UploadError::Storage(err)),
        }

        if removed > 0 {
            info!(removed, "purged orphaned staging data");
        }
        Ok(removed)
    }

    /// Run [`Self::sweep_expired`] every `every` until the runtime shuts down.
    pub fn spawn_sweeper(self, ttl: Duration, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!("running staging sweep");
                self.sweep_expired(ttl).await;
            }
        })
    }

    /// Drop the session's records and staging, release its budget and move it
    /// to the tombstones. Caller holds the session lock.
    async fn close(
        &self,
        handle: &SessionHandle,
        entry: &mut MutexGuard<'_, SessionEntry>,
    ) -> UploadResult<u64> {
        let upload_id = handle.id();
        let freed = entry.drain_records();
        let removed = self.chunks.remove_session(upload_id).await;
        // Records are already gone, so their bytes are released regardless;
        // anything left on disk is caught by the next startup purge.
        self.budget.release(freed);
        entry.session.state = SessionState::Cleaned;
        self.tracker
            .close(upload_id, entry.session.clone(), entry.artifact().cloned());
        removed.map(|_| freed)
    }
}
