//! src/services/upload_service.rs
//!
//! UploadService: the boundary HTTP handlers talk to. It wires the chunk
//! store, tracker, assembler and janitor together:
//!
//! chunk arrives → `ChunkStore::put` → `SessionEntry::mark_arrived` → if
//! complete → `Assembler::run` (assemble, register) → `StagingJanitor::cleanup`.
//!
//! Layout beneath `storage_dir`:
//! - `staging/{shard}/{upload_id}/{index}.chunk`: unassembled chunks
//! - `artifacts/{kind}/{uuid}-{file_name}`: finished artifacts

use crate::{
    errors::{UploadError, UploadResult},
    models::{
        artifact::Artifact,
        session::{TransferKind, UploadId, sanitize_file_name},
    },
    services::{
        artifact_registry::ArtifactRegistry,
        assembler::Assembler,
        chunk_store::ChunkStore,
        staging_budget::StagingBudget,
        staging_janitor::{StagingJanitor, SweepReport},
        transfer_tracker::{Admission, Opened, SessionHandle, SessionStatus, TransferTracker},
    },
};
use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    fs::{self, File},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Tunables for admission and expiry.
#[derive(Clone, Debug)]
pub struct UploadLimits {
    /// Cap on staged-but-unassembled bytes across all sessions.
    pub max_staged_bytes: u64,
    /// Largest single chunk accepted.
    pub max_chunk_bytes: u64,
    /// Largest declared chunk count accepted.
    pub max_total_chunks: u32,
    /// Idle time after which an incomplete session is abandoned.
    pub session_ttl: Duration,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_staged_bytes: 10 * 1024 * 1024 * 1024,
            max_chunk_bytes: 64 * 1024 * 1024,
            max_total_chunks: 100_000,
            session_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// One inbound chunk, minus its payload.
#[derive(Clone, Debug)]
pub struct ChunkSubmission {
    pub upload_id: String,
    pub index: u32,
    pub total_chunks: u32,
    pub file_name: String,
    pub kind: TransferKind,
}

/// The artifact identity returned to clients.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ArtifactRef {
    pub name: String,
    pub kind: TransferKind,
    pub size_bytes: i64,
    pub etag: String,
}

impl From<&Artifact> for ArtifactRef {
    fn from(artifact: &Artifact) -> Self {
        Self {
            name: artifact.name.clone(),
            kind: artifact.kind,
            size_bytes: artifact.size_bytes,
            etag: artifact.etag.clone(),
        }
    }
}

/// Acknowledgment of a chunk. `artifact` is set once the transfer is assembled.
#[derive(Clone, Debug, Serialize)]
pub struct ChunkAck {
    pub upload_id: UploadId,
    pub index: u32,
    pub received: usize,
    pub total_chunks: u32,
    pub complete: bool,
    pub artifact: Option<ArtifactRef>,
}

#[derive(Clone)]
pub struct UploadService {
    tracker: Arc<TransferTracker>,
    budget: Arc<StagingBudget>,
    chunks: ChunkStore,
    assembler: Assembler,
    janitor: StagingJanitor,
    registry: Arc<dyn ArtifactRegistry>,
    limits: UploadLimits,
    base_path: PathBuf,
}

impl UploadService {
    /// Build the service rooted at `base_path`, creating its directories.
    pub async fn new(
        base_path: impl Into<PathBuf>,
        registry: Arc<dyn ArtifactRegistry>,
        limits: UploadLimits,
    ) -> UploadResult<Self> {
        let base_path = base_path.into();
        let staging_root = base_path.join("staging");
        let artifact_root = base_path.join("artifacts");
        fs::create_dir_all(&staging_root).await?;
        fs::create_dir_all(&artifact_root).await?;

        let tracker = Arc::new(TransferTracker::new());
        let budget = Arc::new(StagingBudget::new(limits.max_staged_bytes));
        let chunks = ChunkStore::new(staging_root, budget.clone(), limits.max_chunk_bytes);
        let assembler =
            Assembler::new(tracker.clone(), chunks.clone(), &artifact_root, registry.clone());
        let janitor =
            StagingJanitor::new(tracker.clone(), chunks.clone(), budget.clone(), &artifact_root);

        Ok(Self {
            tracker,
            budget,
            chunks,
            assembler,
            janitor,
            registry,
            limits,
            base_path,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    pub fn budget(&self) -> &StagingBudget {
        &self.budget
    }

    pub fn registry(&self) -> &Arc<dyn ArtifactRegistry> {
        &self.registry
    }

    pub fn staging_dir(&self, upload_id: &UploadId) -> PathBuf {
        self.chunks.session_dir(upload_id)
    }

    /// Accept one chunk of an upload.
    ///
    /// Retries of an index overwrite it. The chunk completing the set
    /// triggers assembly; concurrent or late duplicates of that chunk receive
    /// the same artifact without writing anything.
    pub async fn submit_chunk<S>(
        &self,
        submission: ChunkSubmission,
        stream: S,
    ) -> UploadResult<ChunkAck>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let upload_id = UploadId::parse(&submission.upload_id)?;
        let file_name = sanitize_file_name(&submission.file_name)?;
        let (index, total_chunks) = (submission.index, submission.total_chunks);
        ChunkStore::validate_index(index, total_chunks)?;
        if total_chunks > self.limits.max_total_chunks {
            return Err(UploadError::Validation(format!(
                "total chunk count {total_chunks} exceeds the limit of {}",
                self.limits.max_total_chunks
            )));
        }

        let opened = self
            .tracker
            .open(&upload_id, total_chunks, &file_name, submission.kind, || {
                if self.budget.is_full() {
                    Err(UploadError::StorageExhausted {
                        requested: 0,
                        available: self.budget.available(),
                    })
                } else {
                    Ok(())
                }
            })?;
        let (handle, created) = match opened {
            Opened::Live(handle) => (handle, false),
            Opened::Created(handle) => (handle, true),
            Opened::Assembled(artifact) => {
                debug!(upload_id = %upload_id, index, "chunk for an already assembled upload");
                return Ok(Self::completed_ack(upload_id, index, total_chunks, &artifact));
            }
        };

        // Cheap pre-check so closed or finished sessions never stage bytes.
        let admission = {
            let entry = handle.lock().await;
            entry.admit(total_chunks)
        };
        match self.resolve_admission(&handle, admission).await? {
            Admission::Accept => {}
            Admission::AlreadyComplete => return self.finish(upload_id, index, total_chunks).await,
        }

        let pending = match self.chunks.put(&upload_id, index, total_chunks, stream).await {
            Ok(pending) => pending,
            Err(err) => {
                if created {
                    self.discard_refused(&handle).await;
                }
                return Err(err);
            }
        };

        let mut entry = handle.lock().await;
        let admission = entry.admit(total_chunks);
        if !matches!(admission, Ok(Admission::Accept)) {
            drop(entry);
            pending.discard().await;
            return match self.resolve_admission(&handle, admission).await? {
                Admission::Accept => Err(UploadError::SessionClosed(upload_id.to_string())),
                Admission::AlreadyComplete => self.finish(upload_id, index, total_chunks).await,
            };
        }

        let record = match pending.persist().await {
            Ok(record) => record,
            Err(err) => {
                drop(entry);
                if created {
                    self.discard_refused(&handle).await;
                }
                return Err(err);
            }
        };
        let arrival = entry.mark_arrived(record);
        drop(entry);
        self.budget.release(arrival.replaced_bytes);

        debug!(
            upload_id = %upload_id,
            index,
            received = arrival.received,
            total_chunks,
            "chunk arrived"
        );

        if !arrival.complete {
            return Ok(ChunkAck {
                upload_id,
                index,
                received: arrival.received,
                total_chunks,
                complete: false,
                artifact: None,
            });
        }

        info!(upload_id = %upload_id, total_chunks, "all chunks received");
        self.finish(upload_id, index, total_chunks).await
    }

    /// Forget a session whose first chunk never made it into staging, so a
    /// refused id leaves no state behind.
    async fn discard_refused(&self, handle: &Arc<SessionHandle>) {
        if let Err(err) = self.janitor.discard_unstaged(handle).await {
            warn!(upload_id = %handle.id(), error = %err, "failed to discard refused session");
        }
    }

    /// Turn an admission decision into an error where needed. An inconsistent
    /// total aborts the whole upload id before the error is returned.
    async fn resolve_admission(
        &self,
        handle: &SessionHandle,
        admission: UploadResult<Admission>,
    ) -> UploadResult<Admission> {
        match admission {
            Err(err @ UploadError::InconsistentTransfer { .. }) => {
                warn!(upload_id = %handle.id(), error = %err, "aborting inconsistent upload");
                match self.janitor.abandon(handle.id()).await {
                    Ok(_) | Err(UploadError::SessionClosed(_)) => {}
                    Err(abandon_err) => warn!(
                        upload_id = %handle.id(),
                        error = %abandon_err,
                        "failed to abort upload"
                    ),
                }
                Err(err)
            }
            other => other,
        }
    }

    /// Assemble (or join the running assembly). The call that assembled, and
    /// so registered, the artifact also cleans up staging.
    ///
    /// Runs on its own task so a dropped request cannot strand a session in
    /// `Assembling`.
    async fn finish(
        &self,
        upload_id: UploadId,
        index: u32,
        total_chunks: u32,
    ) -> UploadResult<ChunkAck> {
        let service = self.clone();
        let task_id = upload_id.clone();
        let artifact = tokio::spawn(async move {
            let run = service.assembler.run(&task_id).await?;
            if run.claimed {
                if let Err(err) = service.janitor.cleanup(&task_id).await {
                    warn!(
                        upload_id = %task_id,
                        error = %err,
                        "staging cleanup after assembly failed"
                    );
                }
            }
            Ok::<_, UploadError>(run.artifact)
        })
        .await
        .map_err(|err| {
            UploadError::Storage(io::Error::other(format!("assembly task failed: {err}")))
        })??;

        Ok(Self::completed_ack(upload_id, index, total_chunks, &artifact))
    }

    fn completed_ack(
        upload_id: UploadId,
        index: u32,
        total_chunks: u32,
        artifact: &Artifact,
    ) -> ChunkAck {
        ChunkAck {
            upload_id,
            index,
            received: total_chunks as usize,
            total_chunks,
            complete: true,
            artifact: Some(ArtifactRef::from(artifact)),
        }
    }

    pub async fn status(&self, upload_id: &str) -> UploadResult<SessionStatus> {
        let upload_id = UploadId::parse(upload_id)?;
        self.tracker.status(&upload_id).await
    }

    /// Cancel an upload; its staging is freed and later chunks are refused.
    pub async fn abandon(&self, upload_id: &str) -> UploadResult<u64> {
        let upload_id = UploadId::parse(upload_id)?;
        self.janitor.abandon(&upload_id).await
    }

    /// Sweep sessions idle past the configured TTL.
    pub async fn sweep_expired(&self) -> SweepReport {
        self.janitor.sweep_expired(self.limits.session_ttl).await
    }

    /// Clear staging left by a previous process. Call before serving.
    pub async fn purge_orphans(&self) -> UploadResult<usize> {
        self.janitor.purge_orphans().await
    }

    /// Sweep expired sessions every `every` in the background.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        self.janitor.clone().spawn_sweeper(self.limits.session_ttl, every)
    }

    /// Registered artifact metadata, provided its file is still on disk.
    pub async fn find_artifact(&self, kind: &str, name: &str) -> UploadResult<Artifact> {
        let kind: TransferKind = kind.parse()?;
        let artifact = self
            .registry
            .find(kind, name)
            .await?
            .ok_or_else(|| UploadError::UnknownUpload(format!("{kind}/{name}")))?;
        match fs::try_exists(&artifact.location).await? {
            true => Ok(artifact),
            false => Err(UploadError::UnknownUpload(format!("{kind}/{name}"))),
        }
    }

    /// Open a registered artifact for reading.
    pub async fn open_artifact(&self, kind: &str, name: &str) -> UploadResult<(Artifact, File)> {
        let kind: TransferKind = kind.parse()?;
        let not_found = || UploadError::UnknownUpload(format!("{kind}/{name}"));

        let artifact = self.registry.find(kind, name).await?.ok_or_else(not_found)?;
        let file = File::open(&artifact.location).await.map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                not_found()
            } else {
                UploadError::Storage(err)
            }
        })?;
        Ok((artifact, file))
    }
}
