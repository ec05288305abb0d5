//! src/services/assembler.rs
//!
//! Assembler: concatenates a completed session's chunks, in index order,
//! into `artifact_root/{kind}/{uuid}-{file_name}`.
//!
//! The `Complete → Assembling` transition is claimed under the session lock,
//! so exactly one caller assembles. Everyone else waits on the session's
//! outcome channel and receives the same artifact (or the same failure).
//!
//! The claimant registers the artifact before publishing it. Nobody is handed
//! an artifact the registry does not know about.

use crate::{
    errors::{UploadError, UploadResult},
    models::{
        artifact::Artifact,
        session::{SessionState, TransferKind, UploadId},
    },
    services::{
        artifact_registry::ArtifactRegistry,
        chunk_store::ChunkStore,
        transfer_tracker::{AssemblyOutcome, Lookup, SessionHandle, TransferTracker},
    },
};
use chrono::Utc;
use futures::StreamExt;
use md5::Context;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::watch,
};
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Prefix of in-progress artifact files; never served, purged at startup.
pub const ASSEMBLING_PREFIX: &str = ".assembling-";

/// Artifact produced (or observed) by [`Assembler::run`].
#[derive(Debug, Clone)]
pub struct AssemblyRun {
    pub artifact: Artifact,
    /// True only for the invocation that actually assembled.
    pub claimed: bool,
}

/// Everything needed to assemble, copied out of the session under its lock.
struct AssemblyPlan {
    upload_id: UploadId,
    total_chunks: u32,
    file_name: String,
    kind: TransferKind,
    expected_sizes: Vec<u64>,
}

enum Claim {
    Won(AssemblyPlan),
    Waiting(watch::Receiver<Option<AssemblyOutcome>>),
    Done(Artifact),
}

#[derive(Clone)]
pub struct Assembler {
    tracker: Arc<TransferTracker>,
    chunks: ChunkStore,
    artifact_root: PathBuf,
    registry: Arc<dyn ArtifactRegistry>,
}

impl Assembler {
    pub fn new(
        tracker: Arc<TransferTracker>,
        chunks: ChunkStore,
        artifact_root: impl Into<PathBuf>,
        registry: Arc<dyn ArtifactRegistry>,
    ) -> Self {
        Self {
            tracker,
            chunks,
            artifact_root: artifact_root.into(),
            registry,
        }
    }

    pub fn artifact_root(&self) -> &Path {
        &self.artifact_root
    }

    /// Assemble `upload_id`, or join the assembly already claimed for it.
    pub async fn run(&self, upload_id: &UploadId) -> UploadResult<AssemblyRun> {
        let handle = match self.tracker.lookup(upload_id) {
            Lookup::Live(handle) => handle,
            Lookup::Closed(tombstone) => {
                return match tombstone.artifact {
                    Some(artifact) => Ok(AssemblyRun {
                        artifact,
                        claimed: false,
                    }),
                    None => Err(UploadError::SessionClosed(upload_id.to_string())),
                };
            }
            Lookup::Unknown => return Err(UploadError::UnknownUpload(upload_id.to_string())),
        };

        match Self::claim(&handle).await? {
            Claim::Done(artifact) => Ok(AssemblyRun {
                artifact,
                claimed: false,
            }),
            Claim::Waiting(rx) => {
                let artifact = Self::wait(upload_id, rx).await?;
                Ok(AssemblyRun {
                    artifact,
                    claimed: false,
                })
            }
            Claim::Won(plan) => {
                let result = self.assemble_and_register(&plan).await;
                self.settle(&handle, result).await.map(|artifact| AssemblyRun {
                    artifact,
                    claimed: true,
                })
            }
        }
    }

    async fn claim(handle: &SessionHandle) -> UploadResult<Claim> {
        let mut entry = handle.lock().await;
        let id = handle.id().to_string();
        let state = entry.session.state;
        match state {
            SessionState::Complete => {
                let expected_sizes = (0..entry.session.total_chunks)
                    .map(|index| entry.record(index).map(|r| r.size_bytes))
                    .collect::<Option<Vec<_>>>();
                let Some(expected_sizes) = expected_sizes else {
                    let reason = "tracker lost a chunk record".to_string();
                    entry.set_failed(reason.clone());
                    return Err(UploadError::IncompleteTransfer { upload_id: id, reason });
                };

                entry.session.state = SessionState::Assembling;
                handle.reset_outcome();
                Ok(Claim::Won(AssemblyPlan {
                    upload_id: entry.session.id.clone(),
                    total_chunks: entry.session.total_chunks,
                    file_name: entry.session.file_name.clone(),
                    kind: entry.session.kind,
                    expected_sizes,
                }))
            }
            SessionState::Assembling => Ok(Claim::Waiting(handle.subscribe())),
            SessionState::Assembled | SessionState::Cleaned => match entry.artifact() {
                Some(artifact) => Ok(Claim::Done(artifact.clone())),
                None => Err(UploadError::SessionClosed(id)),
            },
            SessionState::Failed => Err(UploadError::IncompleteTransfer {
                upload_id: id,
                reason: entry.failure().unwrap_or("previous assembly failed").to_string(),
            }),
            SessionState::Created | SessionState::Receiving => {
                Err(UploadError::IncompleteTransfer {
                    upload_id: id,
                    reason: format!(
                        "{} of {} chunks received",
                        entry.received(),
                        entry.session.total_chunks
                    ),
                })
            }
            SessionState::Abandoned => Err(UploadError::SessionClosed(id)),
        }
    }

    async fn wait(
        upload_id: &UploadId,
        mut rx: watch::Receiver<Option<AssemblyOutcome>>,
    ) -> UploadResult<Artifact> {
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| UploadError::IncompleteTransfer {
                upload_id: upload_id.to_string(),
                reason: "assembly ended without a result".into(),
            })?
            .clone();

        match outcome {
            Some(AssemblyOutcome::Assembled(artifact)) => Ok(artifact),
            Some(AssemblyOutcome::Failed {
                reason,
                retryable: true,
            }) => Err(UploadError::Storage(std::io::Error::other(reason))),
            Some(AssemblyOutcome::Failed { reason, .. }) => Err(UploadError::IncompleteTransfer {
                upload_id: upload_id.to_string(),
                reason,
            }),
            None => Err(UploadError::IncompleteTransfer {
                upload_id: upload_id.to_string(),
                reason: "assembly ended without a result".into(),
            }),
        }
    }

    /// Record the claimant's result on the session and wake any waiters.
    ///
    /// Missing chunk data marks the session `Failed` and keeps its staging.
    /// A transient failure hands the session back to `Complete` so a resent
    /// chunk can trigger assembly again; it gets a full TTL before the sweep
    /// may reclaim it.
    async fn settle(
        &self,
        handle: &SessionHandle,
        result: UploadResult<Artifact>,
    ) -> UploadResult<Artifact> {
        let mut entry = handle.lock().await;
        match result {
            Ok(artifact) => {
                entry.set_artifact(artifact.clone());
                handle.publish(AssemblyOutcome::Assembled(artifact.clone()));
                info!(
                    upload_id = %handle.id(),
                    artifact = %artifact.name,
                    size = artifact.size_bytes,
                    "assembled artifact"
                );
                Ok(artifact)
            }
            Err(err) => {
                error!(upload_id = %handle.id(), error = %err, "assembly failed");
                let retryable = err.is_retryable();
                if retryable {
                    entry.session.state = SessionState::Complete;
                    entry.session.last_activity = Instant::now();
                } else {
                    entry.set_failed(err.to_string());
                }
                handle.publish(AssemblyOutcome::Failed {
                    reason: err.to_string(),
                    retryable,
                });
                Err(err)
            }
        }
    }

    /// Assemble, then hand the artifact to the registry. A failed
    /// registration removes the file again so a retry starts clean.
    async fn assemble_and_register(&self, plan: &AssemblyPlan) -> UploadResult<Artifact> {
        let artifact = self.assemble(plan).await?;
        if let Err(err) = self.registry.register(&artifact).await {
            if let Err(rm_err) = fs::remove_file(&artifact.location).await {
                warn!(
                    artifact = %artifact.name,
                    error = %rm_err,
                    "failed to remove unregistered artifact"
                );
            }
            return Err(err);
        }
        Ok(artifact)
    }

    async fn assemble(&self, plan: &AssemblyPlan) -> UploadResult<Artifact> {
        let dir = self.artifact_root.join(plan.kind.as_str());
        fs::create_dir_all(&dir).await?;

        let name = format!("{}-{}", Uuid::new_v4().simple(), plan.file_name);
        let final_path = dir.join(&name);
        let tmp_path = dir.join(format!("{ASSEMBLING_PREFIX}{}", Uuid::new_v4()));

        let written = self.concatenate(plan, &tmp_path).await;
        let (size_bytes, etag) = match written {
            Ok(summary) => summary,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Storage(err));
        }

        Ok(Artifact {
            id: Uuid::new_v4(),
            upload_id: plan.upload_id.to_string(),
            name,
            original_name: plan.file_name.clone(),
            kind: plan.kind,
            size_bytes: size_bytes as i64,
            etag,
            location: final_path.display().to_string(),
            completed_at: Utc::now(),
        })
    }

    /// Stream chunks `0..total` into `tmp_path`, returning size and MD5.
    async fn concatenate(
        &self,
        plan: &AssemblyPlan,
        tmp_path: &Path,
    ) -> UploadResult<(u64, String)> {
        let incomplete = |reason: String| UploadError::IncompleteTransfer {
            upload_id: plan.upload_id.to_string(),
            reason,
        };

        let mut out = File::create(tmp_path).await?;
        let mut digest = Context::new();
        let mut total: u64 = 0;

        for index in 0..plan.total_chunks {
            let file = self.chunks.open(&plan.upload_id, index).await.map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    incomplete(format!("chunk {index} is missing from staging"))
                } else {
                    incomplete(format!("chunk {index} is unreadable: {err}"))
                }
            })?;

            let mut chunk_size: u64 = 0;
            let mut reader = ReaderStream::new(file);
            while let Some(frame) = reader.next().await {
                let frame = frame
                    .map_err(|err| incomplete(format!("chunk {index} is unreadable: {err}")))?;
                chunk_size += frame.len() as u64;
                digest.consume(&frame);
                out.write_all(&frame).await?;
            }

            let expected = plan.expected_sizes[index as usize];
            if chunk_size != expected {
                return Err(incomplete(format!(
                    "chunk {index} holds {chunk_size} bytes, expected {expected}"
                )));
            }
            total += chunk_size;
        }

        out.flush().await?;
        out.sync_all().await?;
        Ok((total, format!("{:x}", digest.compute())))
    }
}
