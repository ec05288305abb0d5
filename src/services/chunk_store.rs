//! src/services/chunk_store.rs
//!
//! ChunkStore: durable staging of individual chunk payloads, addressed by
//! `(upload id, index)` beneath `staging_root/{shard}/{upload_id}/{index}.chunk`.
//!
//! A write never touches the final chunk path directly: bytes stream into a
//! hidden temp file next to it and only a [`PendingChunk::persist`] renames
//! them into place. Retries therefore overwrite whole chunks or nothing.

use crate::{
    errors::{UploadError, UploadResult},
    models::{chunk::ChunkRecord, session::UploadId},
    services::staging_budget::StagingBudget,
};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct ChunkStore {
    staging_root: PathBuf,
    budget: Arc<StagingBudget>,
    max_chunk_bytes: u64,
}

impl ChunkStore {
    pub fn new(
        staging_root: impl Into<PathBuf>,
        budget: Arc<StagingBudget>,
        max_chunk_bytes: u64,
    ) -> Self {
        Self {
            staging_root: staging_root.into(),
            budget,
            max_chunk_bytes,
        }
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Reject an index outside `0..total_chunks`.
    pub fn validate_index(index: u32, total_chunks: u32) -> UploadResult<()> {
        if total_chunks == 0 {
            return Err(UploadError::Validation(
                "total chunk count must be at least 1".into(),
            ));
        }
        if index >= total_chunks {
            return Err(UploadError::Validation(format!(
                "chunk index {index} is out of range for {total_chunks} chunks"
            )));
        }
        Ok(())
    }

    /// First byte of MD5(upload id) as hex; spreads sessions over 256 dirs.
    fn shard(upload_id: &UploadId) -> String {
        let digest = md5::compute(upload_id.as_str());
        format!("{:02x}", digest[0])
    }

    /// Directory holding every chunk of one session.
    pub fn session_dir(&self, upload_id: &UploadId) -> PathBuf {
        let mut path = self.staging_root.clone();
        path.push(Self::shard(upload_id));
        path.push(upload_id.as_str());
        path
    }

    pub fn chunk_path(&self, upload_id: &UploadId, index: u32) -> PathBuf {
        self.session_dir(upload_id).join(format!("{index}.chunk"))
    }

    /// Stream a chunk payload into staging.
    ///
    /// - Validates the index against `total_chunks`.
    /// - Reserves staging budget per frame before writing it.
    /// - Flushes and fsyncs the temp file.
    ///
    /// The returned [`PendingChunk`] must be persisted or discarded; dropping
    /// it removes the temp file and returns the reserved bytes.
    pub async fn put<S>(
        &self,
        upload_id: &UploadId,
        index: u32,
        total_chunks: u32,
        stream: S,
    ) -> UploadResult<PendingChunk>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        Self::validate_index(index, total_chunks)?;

        let dir = self.session_dir(upload_id);
        fs::create_dir_all(&dir).await?;
        let tmp_path = dir.join(format!(".{index}.{}.part", Uuid::new_v4()));
        let final_path = self.chunk_path(upload_id, index);
        let mut file = File::create(&tmp_path).await?;

        // From here on the guard owns cleanup of the temp file and reservation.
        let mut pending = PendingChunk {
            upload_id: upload_id.clone(),
            index,
            tmp_path,
            final_path,
            size_bytes: 0,
            budget: self.budget.clone(),
            settled: false,
        };

        pin_mut!(stream);
        while let Some(frame) = stream.next().await {
            let frame = frame?;
            let len = frame.len() as u64;
            if pending.size_bytes + len > self.max_chunk_bytes {
                return Err(UploadError::Validation(format!(
                    "chunk exceeds the {} byte limit",
                    self.max_chunk_bytes
                )));
            }
            self.budget.try_reserve(len)?;
            pending.size_bytes += len;
            file.write_all(&frame).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        debug!(
            upload_id = %upload_id,
            index,
            size = pending.size_bytes,
            "staged chunk payload"
        );
        Ok(pending)
    }

    /// Open a persisted chunk for reading.
    pub async fn open(&self, upload_id: &UploadId, index: u32) -> io::Result<File> {
        File::open(self.chunk_path(upload_id, index)).await
    }

    /// Remove every staged byte of a session, including stray temp files.
    ///
    /// Missing directories are not an error. Shard directories are left in
    /// place; another session may be creating its directory inside one.
    pub async fn remove_session(&self, upload_id: &UploadId) -> UploadResult<()> {
        let dir = self.session_dir(upload_id);
        match fs::remove_dir_all(&dir).await {
            Ok(_) => debug!("removed staging directory {}", dir.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(UploadError::Storage(err)),
        }

        Ok(())
    }
}

/// Chunk bytes fully written to a temp file but not yet visible.
#[derive(Debug)]
pub struct PendingChunk {
    upload_id: UploadId,
    index: u32,
    tmp_path: PathBuf,
    final_path: PathBuf,
    size_bytes: u64,
    budget: Arc<StagingBudget>,
    settled: bool,
}

impl PendingChunk {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Atomically rename the temp file onto the chunk's final path,
    /// replacing any previous bytes for this index.
    ///
    /// The reserved bytes stay reserved; they now belong to the session.
    pub async fn persist(mut self) -> UploadResult<ChunkRecord> {
        fs::rename(&self.tmp_path, &self.final_path).await?;
        self.settled = true;
        Ok(ChunkRecord {
            upload_id: self.upload_id.clone(),
            index: self.index,
            size_bytes: self.size_bytes,
            location: self.final_path.clone(),
            arrived_at: Utc::now(),
        })
    }

    /// Drop the staged bytes without making them visible.
    ///
    /// The session directory is removed too if nothing else is in it; `put`
    /// may have recreated it after the session was cleaned up.
    pub async fn discard(mut self) {
        if let Err(err) = fs::remove_file(&self.tmp_path).await {
            if err.kind() != ErrorKind::NotFound {
                debug!("failed to remove {}: {}", self.tmp_path.display(), err);
            }
        }
        self.budget.release(self.size_bytes);
        self.settled = true;

        // Fails harmlessly while other chunks live in the directory.
        if let Some(dir) = self.final_path.parent() {
            let _ = fs::remove_dir(dir).await;
        }
    }
}

impl Drop for PendingChunk {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let _ = std::fs::remove_file(&self.tmp_path);
        self.budget.release(self.size_bytes);
    }
}
