#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chunk_ingest::{
    db,
    errors::{UploadError, UploadResult},
    models::{artifact::Artifact, session::TransferKind},
    services::{
        artifact_registry::{ArtifactRegistry, SqliteArtifactRegistry},
        upload_service::{ChunkAck, ChunkSubmission, UploadLimits, UploadService},
    },
};
use futures::{Stream, stream};
use std::{
    io,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;

/// Registry that keeps every registration in memory.
#[derive(Default)]
pub struct RecordingRegistry {
    registered: Mutex<Vec<Artifact>>,
    failures_left: AtomicUsize,
}

impl RecordingRegistry {
    pub fn registered(&self) -> Vec<Artifact> {
        self.registered.lock().unwrap().clone()
    }

    /// Make the next `count` registrations fail as if the database were down.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ArtifactRegistry for RecordingRegistry {
    async fn register(&self, artifact: &Artifact) -> UploadResult<()> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(UploadError::Registry(sqlx::Error::PoolTimedOut));
        }
        self.registered.lock().unwrap().push(artifact.clone());
        Ok(())
    }

    async fn find(&self, kind: TransferKind, name: &str) -> UploadResult<Option<Artifact>> {
        Ok(self
            .registered
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.kind == kind && a.name == name)
            .cloned())
    }

    async fn ping(&self) -> UploadResult<()> {
        Ok(())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub service: UploadService,
    pub registry: Arc<RecordingRegistry>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_limits(test_limits()).await
    }

    pub async fn with_limits(limits: UploadLimits) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(RecordingRegistry::default());
        let service = UploadService::new(dir.path().join("uploads"), registry.clone(), limits)
            .await
            .unwrap();
        Self {
            dir,
            service,
            registry,
        }
    }

    /// Submit `payload` as chunk `index` of a `total`-chunk document upload.
    pub async fn send(
        &self,
        upload_id: &str,
        index: u32,
        total: u32,
        payload: &'static str,
    ) -> UploadResult<ChunkAck> {
        send(&self.service, upload_id, index, total, payload).await
    }

    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.dir
            .path()
            .join("uploads/artifacts/document")
            .join(name)
    }

    pub fn artifact_bytes(&self, ack: &ChunkAck) -> Vec<u8> {
        let artifact = ack.artifact.as_ref().expect("ack should carry the artifact");
        std::fs::read(self.artifact_path(&artifact.name)).unwrap()
    }

    /// Every file in the document artifact directory.
    pub fn artifact_files(&self) -> Vec<String> {
        let dir = self.dir.path().join("uploads/artifacts/document");
        match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

pub fn test_limits() -> UploadLimits {
    UploadLimits {
        max_staged_bytes: 1 << 20,
        max_chunk_bytes: 1 << 16,
        max_total_chunks: 1000,
        session_ttl: Duration::from_secs(3600),
    }
}

pub fn body(payload: &'static str) -> impl Stream<Item = io::Result<Bytes>> + Send {
    stream::iter([Ok(Bytes::from_static(payload.as_bytes()))])
}

pub async fn send(
    service: &UploadService,
    upload_id: &str,
    index: u32,
    total: u32,
    payload: &'static str,
) -> UploadResult<ChunkAck> {
    service
        .submit_chunk(
            ChunkSubmission {
                upload_id: upload_id.to_string(),
                index,
                total_chunks: total,
                file_name: "notes.txt".to_string(),
                kind: TransferKind::Document,
            },
            body(payload),
        )
        .await
}

/// Service backed by a migrated SQLite registry in `dir`.
pub async fn sqlite_service(dir: &TempDir) -> UploadService {
    let url = format!("sqlite://{}", dir.path().join("meta/chunk_ingest.db").display());
    let pool = db::connect(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let registry = Arc::new(SqliteArtifactRegistry::new(Arc::new(pool)));
    UploadService::new(dir.path().join("uploads"), registry, test_limits())
        .await
        .unwrap()
}
