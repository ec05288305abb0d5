//! src/services/artifact_registry.rs
//!
//! Where finished artifacts are handed off. The course/chapter association
//! lives elsewhere; this crate only records that an artifact exists and
//! where its bytes are.

use crate::{
    errors::UploadResult,
    models::{artifact::Artifact, session::TransferKind},
};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;

#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    /// Record a newly assembled artifact.
    async fn register(&self, artifact: &Artifact) -> UploadResult<()>;

    /// Look up an artifact by kind and assigned name.
    async fn find(&self, kind: TransferKind, name: &str) -> UploadResult<Option<Artifact>>;

    /// Cheap connectivity probe for readiness checks.
    async fn ping(&self) -> UploadResult<()>;
}

/// `ArtifactRegistry` backed by the `artifacts` table in SQLite.
#[derive(Clone, Debug)]
pub struct SqliteArtifactRegistry {
    db: Arc<SqlitePool>,
}

impl SqliteArtifactRegistry {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ArtifactRegistry for SqliteArtifactRegistry {
    async fn register(&self, artifact: &Artifact) -> UploadResult<()> {
        sqlx::query(
            r#"
            INSERT INTO artifacts (
                id, upload_id, name, original_name, kind, size_bytes,
                etag, location, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(kind, name) DO UPDATE SET
                upload_id = excluded.upload_id,
                original_name = excluded.original_name,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                location = excluded.location,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(artifact.id)
        .bind(&artifact.upload_id)
        .bind(&artifact.name)
        .bind(&artifact.original_name)
        .bind(artifact.kind)
        .bind(artifact.size_bytes)
        .bind(&artifact.etag)
        .bind(&artifact.location)
        .bind(artifact.completed_at)
        .execute(&*self.db)
        .await?;

        tracing::debug!(artifact = %artifact.name, kind = %artifact.kind, "registered artifact");
        Ok(())
    }

    async fn find(&self, kind: TransferKind, name: &str) -> UploadResult<Option<Artifact>> {
        let artifact = sqlx::query_as::<_, Artifact>(
            "SELECT id, upload_id, name, original_name, kind, size_bytes, etag,
                    location, completed_at
             FROM artifacts WHERE kind = ? AND name = ?",
        )
        .bind(kind)
        .bind(name)
        .fetch_optional(&*self.db)
        .await?;
        Ok(artifact)
    }

    async fn ping(&self) -> UploadResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}
