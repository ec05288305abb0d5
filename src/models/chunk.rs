//! Represents one staged chunk of an upload session.

use super::session::UploadId;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// A chunk whose bytes are durable in the staging area.
#[derive(Clone, Debug)]
pub struct ChunkRecord {
    /// Owning upload session.
    pub upload_id: UploadId,

    /// Zero-based position of this chunk in the artifact.
    pub index: u32,

    /// Size in bytes.
    pub size_bytes: u64,

    /// Path of the staged chunk file.
    pub location: PathBuf,

    /// When these bytes were persisted.
    pub arrived_at: DateTime<Utc>,
}
