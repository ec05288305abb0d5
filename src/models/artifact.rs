//! Represents a fully assembled artifact.

use super::session::TransferKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The file produced by concatenating every chunk of a completed session.
///
/// An `Artifact` only exists once its bytes have been renamed into place,
/// so readers never see a partially written file.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Artifact {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Upload session that produced this artifact.
    pub upload_id: String,

    /// Assigned final file name, unique within its kind.
    pub name: String,

    /// File name the client supplied.
    pub original_name: String,

    /// Transfer kind; also the artifact's directory.
    pub kind: TransferKind,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 of the assembled bytes.
    pub etag: String,

    /// Path of the artifact on the storage backend.
    pub location: String,

    /// When assembly finished.
    pub completed_at: DateTime<Utc>,
}
