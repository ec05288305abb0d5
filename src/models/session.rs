//! Represents an upload session: every chunk that will become one artifact.

use crate::errors::UploadError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Instant};

const MAX_UPLOAD_ID_LEN: usize = 128;
const MAX_FILE_NAME_LEN: usize = 255;

/// Client-chosen opaque token naming one logical transfer.
///
/// Restricted to `[A-Za-z0-9._-]` so it can be used directly as a staging
/// directory name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UploadId(String);

impl UploadId {
    pub fn parse(raw: &str) -> Result<Self, UploadError> {
        if raw.is_empty() || raw.len() > MAX_UPLOAD_ID_LEN {
            return Err(UploadError::Validation(format!(
                "upload id must be between 1 and {MAX_UPLOAD_ID_LEN} characters"
            )));
        }
        if raw.starts_with('.') {
            return Err(UploadError::Validation(
                "upload id cannot start with a dot".into(),
            ));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(UploadError::Validation(
                "upload id may only contain letters, digits, dots, underscores and hyphens".into(),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the uploaded file is. Artifacts are grouped on disk by kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TransferKind {
    Video,
    Material,
    #[default]
    Document,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Material => "material",
            Self::Document => "document",
        }
    }
}

impl FromStr for TransferKind {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "video" => Ok(Self::Video),
            "material" => Ok(Self::Material),
            "document" => Ok(Self::Document),
            other => Err(UploadError::Validation(format!(
                "unknown transfer kind `{other}`"
            ))),
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an upload session.
///
/// `Created → Receiving → Complete → Assembling → Assembled → Cleaned` on the
/// happy path; `Receiving → Abandoned → Cleaned` on cancellation or expiry.
/// `Failed` is entered when assembly finds chunk data missing; staging is kept.
/// A transient assembly error returns the session to `Complete`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Receiving,
    Complete,
    Assembling,
    Assembled,
    Failed,
    Abandoned,
    Cleaned,
}

impl SessionState {
    /// Whether new chunk bytes may still be written for this session.
    pub fn accepts_chunks(&self) -> bool {
        matches!(self, Self::Created | Self::Receiving)
    }

    /// Whether the session may be abandoned, by the idle sweep or on request.
    /// Everything that holds staging and is not being (or has not been)
    /// assembled qualifies.
    pub fn is_sweepable(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Receiving | Self::Complete | Self::Failed
        )
    }
}

/// An in-flight transfer, keyed by its [`UploadId`].
#[derive(Clone, Debug)]
pub struct UploadSession {
    /// Client-chosen upload id.
    pub id: UploadId,

    /// Declared number of chunks. Immutable once set by the first chunk.
    pub total_chunks: u32,

    /// Sanitized file name the client asked for.
    pub file_name: String,

    /// What kind of file is being transferred.
    pub kind: TransferKind,

    /// When the first chunk arrived.
    pub created_at: DateTime<Utc>,

    /// Monotonic time of the last chunk arrival, used for TTL decisions.
    pub last_activity: Instant,

    /// Current lifecycle state.
    pub state: SessionState,
}

impl UploadSession {
    pub fn new(id: UploadId, total_chunks: u32, file_name: String, kind: TransferKind) -> Self {
        Self {
            id,
            total_chunks,
            file_name,
            kind,
            created_at: Utc::now(),
            last_activity: Instant::now(),
            state: SessionState::Created,
        }
    }
}

/// Reduce a client-supplied file name to a safe single path segment.
pub fn sanitize_file_name(raw: &str) -> Result<String, UploadError> {
    let name = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    if name.is_empty() || name == "." || name == ".." {
        return Err(UploadError::Validation("file name is required".into()));
    }
    if name.len() > MAX_FILE_NAME_LEN {
        return Err(UploadError::Validation(format!(
            "file name exceeds {MAX_FILE_NAME_LEN} bytes"
        )));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(UploadError::Validation(
            "file name contains control characters".into(),
        ));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_id_accepts_token_characters() {
        let id = UploadId::parse("lecture-01_part.a").unwrap();
        assert_eq!(id.as_str(), "lecture-01_part.a");
    }

    #[test]
    fn upload_id_rejects_traversal_and_separators() {
        for bad in ["", ".hidden", "a/b", "..", "a b", "semi;colon"] {
            assert!(
                matches!(UploadId::parse(bad), Err(UploadError::Validation(_))),
                "{bad:?} should be rejected"
            );
        }
        let long = "x".repeat(MAX_UPLOAD_ID_LEN + 1);
        assert!(UploadId::parse(&long).is_err());
    }

    #[test]
    fn file_name_keeps_last_segment() {
        assert_eq!(sanitize_file_name("dir/sub/video.mp4").unwrap(), "video.mp4");
        assert_eq!(sanitize_file_name("C:\\tmp\\notes.pdf").unwrap(), "notes.pdf");
        assert!(sanitize_file_name("dir/..").is_err());
        assert!(sanitize_file_name("   ").is_err());
        assert!(sanitize_file_name("bad\u{7}.txt").is_err());
    }

    #[test]
    fn transfer_kind_parses_case_insensitively() {
        assert_eq!("Video".parse::<TransferKind>().unwrap(), TransferKind::Video);
        assert_eq!("MATERIAL".parse::<TransferKind>().unwrap(), TransferKind::Material);
        assert!("audio".parse::<TransferKind>().is_err());
    }

    #[test]
    fn only_open_states_accept_chunks() {
        assert!(SessionState::Created.accepts_chunks());
        assert!(SessionState::Receiving.accepts_chunks());
        assert!(!SessionState::Complete.accepts_chunks());
        assert!(!SessionState::Abandoned.accepts_chunks());
    }

    #[test]
    fn complete_sessions_can_be_swept() {
        assert!(SessionState::Complete.is_sweepable());
        assert!(SessionState::Failed.is_sweepable());
        assert!(!SessionState::Assembling.is_sweepable());
        assert!(!SessionState::Assembled.is_sweepable());
        assert!(!SessionState::Cleaned.is_sweepable());
    }
}
