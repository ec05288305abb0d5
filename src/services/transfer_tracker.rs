//! src/services/transfer_tracker.rs
//!
//! TransferTracker: per upload id, the set of chunk indices received and the
//! declared total.
//!
//! Sessions live in an arena keyed by upload id. The map itself is guarded by
//! a short `std::sync::Mutex`; each session carries its own
//! `tokio::sync::Mutex` so per-id updates are linearizable while different
//! ids never wait on each other.

use crate::{
    errors::{UploadError, UploadResult},
    models::{
        artifact::Artifact,
        chunk::ChunkRecord,
        session::{SessionState, TransferKind, UploadId, UploadSession},
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError},
    time::{Duration, Instant},
};
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::info;

/// Result of an assembly, published to every caller waiting on it.
#[derive(Clone, Debug)]
pub enum AssemblyOutcome {
    Assembled(Artifact),
    Failed { reason: String, retryable: bool },
}

/// What a chunk submission may do with a live session.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// Session is open; bytes may be written.
    Accept,
    /// Every index already arrived; the submission is a duplicate.
    AlreadyComplete,
}

/// Result of [`SessionEntry::mark_arrived`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arrival {
    pub complete: bool,
    pub received: usize,
    /// Bytes of the record this arrival replaced, if the index was resent.
    pub replaced_bytes: u64,
}

/// Mutable state of one session, only reachable through its lock.
#[derive(Debug)]
pub struct SessionEntry {
    pub session: UploadSession,
    arrived: BTreeMap<u32, ChunkRecord>,
    artifact: Option<Artifact>,
    failure: Option<String>,
}

impl SessionEntry {
    fn new(session: UploadSession) -> Self {
        Self {
            session,
            arrived: BTreeMap::new(),
            artifact: None,
            failure: None,
        }
    }

    /// Decide whether a submission declaring `total_chunks` may proceed.
    pub fn admit(&self, total_chunks: u32) -> UploadResult<Admission> {
        let id = self.session.id.as_str();
        match self.session.state {
            // Cleaned after assembly; the artifact is still answered.
            SessionState::Cleaned if self.artifact.is_some() => {
                return Ok(Admission::AlreadyComplete);
            }
            SessionState::Abandoned | SessionState::Cleaned => {
                return Err(UploadError::SessionClosed(id.to_string()));
            }
            SessionState::Failed => {
                return Err(UploadError::IncompleteTransfer {
                    upload_id: id.to_string(),
                    reason: self
                        .failure
                        .clone()
                        .unwrap_or_else(|| "previous assembly failed".into()),
                });
            }
            _ => {}
        }

        if total_chunks != self.session.total_chunks {
            return Err(UploadError::InconsistentTransfer {
                upload_id: id.to_string(),
                recorded: self.session.total_chunks,
                claimed: total_chunks,
            });
        }

        if self.session.state.accepts_chunks() {
            Ok(Admission::Accept)
        } else {
            Ok(Admission::AlreadyComplete)
        }
    }

    /// Record a persisted chunk. Indices form a set: a resent index replaces
    /// its previous record and never counts twice.
    pub fn mark_arrived(&mut self, record: ChunkRecord) -> Arrival {
        let replaced_bytes = self
            .arrived
            .insert(record.index, record)
            .map(|old| old.size_bytes)
            .unwrap_or(0);

        self.session.last_activity = Instant::now();
        let complete = self.is_complete();
        self.session.state = if complete {
            SessionState::Complete
        } else {
            SessionState::Receiving
        };

        Arrival {
            complete,
            received: self.arrived.len(),
            replaced_bytes,
        }
    }

    pub fn received(&self) -> usize {
        self.arrived.len()
    }

    pub fn is_complete(&self) -> bool {
        self.arrived.len() == self.session.total_chunks as usize
    }

    pub fn missing(&self) -> Vec<u32> {
        (0..self.session.total_chunks)
            .filter(|index| !self.arrived.contains_key(index))
            .collect()
    }

    pub fn staged_bytes(&self) -> u64 {
        self.arrived.values().map(|r| r.size_bytes).sum()
    }

    pub fn record(&self, index: u32) -> Option<&ChunkRecord> {
        self.arrived.get(&index)
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        self.artifact.as_ref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub(crate) fn set_artifact(&mut self, artifact: Artifact) {
        self.session.state = SessionState::Assembled;
        self.artifact = Some(artifact);
    }

    pub(crate) fn set_failed(&mut self, reason: String) {
        self.session.state = SessionState::Failed;
        self.failure = Some(reason);
    }

    /// Forget every chunk record, returning the bytes they occupied.
    pub(crate) fn drain_records(&mut self) -> u64 {
        let bytes = self.staged_bytes();
        self.arrived.clear();
        bytes
    }
}

/// Shared handle to one live session.
#[derive(Debug)]
pub struct SessionHandle {
    id: UploadId,
    entry: Mutex<SessionEntry>,
    outcome: watch::Sender<Option<AssemblyOutcome>>,
}

impl SessionHandle {
    fn new(session: UploadSession) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            id: session.id.clone(),
            entry: Mutex::new(SessionEntry::new(session)),
            outcome,
        }
    }

    pub fn id(&self) -> &UploadId {
        &self.id
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionEntry> {
        self.entry.lock().await
    }

    /// Observe the assembly outcome. Subscribe while holding the entry lock
    /// so a publish cannot slip in between the state check and the wait.
    pub fn subscribe(&self) -> watch::Receiver<Option<AssemblyOutcome>> {
        self.outcome.subscribe()
    }

    pub(crate) fn reset_outcome(&self) {
        self.outcome.send_replace(None);
    }

    pub(crate) fn publish(&self, outcome: AssemblyOutcome) {
        self.outcome.send_replace(Some(outcome));
    }
}

/// What remains of a session after its staging has been removed.
#[derive(Clone, Debug)]
pub struct Tombstone {
    pub session: UploadSession,
    pub artifact: Option<Artifact>,
    pub closed_at: Instant,
}

/// Result of looking an upload id up.
#[derive(Debug)]
pub enum Lookup {
    Live(Arc<SessionHandle>),
    Closed(Tombstone),
    Unknown,
}

/// Result of opening a session for a chunk submission.
#[derive(Debug)]
pub enum Opened {
    /// The id was already live.
    Live(Arc<SessionHandle>),
    /// This call created the session; nothing has been staged for it yet.
    Created(Arc<SessionHandle>),
    /// The id already produced an artifact and its staging is gone.
    Assembled(Artifact),
}

/// Serializable snapshot of a session for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub upload_id: UploadId,
    pub state: SessionState,
    pub file_name: String,
    pub kind: TransferKind,
    pub total_chunks: u32,
    pub received: usize,
    pub missing: Vec<u32>,
    pub staged_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub artifact: Option<Artifact>,
}

#[derive(Debug, Default)]
pub struct TransferTracker {
    sessions: StdMutex<HashMap<UploadId, Arc<SessionHandle>>>,
    tombstones: StdMutex<HashMap<UploadId, Tombstone>>,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> StdMutexGuard<'_, HashMap<UploadId, Arc<SessionHandle>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tombstones(&self) -> StdMutexGuard<'_, HashMap<UploadId, Tombstone>> {
        self.tombstones.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lookup(&self, upload_id: &UploadId) -> Lookup {
        let sessions = self.sessions();
        if let Some(handle) = sessions.get(upload_id) {
            return Lookup::Live(handle.clone());
        }
        match self.tombstones().get(upload_id) {
            Some(tombstone) => Lookup::Closed(tombstone.clone()),
            None => Lookup::Unknown,
        }
    }

    /// Find the live session for `upload_id` or create it.
    ///
    /// A closed id never reopens: an assembled one yields its artifact, an
    /// abandoned one fails with `SessionClosed`. `admit_new` is consulted only
    /// when a session would be created.
    pub fn open(
        &self,
        upload_id: &UploadId,
        total_chunks: u32,
        file_name: &str,
        kind: TransferKind,
        admit_new: impl FnOnce() -> UploadResult<()>,
    ) -> UploadResult<Opened> {
        let mut sessions = self.sessions();
        if let Some(handle) = sessions.get(upload_id) {
            return Ok(Opened::Live(handle.clone()));
        }
        if let Some(tombstone) = self.tombstones().get(upload_id) {
            return match &tombstone.artifact {
                Some(artifact) => Ok(Opened::Assembled(artifact.clone())),
                None => Err(UploadError::SessionClosed(upload_id.to_string())),
            };
        }

        admit_new()?;
        let session =
            UploadSession::new(upload_id.clone(), total_chunks, file_name.to_string(), kind);
        info!(
            upload_id = %upload_id,
            total_chunks,
            file_name,
            kind = %kind,
            "opened upload session"
        );
        let handle = Arc::new(SessionHandle::new(session));
        sessions.insert(upload_id.clone(), handle.clone());
        Ok(Opened::Created(handle))
    }

    /// Drop `handle` from the live map without leaving a tombstone, so the id
    /// can be opened again. A newer session under the same id is kept.
    pub fn forget(&self, handle: &Arc<SessionHandle>) -> bool {
        let mut sessions = self.sessions();
        match sessions.get(handle.id()) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                sessions.remove(handle.id());
                true
            }
            _ => false,
        }
    }

    /// Move a session from the live map to the tombstones.
    pub fn close(
        &self,
        upload_id: &UploadId,
        mut session: UploadSession,
        artifact: Option<Artifact>,
    ) {
        let mut sessions = self.sessions();
        sessions.remove(upload_id);
        session.state = SessionState::Cleaned;
        self.tombstones().insert(
            upload_id.clone(),
            Tombstone {
                session,
                artifact,
                closed_at: Instant::now(),
            },
        );
    }

    /// Every live session, for sweeping.
    pub fn live_sessions(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions().values().cloned().collect()
    }

    pub fn live_count(&self) -> usize {
        self.sessions().len()
    }

    /// Drop tombstones closed at least `retention` ago. Returns how many.
    pub fn purge_tombstones(&self, retention: Duration) -> usize {
        let mut tombstones = self.tombstones();
        let before = tombstones.len();
        tombstones.retain(|_, t| t.closed_at.elapsed() < retention);
        before - tombstones.len()
    }

    pub async fn status(&self, upload_id: &UploadId) -> UploadResult<SessionStatus> {
        match self.lookup(upload_id) {
            Lookup::Live(handle) => {
                let entry = handle.lock().await;
                Ok(SessionStatus {
                    upload_id: upload_id.clone(),
                    state: entry.session.state,
                    file_name: entry.session.file_name.clone(),
                    kind: entry.session.kind,
                    total_chunks: entry.session.total_chunks,
                    received: entry.received(),
                    missing: entry.missing(),
                    staged_bytes: entry.staged_bytes(),
                    created_at: entry.session.created_at,
                    artifact: entry.artifact().cloned(),
                })
            }
            Lookup::Closed(tombstone) => {
                let received = if tombstone.artifact.is_some() {
                    tombstone.session.total_chunks as usize
                } else {
                    0
                };
                Ok(SessionStatus {
                    upload_id: upload_id.clone(),
                    state: tombstone.session.state,
                    file_name: tombstone.session.file_name,
                    kind: tombstone.session.kind,
                    total_chunks: tombstone.session.total_chunks,
                    received,
                    missing: Vec::new(),
                    staged_bytes: 0,
                    created_at: tombstone.session.created_at,
                    artifact: tombstone.artifact,
                })
            }
            Lookup::Unknown => Err(UploadError::UnknownUpload(upload_id.to_string())),
        }
    }
}
