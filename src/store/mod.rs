//! Durable session store.
//!
//! Every state change of a session is one immutable, sequence-numbered record
//! appended to the session's log; a small header mirrors the latest phase,
//! round and error for cheap inspection. The log is authoritative: `restore`
//! rebuilds the session by replaying it, and repairs the header when the two
//! disagree (a crash between the append and the header write).

mod backend;
mod record;

pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use record::{RecordDraft, RecordKind, SessionHeader, StoreRecord};

use chrono::Utc;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::errors::StoreError;
use crate::model::{Session, TaskResult};
use crate::pipeline::{Phase, PipelineEvent};

/// Default bound on sessions writing at the same time.
pub const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 8;

type HeaderSlot = Arc<Mutex<Option<SessionHeader>>>;

pub struct SessionStore {
    backend: Arc<dyn StorageBackend>,
    /// Per-session write lock; the slot caches the current header.
    locks: DashMap<String, HeaderSlot>,
    permits: Arc<Semaphore>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn StorageBackend>, max_concurrent_sessions: usize) -> Self {
        Self {
            backend,
            locks: DashMap::new(),
            permits: Arc::new(Semaphore::new(max_concurrent_sessions.max(1))),
        }
    }

    /// File-backed store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, max_concurrent_sessions: usize) -> Self {
        Self::new(Arc::new(FileBackend::new(dir)), max_concurrent_sessions)
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryBackend::new()),
            DEFAULT_MAX_CONCURRENT_SESSIONS,
        )
    }

    fn slot(&self, session_id: &str) -> HeaderSlot {
        self.locks
            .entry(session_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    async fn commit(
        &self,
        header: &mut SessionHeader,
        draft: RecordDraft,
    ) -> Result<u64, StoreError> {
        let record = StoreRecord {
            seq: header.record_count + 1,
            session_id: header.id.clone(),
            kind: draft.kind,
            phase: draft.phase,
            round: draft.round,
            task_id: draft.task_id,
            payload: draft.payload,
            timestamp: Utc::now(),
        };
        self.backend.append(&record).await?;
        let mut next = header.clone();
        next.advance(&record, draft.error);
        self.backend.write_header(&next).await?;
        *header = next;
        debug!(
            session = %record.session_id,
            seq = record.seq,
            kind = record.kind.as_str(),
            phase = %record.phase,
            "record committed"
        );
        Ok(record.seq)
    }

    /// Persist a brand-new session. Fails with `SessionExists` if the id is taken.
    pub async fn create(&self, session: &Session) -> Result<(), StoreError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| StoreError::LockPoisoned)?;
        let slot = self.slot(&session.id);
        let mut cached = slot.lock().await;
        if cached.is_some() || self.backend.read_header(&session.id).await?.is_some() {
            return Err(StoreError::SessionExists {
                id: session.id.clone(),
            });
        }
        let mut header = SessionHeader::new(session);
        self.commit(&mut header, RecordDraft::session_created(session)?)
            .await?;
        *cached = Some(header);
        Ok(())
    }

    /// Append one record and update the header. Returns the record's sequence number.
    pub async fn save(&self, session_id: &str, draft: RecordDraft) -> Result<u64, StoreError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| StoreError::LockPoisoned)?;
        let slot = self.slot(session_id);
        let mut cached = slot.lock().await;
        if cached.is_none() {
            *cached = self.backend.read_header(session_id).await?;
        }
        let header = cached.as_mut().ok_or_else(|| StoreError::SessionNotFound {
            id: session_id.to_string(),
        })?;
        self.commit(header, draft).await
    }

    pub async fn header(&self, session_id: &str) -> Result<SessionHeader, StoreError> {
        if let Some(header) = self.slot(session_id).lock().await.clone() {
            return Ok(header);
        }
        self.backend
            .read_header(session_id)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound {
                id: session_id.to_string(),
            })
    }

    pub async fn records(&self, session_id: &str) -> Result<Vec<StoreRecord>, StoreError> {
        let records = self.backend.read_records(session_id).await?;
        if records.is_empty() {
            return Err(StoreError::SessionNotFound {
                id: session_id.to_string(),
            });
        }
        Ok(records)
    }

    /// Records written while the session was in `phase` during `round`.
    pub async fn records_in(
        &self,
        session_id: &str,
        phase: Phase,
        round: u32,
    ) -> Result<Vec<StoreRecord>, StoreError> {
        Ok(self
            .records(session_id)
            .await?
            .into_iter()
            .filter(|r| r.phase == phase && r.round == round)
            .collect())
    }

    pub async fn records_for_task(
        &self,
        session_id: &str,
        task_id: &str,
    ) -> Result<Vec<StoreRecord>, StoreError> {
        Ok(self
            .records(session_id)
            .await?
            .into_iter()
            .filter(|r| r.task_id.as_deref() == Some(task_id))
            .collect())
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionHeader>, StoreError> {
        let mut headers = Vec::new();
        for id in self.backend.list_sessions().await? {
            if let Some(header) = self.backend.read_header(&id).await? {
                headers.push(header);
            }
        }
        headers.sort_by_key(|h| h.created_at);
        Ok(headers)
    }

    /// Rebuild a session by replaying its log.
    pub async fn restore(&self, session_id: &str) -> Result<Session, StoreError> {
        let slot = self.slot(session_id);
        let mut cached = slot.lock().await;
        let records = self.records(session_id).await?;
        let session = replay(session_id, &records)?;

        let rebuilt = rebuilt_header(&session, &records);
        let stored = match cached.clone() {
            Some(header) => Some(header),
            None => self.backend.read_header(session_id).await?,
        };
        if stored.as_ref() != Some(&rebuilt) {
            warn!(
                session = %session_id,
                records = records.len(),
                "header out of date with log, rewriting"
            );
            self.backend.write_header(&rebuilt).await?;
        }
        *cached = Some(rebuilt);
        Ok(session)
    }
}

fn corrupt(record: &StoreRecord, message: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        id: record.session_id.clone(),
        seq: record.seq,
        message: message.into(),
    }
}

fn replay(session_id: &str, records: &[StoreRecord]) -> Result<Session, StoreError> {
    let mut records = records.iter();
    let first = records.next().ok_or_else(|| StoreError::SessionNotFound {
        id: session_id.to_string(),
    })?;
    if first.kind != RecordKind::SessionCreated || first.seq != 1 {
        return Err(corrupt(first, "log does not start with session_created"));
    }
    let mut session: Session = serde_json::from_value(first.payload.clone())?;
    let mut last_seq = first.seq;

    for record in records {
        if record.seq != last_seq + 1 {
            return Err(corrupt(
                record,
                format!("expected seq {}, found {}", last_seq + 1, record.seq),
            ));
        }
        last_seq = record.seq;
        match record.kind {
            RecordKind::SessionCreated => {
                return Err(corrupt(record, "duplicate session_created"));
            }
            RecordKind::Transition => {
                let event: PipelineEvent = serde_json::from_value(record.payload.clone())?;
                let to = event
                    .target(session.phase)
                    .map_err(|e| corrupt(record, e.to_string()))?;
                if to != record.phase {
                    return Err(corrupt(
                        record,
                        format!("record says {}, table says {}", record.phase, to),
                    ));
                }
                session.apply(&event, to, record.timestamp);
            }
            RecordKind::TaskResult => {
                let result: TaskResult = serde_json::from_value(record.payload.clone())?;
                session.record_result(result);
            }
        }
    }
    Ok(session)
}

fn rebuilt_header(session: &Session, records: &[StoreRecord]) -> SessionHeader {
    let mut header = SessionHeader::new(session);
    header.error = session.error.clone();
    if let Some(last) = records.last() {
        header.record_count = last.seq;
        header.updated_at = last.timestamp;
    }
    header
}
