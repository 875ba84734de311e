//! Storage backends for the session store.
//!
//! `FileBackend` keeps one directory per session:
//!
//! ```text
//! <root>/<session-id>/log.jsonl    append-only, one StoreRecord per line
//! <root>/<session-id>/header.json  latest SessionHeader (temp file + rename)
//! ```
//!
//! `MemoryBackend` holds the same data in a map and is used by tests and
//! embedders that do not need durability.

use async_trait::async_trait;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

use super::record::{SessionHeader, StoreRecord};
use crate::errors::StoreError;

const LOG_FILE: &str = "log.jsonl";
const HEADER_FILE: &str = "header.json";

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Durably append one record to the session's log.
    async fn append(&self, record: &StoreRecord) -> Result<(), StoreError>;

    async fn write_header(&self, header: &SessionHeader) -> Result<(), StoreError>;

    async fn read_header(&self, session_id: &str) -> Result<Option<SessionHeader>, StoreError>;

    /// All records of a session in append order. Empty if the session is unknown.
    async fn read_records(&self, session_id: &str) -> Result<Vec<StoreRecord>, StoreError>;

    async fn list_sessions(&self) -> Result<Vec<String>, StoreError>;
}

/// JSON-lines files under a root directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    /// Run blocking file I/O off the async worker threads.
    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Path) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || f(&root))
            .await
            .map_err(|e| StoreError::io(&self.root, std::io::Error::other(e)))?
    }
}

fn append_line(dir: &Path, line: &[u8]) -> Result<(), StoreError> {
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    let path = dir.join(LOG_FILE);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| StoreError::io(&path, e))?;
    file.lock_exclusive().map_err(|e| StoreError::io(&path, e))?;
    let written = drop_torn_tail(&mut file)
        .and_then(|_| file.seek(SeekFrom::End(0)))
        .and_then(|_| file.write_all(line))
        .and_then(|_| file.sync_data())
        .map_err(|e| StoreError::io(&path, e));
    let unlocked = FileExt::unlock(&file).map_err(|e| StoreError::io(&path, e));
    written.and(unlocked)
}

/// Cut a partial last line left by an interrupted append, so the next record
/// starts on its own line. Caller holds the lock.
fn drop_torn_tail(file: &mut fs::File) -> std::io::Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }
    let mut content = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut content)?;
    let keep = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos as u64 + 1);
    warn!(
        dropped = len - keep,
        "truncating torn trailing record before append"
    );
    file.set_len(keep)
}

fn read_log(session_id: &str, dir: &Path) -> Result<Vec<StoreRecord>, StoreError> {
    let path = dir.join(LOG_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(&path).map_err(|e| StoreError::io(&path, e))?;
    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<Result<_, _>>()
        .map_err(|e| StoreError::io(&path, e))?;

    let mut records = Vec::with_capacity(lines.len());
    let last = lines.len().saturating_sub(1);
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StoreRecord>(line) {
            Ok(record) => records.push(record),
            // A torn final line means the process died mid-append; the record never committed.
            Err(e) if i == last => {
                warn!(session = %session_id, error = %e, "discarding torn trailing record");
            }
            Err(e) => {
                return Err(StoreError::Corrupt {
                    id: session_id.to_string(),
                    seq: records.len() as u64 + 1,
                    message: e.to_string(),
                });
            }
        }
    }
    Ok(records)
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn append(&self, record: &StoreRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let session_id = record.session_id.clone();
        self.blocking(move |root| append_line(&root.join(&session_id), &line))
            .await
    }

    async fn write_header(&self, header: &SessionHeader) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(header)?;
        let session_id = header.id.clone();
        self.blocking(move |root| {
            let dir = root.join(&session_id);
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
            let tmp = dir.join(format!("{}.tmp", HEADER_FILE));
            let path = dir.join(HEADER_FILE);
            fs::write(&tmp, &content).map_err(|e| StoreError::io(&tmp, e))?;
            fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))
        })
        .await
    }

    async fn read_header(&self, session_id: &str) -> Result<Option<SessionHeader>, StoreError> {
        let path = self.session_dir(session_id).join(HEADER_FILE);
        self.blocking(move |_| {
            if !path.exists() {
                return Ok(None);
            }
            let content = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
            Ok(Some(serde_json::from_slice(&content)?))
        })
        .await
    }

    async fn read_records(&self, session_id: &str) -> Result<Vec<StoreRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.blocking(move |root| read_log(&session_id, &root.join(&session_id)))
            .await
    }

    async fn list_sessions(&self) -> Result<Vec<String>, StoreError> {
        self.blocking(|root| {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut ids = Vec::new();
            for entry in fs::read_dir(root).map_err(|e| StoreError::io(root, e))? {
                let entry = entry.map_err(|e| StoreError::io(root, e))?;
                if entry.path().join(HEADER_FILE).exists()
                    && let Some(name) = entry.file_name().to_str()
                {
                    ids.push(name.to_string());
                }
            }
            ids.sort();
            Ok(ids)
        })
        .await
    }
}

#[derive(Debug, Default)]
struct MemorySession {
    header: Option<SessionHeader>,
    records: Vec<StoreRecord>,
}

/// In-process backend. Clones share the same data, so a "restarted" store
/// built from a clone sees everything written before.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    sessions: Arc<Mutex<HashMap<String, MemorySession>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, MemorySession>) -> R,
    ) -> Result<R, StoreError> {
        let mut guard = self.sessions.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(f(&mut guard))
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn append(&self, record: &StoreRecord) -> Result<(), StoreError> {
        self.with(|sessions| {
            sessions
                .entry(record.session_id.clone())
                .or_default()
                .records
                .push(record.clone());
        })
    }

    async fn write_header(&self, header: &SessionHeader) -> Result<(), StoreError> {
        self.with(|sessions| {
            sessions.entry(header.id.clone()).or_default().header = Some(header.clone());
        })
    }

    async fn read_header(&self, session_id: &str) -> Result<Option<SessionHeader>, StoreError> {
        self.with(|sessions| sessions.get(session_id).and_then(|s| s.header.clone()))
    }

    async fn read_records(&self, session_id: &str) -> Result<Vec<StoreRecord>, StoreError> {
        self.with(|sessions| {
            sessions
                .get(session_id)
                .map(|s| s.records.clone())
                .unwrap_or_default()
        })
    }

    async fn list_sessions(&self) -> Result<Vec<String>, StoreError> {
        self.with(|sessions| {
            let mut ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.header.is_some())
                .map(|(id, _)| id.clone())
                .collect();
            ids.sort();
            ids
        })
    }
}
