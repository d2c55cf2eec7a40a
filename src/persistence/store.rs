//! Document store backends.
//!
//! Two collections are kept: one record per access entry (keyed by identity,
//! overwritten on change) and an append-only threat event log. Records only
//! ever gain fields, so older files keep deserializing.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use url::Url;

use crate::security::access_registry::AccessEntry;
use crate::security::threat::ThreatEvent;

const ACCESS_FILE: &str = "access_entries.json";
const THREAT_FILE: &str = "threat_events.jsonl";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("unsupported store connection `{0}`")]
    UnsupportedConnection(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Everything needed to rebuild in-memory state after a restart.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub access_entries: Vec<AccessEntry>,
    /// The most recent events, oldest first.
    pub threat_events: Vec<ThreatEvent>,
    /// Every readable event in the log, including those not returned.
    pub threat_event_total: u64,
}

/// A durable backend for registry state and threat events.
///
/// Implementations are called from the persistence worker thread and from
/// the synchronous fallback path, so they must be internally synchronized.
pub trait DocumentStore: Send + Sync {
    fn upsert_access(&self, entry: &AccessEntry) -> Result<(), StoreError>;

    fn append_threat(&self, event: &ThreatEvent) -> Result<(), StoreError>;

    /// Read every access entry and the newest `max_events` threat events.
    fn load_snapshot(&self, max_events: usize) -> Result<StoreSnapshot, StoreError>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// Open a store from a connection string.
///
/// `file:///var/lib/protector`, `file://./relative`, a bare path, or
/// `memory:` are understood.
pub fn open_store(connection: &str) -> Result<Arc<dyn DocumentStore>, StoreError> {
    let connection = connection.trim();
    if connection == "memory:" || connection == "memory://" {
        return Ok(Arc::new(MemoryStore::new()));
    }

    match Url::parse(connection) {
        Ok(url) if url.scheme() == "file" => {
            let path = match url.host_str() {
                // file://./data style relative locations
                Some(host) if !host.is_empty() => PathBuf::from(format!("{}{}", host, url.path())),
                _ => url
                    .to_file_path()
                    .map_err(|_| StoreError::UnsupportedConnection(connection.to_string()))?,
            };
            Ok(Arc::new(FileStore::open(path)?))
        }
        Ok(_) => Err(StoreError::UnsupportedConnection(connection.to_string())),
        Err(url::ParseError::RelativeUrlWithoutBase) => Ok(Arc::new(FileStore::open(connection)?)),
        Err(_) => Err(StoreError::UnsupportedConnection(connection.to_string())),
    }
}

/// JSON files in a directory.
///
/// Access entries are rewritten atomically (temp file + rename) on every
/// upsert; threat events are appended as JSON lines.
pub struct FileStore {
    dir: PathBuf,
    entries: Mutex<BTreeMap<String, AccessEntry>>,
    threat_log: Mutex<()>,
}

impl FileStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let entries = read_access_file(&dir.join(ACCESS_FILE))?;
        Ok(Self {
            dir,
            entries: Mutex::new(entries),
            threat_log: Mutex::new(()),
        })
    }

    fn write_entries(&self, entries: &BTreeMap<String, AccessEntry>) -> Result<(), StoreError> {
        let target = self.dir.join(ACCESS_FILE);
        let tmp = self.dir.join(format!("{ACCESS_FILE}.tmp"));
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut writer, entries)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &target)?;
        Ok(())
    }
}

/// A queued write can land after a newer synchronous one; never regress.
fn is_stale(current: Option<&AccessEntry>, incoming: &AccessEntry) -> bool {
    current.is_some_and(|current| current.updated_at > incoming.updated_at)
}

fn read_access_file(path: &Path) -> Result<BTreeMap<String, AccessEntry>, StoreError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

impl DocumentStore for FileStore {
    fn upsert_access(&self, entry: &AccessEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if is_stale(entries.get(entry.identity.as_str()), entry) {
            return Ok(());
        }
        let previous = entries.insert(entry.identity.to_string(), entry.clone());
        if let Err(e) = self.write_entries(&entries) {
            // keep the cache in line with what is on disk
            match previous {
                Some(prev) => entries.insert(entry.identity.to_string(), prev),
                None => entries.remove(entry.identity.as_str()),
            };
            return Err(e);
        }
        Ok(())
    }

    fn append_threat(&self, event: &ThreatEvent) -> Result<(), StoreError> {
        let _guard = self.threat_log.lock().unwrap_or_else(PoisonError::into_inner);
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(THREAT_FILE))?;
        file.write_all(&line)?;
        Ok(())
    }

    fn load_snapshot(&self, max_events: usize) -> Result<StoreSnapshot, StoreError> {
        let access_entries = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            *entries = read_access_file(&self.dir.join(ACCESS_FILE))?;
            entries.values().cloned().collect()
        };

        let mut tail = VecDeque::with_capacity(max_events.min(1024));
        let mut total = 0u64;
        let path = self.dir.join(THREAT_FILE);
        if path.exists() {
            for (line_num, line) in BufReader::new(File::open(&path)?).lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ThreatEvent>(&line) {
                    Ok(event) => {
                        total += 1;
                        if max_events == 0 {
                            continue;
                        }
                        if tail.len() == max_events {
                            tail.pop_front();
                        }
                        tail.push_back(event);
                    }
                    Err(e) => tracing::warn!(
                        path = %path.display(),
                        line = line_num + 1,
                        error = %e,
                        "Skipping unreadable threat event"
                    ),
                }
            }
        }

        Ok(StoreSnapshot {
            access_entries,
            threat_events: tail.into(),
            threat_event_total: total,
        })
    }

    fn describe(&self) -> String {
        format!("file://{}", self.dir.display())
    }
}

/// Process-local store. Survives nothing; useful for tests and `memory:`.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, AccessEntry>>,
    threats: Mutex<Vec<ThreatEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, identity: &str) -> Option<AccessEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }

    pub fn threat_count(&self) -> usize {
        self.threats.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl DocumentStore for MemoryStore {
    fn upsert_access(&self, entry: &AccessEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if !is_stale(entries.get(entry.identity.as_str()), entry) {
            entries.insert(entry.identity.to_string(), entry.clone());
        }
        Ok(())
    }

    fn append_threat(&self, event: &ThreatEvent) -> Result<(), StoreError> {
        self.threats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }

    fn load_snapshot(&self, max_events: usize) -> Result<StoreSnapshot, StoreError> {
        let threats = self.threats.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = threats.len().saturating_sub(max_events);
        Ok(StoreSnapshot {
            access_entries: self
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .cloned()
                .collect(),
            threat_events: threats[skip..].to_vec(),
            threat_event_total: threats.len() as u64,
        })
    }

    fn describe(&self) -> String {
        "memory:".to_string()
    }
}
