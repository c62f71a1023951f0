//! Durable, hash-chained workflow event log
//!
//! Each workflow owns one append-only log segment. Every record carries the
//! SHA-256 of its predecessor, so any edit, reordering or truncation in the
//! middle of a segment is detected by [`verify_chain`].
//!
//! Two stores are provided: [`InMemoryEventStore`] for tests and ephemeral
//! engines, and [`FileEventStore`], which writes one JSON-lines file per
//! workflow and syncs every append.

use crate::error::LogError;
use crate::events::WorkflowEvent;
use crate::types::{EventId, WorkflowId};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// `prev_hash` of the first record in a segment
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One persisted event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// 1-based, contiguous within a workflow
    pub sequence: u64,
    pub event_id: EventId,
    pub workflow_id: WorkflowId,
    pub recorded_at: DateTime<Utc>,
    pub event: WorkflowEvent,
    pub prev_hash: String,
    pub hash: String,
}

impl EventRecord {
    /// Hash this record would have with its current contents
    pub fn compute_hash(&self) -> Result<String, LogError> {
        let mut hasher = Sha256::new();
        hasher.update(self.sequence.to_le_bytes());
        hasher.update(self.event_id.0.as_bytes());
        hasher.update(self.workflow_id.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(
            self.recorded_at
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_bytes(),
        );
        hasher.update([0]);
        hasher.update(serde_json::to_vec(&self.event)?);
        hasher.update([0]);
        hasher.update(self.prev_hash.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Check sequence continuity, linkage and hashes of one segment
pub fn verify_chain(records: &[EventRecord]) -> Result<(), LogError> {
    let mut prev = GENESIS_HASH.to_string();
    let mut workflow: Option<&WorkflowId> = None;

    for (index, record) in records.iter().enumerate() {
        let violation = |reason: String| LogError::IntegrityViolation {
            sequence: record.sequence,
            reason,
        };

        let expected_sequence = index as u64 + 1;
        if record.sequence != expected_sequence {
            return Err(violation(format!("expected sequence {expected_sequence}")));
        }
        match workflow {
            Some(id) if id != &record.workflow_id => {
                return Err(violation(format!(
                    "record belongs to {} not {id}",
                    record.workflow_id
                )));
            }
            _ => workflow = Some(&record.workflow_id),
        }
        if record.prev_hash != prev {
            return Err(violation("previous hash does not link".into()));
        }
        if record.compute_hash()? != record.hash {
            return Err(violation("record hash mismatch".into()));
        }
        prev.clone_from(&record.hash);
    }
    Ok(())
}

/// Backing storage for log segments
pub trait EventStore: Send + Sync {
    /// Persist one record at the end of its workflow's segment
    fn append(&self, record: &EventRecord) -> Result<(), LogError>;

    /// Every record of a workflow, in sequence order; empty if unknown
    fn load(&self, workflow_id: &WorkflowId) -> Result<Vec<EventRecord>, LogError>;

    /// Workflows with at least one record
    fn workflows(&self) -> Result<Vec<WorkflowId>, LogError>;
}

/// Volatile store
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    segments: Mutex<HashMap<WorkflowId, Vec<EventRecord>>>,
}

impl InMemoryEventStore {
    /// Create new empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, record: &EventRecord) -> Result<(), LogError> {
        self.segments
            .lock()
            .entry(record.workflow_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn load(&self, workflow_id: &WorkflowId) -> Result<Vec<EventRecord>, LogError> {
        Ok(self
            .segments
            .lock()
            .get(workflow_id)
            .cloned()
            .unwrap_or_default())
    }

    fn workflows(&self) -> Result<Vec<WorkflowId>, LogError> {
        let mut ids: Vec<_> = self.segments.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// One JSON-lines file per workflow under a directory
#[derive(Debug)]
pub struct FileEventStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileEventStore {
    /// Open (creating if needed) a log directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, LogError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| LogError::io(&dir, e))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Log directory
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Segment file of a workflow
    ///
    /// ASCII letters, digits, `-` and `.` are kept; every other byte is
    /// written as `_` plus two hex digits, so distinct ids never share a file.
    #[must_use]
    pub fn segment_path(&self, workflow_id: &WorkflowId) -> PathBuf {
        let mut name = String::with_capacity(workflow_id.as_str().len());
        for byte in workflow_id.as_str().bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.') {
                name.push(char::from(byte));
            } else {
                name.push('_');
                name.push_str(&hex::encode([byte]));
            }
        }
        self.dir.join(format!("{name}.jsonl"))
    }
}

impl EventStore for FileEventStore {
    fn append(&self, record: &EventRecord) -> Result<(), LogError> {
        let path = self.segment_path(&record.workflow_id);
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LogError::io(&path, e))?;
        file.write_all(&line).map_err(|e| LogError::io(&path, e))?;
        file.sync_data().map_err(|e| LogError::io(&path, e))?;
        Ok(())
    }

    fn load(&self, workflow_id: &WorkflowId) -> Result<Vec<EventRecord>, LogError> {
        let path = self.segment_path(workflow_id);
        let _guard = self.write_lock.lock();
        let segment = scan_segment(&path)?;

        if let Some(record) = segment.records.iter().find(|r| &r.workflow_id != workflow_id) {
            return Err(LogError::WorkflowMismatch {
                expected: workflow_id.clone(),
                found: record.workflow_id.clone(),
            });
        }

        // The next append must start on a fresh line
        if let Some(valid_len) = segment.torn_at {
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| LogError::io(&path, e))?;
            file.set_len(valid_len).map_err(|e| LogError::io(&path, e))?;
            file.sync_data().map_err(|e| LogError::io(&path, e))?;
        } else if segment.unterminated {
            tracing::warn!(path = %path.display(), "terminating last log record");
            let mut file = OpenOptions::new()
                .append(true)
                .open(&path)
                .map_err(|e| LogError::io(&path, e))?;
            file.write_all(b"\n").map_err(|e| LogError::io(&path, e))?;
            file.sync_data().map_err(|e| LogError::io(&path, e))?;
        }
        Ok(segment.records)
    }

    fn workflows(&self) -> Result<Vec<WorkflowId>, LogError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| LogError::io(&self.dir, e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| LogError::io(&self.dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(first) = read_segment(&path)?.into_iter().next() {
                ids.push(first.workflow_id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Read a JSON-lines segment
///
/// A torn final line (no trailing newline, e.g. after a crash mid-write) is
/// dropped; any other undecodable line is an error.
pub fn read_segment(path: &Path) -> Result<Vec<EventRecord>, LogError> {
    scan_segment(path).map(|s| s.records)
}

struct Segment {
    records: Vec<EventRecord>,
    /// Byte length of the intact prefix when the last line is torn
    torn_at: Option<u64>,
    /// Last line is a whole record whose newline never reached disk
    unterminated: bool,
}

fn scan_segment(path: &Path) -> Result<Segment, LogError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Segment {
                records: Vec::new(),
                torn_at: None,
                unterminated: false,
            })
        }
        Err(e) => return Err(LogError::io(path, e)),
    };

    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut torn_at = None;
    let mut unterminated = false;

    for line in content.split_inclusive('\n') {
        let start = offset;
        offset += line.len();
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventRecord>(line.trim_end()) {
            Ok(record) => {
                unterminated = !line.ends_with('\n');
                records.push(record);
            }
            Err(e) if !line.ends_with('\n') => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "dropping torn trailing log record"
                );
                torn_at = Some(start as u64);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Segment {
        records,
        torn_at,
        unterminated,
    })
}

/// Append handle for one workflow's segment
///
/// Records are produced in two phases: [`EventLog::seal`] builds the next
/// chained record without persisting it, [`EventLog::commit`] writes it and
/// advances the chain.
pub struct EventLog {
    workflow_id: WorkflowId,
    store: Arc<dyn EventStore>,
    next_sequence: u64,
    last_hash: String,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("workflow_id", &self.workflow_id)
            .field("next_sequence", &self.next_sequence)
            .finish_non_exhaustive()
    }
}

impl EventLog {
    /// Open a segment, verifying whatever it already holds
    ///
    /// Returns the handle and the existing records.
    pub fn open(
        store: Arc<dyn EventStore>,
        workflow_id: WorkflowId,
    ) -> Result<(Self, Vec<EventRecord>), LogError> {
        let records = store.load(&workflow_id)?;
        verify_chain(&records)?;

        let (next_sequence, last_hash) = records.last().map_or_else(
            || (1, GENESIS_HASH.to_string()),
            |r| (r.sequence + 1, r.hash.clone()),
        );
        let log = Self {
            workflow_id,
            store,
            next_sequence,
            last_hash,
        };
        Ok((log, records))
    }

    /// Workflow this segment belongs to
    #[inline]
    #[must_use]
    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    /// Sequence the next record will get
    #[inline]
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Build the next record
    pub fn seal(&self, event: WorkflowEvent, at: DateTime<Utc>) -> Result<EventRecord, LogError> {
        let mut record = EventRecord {
            sequence: self.next_sequence,
            event_id: EventId::new(),
            workflow_id: self.workflow_id.clone(),
            recorded_at: at,
            event,
            prev_hash: self.last_hash.clone(),
            hash: String::new(),
        };
        record.hash = record.compute_hash()?;
        Ok(record)
    }

    /// Persist a sealed record
    pub fn commit(&mut self, record: &EventRecord) -> Result<(), LogError> {
        if record.sequence != self.next_sequence || record.prev_hash != self.last_hash {
            return Err(LogError::IntegrityViolation {
                sequence: record.sequence,
                reason: "record was not sealed against the current head".into(),
            });
        }
        self.store.append(record)?;
        self.next_sequence += 1;
        self.last_hash.clone_from(&record.hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn started() -> WorkflowEvent {
        WorkflowEvent::WorkflowStarted {
            workflow_type: "screening".into(),
            input: json!({"target": "EGFR", "threshold": 0.7}),
        }
    }

    fn write_chain(store: Arc<dyn EventStore>, id: &str, n: usize) -> Vec<EventRecord> {
        let (mut log, _) = EventLog::open(store, WorkflowId::new(id)).unwrap();
        let mut out = Vec::new();
        for i in 0..n {
            let event = if i == 0 {
                started()
            } else {
                WorkflowEvent::PlanCompleted
            };
            let record = log.seal(event, Utc::now()).unwrap();
            log.commit(&record).unwrap();
            out.push(record);
        }
        out
    }

    #[test]
    fn chain_links_and_verifies() {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let records = write_chain(Arc::clone(&store), "w1", 3);

        assert_eq!(records[0].prev_hash, GENESIS_HASH);
        assert_eq!(records[1].prev_hash, records[0].hash);
        assert_eq!(records[2].sequence, 3);
        assert!(verify_chain(&store.load(&WorkflowId::new("w1")).unwrap()).is_ok());
    }

    #[test]
    fn tampered_event_detected() {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let mut records = write_chain(store, "w1", 3);
        records[1].event = WorkflowEvent::WorkflowCompleted;

        let err = verify_chain(&records).unwrap_err();
        assert!(matches!(err, LogError::IntegrityViolation { sequence: 2, .. }));
    }

    #[test]
    fn dropped_record_detected() {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let mut records = write_chain(store, "w1", 3);
        records.remove(1);
        assert!(verify_chain(&records).is_err());
    }

    #[test]
    fn commit_rejects_stale_seal() {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let (mut log, _) = EventLog::open(store, WorkflowId::new("w1")).unwrap();
        let first = log.seal(started(), Utc::now()).unwrap();
        let stale = log.seal(WorkflowEvent::PlanCompleted, Utc::now()).unwrap();
        log.commit(&first).unwrap();
        assert!(log.commit(&stale).is_err());
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn EventStore> = Arc::new(FileEventStore::open(dir.path()).unwrap());
        let written = write_chain(Arc::clone(&store), "w/1", 4);

        let loaded = store.load(&WorkflowId::new("w/1")).unwrap();
        assert_eq!(loaded, written);
        assert!(verify_chain(&loaded).is_ok());
        assert_eq!(store.workflows().unwrap(), vec![WorkflowId::new("w/1")]);
    }

    #[test]
    fn torn_trailing_line_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let file_store = FileEventStore::open(dir.path()).unwrap();
        let path = file_store.segment_path(&WorkflowId::new("w1"));
        let store: Arc<dyn EventStore> = Arc::new(file_store);
        write_chain(Arc::clone(&store), "w1", 2);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"sequence\":3,\"event_").unwrap();

        let (mut log, records) = EventLog::open(Arc::clone(&store), WorkflowId::new("w1")).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(log.next_sequence(), 3);

        let next = log.seal(WorkflowEvent::PlanCompleted, Utc::now()).unwrap();
        log.commit(&next).unwrap();
        let reloaded = store.load(&WorkflowId::new("w1")).unwrap();
        assert_eq!(reloaded.len(), 3);
        assert!(verify_chain(&reloaded).is_ok());
    }

    #[test]
    fn unterminated_last_record_kept_and_closed() {
        let dir = tempfile::tempdir().unwrap();
        let file_store = FileEventStore::open(dir.path()).unwrap();
        let path = file_store.segment_path(&WorkflowId::new("w1"));
        let store: Arc<dyn EventStore> = Arc::new(file_store);
        write_chain(Arc::clone(&store), "w1", 2);

        // Crash after the record bytes but before the newline
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.trim_end_matches('\n')).unwrap();

        let (mut log, records) = EventLog::open(Arc::clone(&store), WorkflowId::new("w1")).unwrap();
        assert_eq!(records.len(), 2);
        let next = log.seal(WorkflowEvent::PlanCompleted, Utc::now()).unwrap();
        log.commit(&next).unwrap();

        let reloaded = store.load(&WorkflowId::new("w1")).unwrap();
        assert_eq!(reloaded.len(), 3);
        assert!(verify_chain(&reloaded).is_ok());
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 3);
    }

    #[test]
    fn similar_ids_get_separate_segments() {
        let dir = tempfile::tempdir().unwrap();
        let file_store = FileEventStore::open(dir.path()).unwrap();
        let ids = ["w/1", "w_1", "w 1", "w1"];
        let paths: HashSet<PathBuf> = ids
            .iter()
            .map(|id| file_store.segment_path(&WorkflowId::new(*id)))
            .collect();
        assert_eq!(paths.len(), ids.len());
        assert!(paths.iter().all(|p| p.parent() == Some(dir.path())));

        let store: Arc<dyn EventStore> = Arc::new(file_store);
        write_chain(Arc::clone(&store), "w/1", 2);
        write_chain(Arc::clone(&store), "w_1", 1);
        let records = store.load(&WorkflowId::new("w_1")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].workflow_id, WorkflowId::new("w_1"));
        assert_eq!(store.workflows().unwrap().len(), 2);
    }

    #[test]
    fn foreign_segment_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file_store = FileEventStore::open(dir.path()).unwrap();
        let theirs = file_store.segment_path(&WorkflowId::new("w2"));
        let ours = file_store.segment_path(&WorkflowId::new("w1"));
        let store: Arc<dyn EventStore> = Arc::new(file_store);
        write_chain(Arc::clone(&store), "w2", 2);
        fs::copy(&theirs, &ours).unwrap();

        let err = store.load(&WorkflowId::new("w1")).unwrap_err();
        let other = WorkflowId::new("w2");
        assert!(
            matches!(&err, LogError::WorkflowMismatch { found, .. } if found == &other),
            "{err:?}"
        );
    }

    #[test]
    fn missing_segment_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileEventStore::open(dir.path()).unwrap();
        assert!(store.load(&WorkflowId::new("nope")).unwrap().is_empty());
    }
}
