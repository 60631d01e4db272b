//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: implements raft-core's PersistenceGateway; raft-core ships the
//! in-memory gateway used for testing
//! what: FileStorage with three independently versioned json artifacts

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use raft_core::{LogEntry, LogIndex, PersistenceGateway, RecoveredState, Snapshot, Term};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Format version of the term record
pub const TERM_FORMAT_VERSION: u32 = 1;
/// Format version of the log segment
pub const LOG_FORMAT_VERSION: u32 = 1;
/// Format version of the snapshot blob
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Reasons a stored artifact cannot be read back. Surfaced as
/// `io::ErrorKind::InvalidData`.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("{artifact} has unsupported format version {found} (expected {expected})")]
    UnsupportedVersion {
        artifact: &'static str,
        found: u32,
        expected: u32,
    },

    #[error("{artifact} is not valid json: {source}")]
    Malformed {
        artifact: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl From<FormatError> for io::Error {
    fn from(err: FormatError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

// -- on-disk documents --

#[derive(Serialize, Deserialize)]
struct TermRecord {
    version: u32,
    term: Term,
    voted_for: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct LogSegment {
    version: u32,
    entries: Vec<LogEntry>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotBlob {
    version: u32,
    last_included_index: LogIndex,
    last_included_term: Term,
    state: Vec<u8>,
}

trait Versioned {
    const ARTIFACT: &'static str;
    const EXPECTED: u32;
    fn version(&self) -> u32;
}

impl Versioned for TermRecord {
    const ARTIFACT: &'static str = "term record";
    const EXPECTED: u32 = TERM_FORMAT_VERSION;
    fn version(&self) -> u32 {
        self.version
    }
}

impl Versioned for LogSegment {
    const ARTIFACT: &'static str = "log segment";
    const EXPECTED: u32 = LOG_FORMAT_VERSION;
    fn version(&self) -> u32 {
        self.version
    }
}

impl Versioned for SnapshotBlob {
    const ARTIFACT: &'static str = "snapshot";
    const EXPECTED: u32 = SNAPSHOT_FORMAT_VERSION;
    fn version(&self) -> u32 {
        self.version
    }
}

// -- file storage implementation --

/// file-based persistence gateway using std::fs
///
/// stores raft state in a directory with:
/// - term.json: current term and vote
/// - log.json: retained log entries
/// - snapshot.json: latest snapshot
///
/// every write goes to a temp file that is synced and renamed over the
/// target, so a crash leaves either the old or the new document in place.
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn term_path(&self) -> PathBuf {
        self.dir.join("term.json")
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join("log.json")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot.json")
    }

    /// atomic write: write to temp file, sync, then rename over `path`
    fn write_atomic<T: Serialize>(&self, path: &Path, value: &T) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// read a versioned document, none if it was never written
    fn read<T>(&self, path: &Path) -> io::Result<Option<T>>
    where
        T: DeserializeOwned + Versioned,
    {
        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let doc: T = serde_json::from_slice(&contents).map_err(|source| FormatError::Malformed {
            artifact: T::ARTIFACT,
            source,
        })?;
        if doc.version() != T::EXPECTED {
            return Err(FormatError::UnsupportedVersion {
                artifact: T::ARTIFACT,
                found: doc.version(),
                expected: T::EXPECTED,
            }
            .into());
        }
        Ok(Some(doc))
    }

    fn load_entries(&self) -> io::Result<Vec<LogEntry>> {
        Ok(self
            .read::<LogSegment>(&self.log_path())?
            .map(|segment| segment.entries)
            .unwrap_or_default())
    }

    fn store_entries(&self, entries: Vec<LogEntry>) -> io::Result<()> {
        self.write_atomic(
            &self.log_path(),
            &LogSegment {
                version: LOG_FORMAT_VERSION,
                entries,
            },
        )
    }

    fn load_snapshot(&self) -> io::Result<Option<Snapshot>> {
        Ok(self
            .read::<SnapshotBlob>(&self.snapshot_path())?
            .map(|blob| {
                Snapshot::new(blob.last_included_index, blob.last_included_term, blob.state)
            }))
    }
}

impl PersistenceGateway for FileStorage {
    fn persist_term(&self, term: Term, voted_for: Option<&str>) -> io::Result<()> {
        self.write_atomic(
            &self.term_path(),
            &TermRecord {
                version: TERM_FORMAT_VERSION,
                term,
                voted_for: voted_for.map(str::to_owned),
            },
        )
    }

    fn persist_entries(&self, entries: &[LogEntry]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        // rewrite the whole segment (simple approach - could optimize with append-only file)
        let mut log = self.load_entries()?;
        log.extend(entries.iter().cloned());
        self.store_entries(log)?;
        debug!(count = entries.len(), "persisted log entries");
        Ok(())
    }

    fn truncate(&self, from_index: LogIndex) -> io::Result<()> {
        let mut log = self.load_entries()?;
        log.retain(|e| e.index < from_index);
        self.store_entries(log)
    }

    fn purge_through(&self, index: LogIndex) -> io::Result<()> {
        let mut log = self.load_entries()?;
        log.retain(|e| e.index > index);
        self.store_entries(log)
    }

    fn persist_snapshot(&self, snapshot: &Snapshot) -> io::Result<()> {
        self.write_atomic(
            &self.snapshot_path(),
            &SnapshotBlob {
                version: SNAPSHOT_FORMAT_VERSION,
                last_included_index: snapshot.last_included_index,
                last_included_term: snapshot.last_included_term,
                state: snapshot.state.clone(),
            },
        )?;
        info!(
            index = snapshot.last_included_index,
            term = snapshot.last_included_term,
            "persisted snapshot"
        );
        Ok(())
    }

    fn load_on_startup(&self) -> io::Result<RecoveredState> {
        let (current_term, voted_for) = self
            .read::<TermRecord>(&self.term_path())?
            .map(|record| (record.term, record.voted_for))
            .unwrap_or((0, None)); // default for new nodes

        let snapshot = self.load_snapshot()?;
        let compacted = snapshot.as_ref().map_or(0, |s| s.last_included_index);

        let mut entries = self.load_entries()?;
        entries.retain(|e| e.index > compacted);

        Ok(RecoveredState {
            current_term,
            voted_for,
            entries,
            snapshot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_storage_persists_term_and_vote() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        storage.persist_term(7, Some("n3")).unwrap();
        let state = storage.load_on_startup().unwrap();

        assert_eq!(state.current_term, 7);
        assert_eq!(state.voted_for.as_deref(), Some("n3"));
    }

    #[test]
    fn file_storage_appends_and_loads_log() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        let entries = vec![
            LogEntry::new(1, 1, b"set key1 value1".to_vec()),
            LogEntry::new(1, 2, b"set key2 value2".to_vec()),
        ];
        storage.persist_entries(&entries).unwrap();

        let log = storage.load_on_startup().unwrap().entries;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].payload, b"set key1 value1".to_vec());
    }

    #[test]
    fn file_storage_truncates_log() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        let entries = vec![
            LogEntry::new(1, 1, vec![1]),
            LogEntry::new(2, 2, vec![2]),
            LogEntry::new(3, 3, vec![3]),
        ];
        storage.persist_entries(&entries).unwrap();

        storage.truncate(2).unwrap();

        let log = storage.load_on_startup().unwrap().entries;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].index, 1);
    }

    #[test]
    fn unknown_version_is_invalid_data() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        fs::write(
            storage.term_path(),
            r#"{"version": 99, "term": 1, "voted_for": null}"#,
        )
        .unwrap();

        let err = storage.load_on_startup().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("version 99"));
    }
}
