//! Durable storage for snapshots and flushed reports.
//!
//! Every file is written to a temporary sibling and renamed into place, so a
//! failed write leaves the previous durable copy untouched.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

use crate::engine::{ActiveConfigsSnapshot, ConfigKey, DumpReason, MetadataSnapshot};

const ACTIVE_CONFIGS_FILE: &str = "active_configs.json";
const METADATA_FILE: &str = "metadata.json";
const REPORTS_DIR: &str = "reports";
const ENVELOPE_VERSION: u32 = 1;

/// Errors raised by snapshot storage.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode or decode {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("checksum mismatch in {path} (expected {expected}, computed {computed})")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        computed: String,
    },
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One flushed bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredReport {
    pub key: ConfigKey,
    pub reason: DumpReason,
    pub bucket_start_ns: i64,
    pub bucket_end_ns: i64,
    pub wall_ns: i64,
    pub counts: BTreeMap<u32, u64>,
}

/// Durable home of the two snapshot kinds and of flushed reports.
///
/// Snapshots are keyed by nothing but "latest"; the `take_*` readers consume
/// them so a snapshot is applied at most once.
pub trait SnapshotStore: Send + Sync {
    fn write_active_configs(&self, snapshot: &ActiveConfigsSnapshot) -> Result<(), StorageError>;

    fn take_active_configs(&self) -> Result<Option<ActiveConfigsSnapshot>, StorageError>;

    fn write_metadata(&self, snapshot: &MetadataSnapshot) -> Result<(), StorageError>;

    fn take_metadata(&self) -> Result<Option<MetadataSnapshot>, StorageError>;

    fn write_report(&self, report: &StoredReport) -> Result<(), StorageError>;

    fn read_reports(&self, key: ConfigKey) -> Result<Vec<StoredReport>, StorageError>;

    fn take_reports(&self, key: ConfigKey) -> Result<Vec<StoredReport>, StorageError>;

    fn remove_reports(&self, key: ConfigKey) -> Result<(), StorageError>;

    /// Deletes reports of `key` written before `cutoff_wall_ns`; returns how many.
    fn purge_reports_before(&self, key: ConfigKey, cutoff_wall_ns: i64)
        -> Result<usize, StorageError>;

    /// Removes everything the store holds.
    fn purge_all(&self) -> Result<(), StorageError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    checksum: String,
    payload: serde_json::Value,
}

/// File-backed store rooted at a single directory.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        let reports = root.join(REPORTS_DIR);
        fs::create_dir_all(&reports).map_err(|err| StorageError::io(&reports, err))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn reports_dir(&self, key: ConfigKey) -> PathBuf {
        self.root
            .join(REPORTS_DIR)
            .join(format!("{}_{}", key.uid(), key.id()))
    }

    fn write_json<T: Serialize>(
        &self,
        path: &Path,
        what: &'static str,
        value: &T,
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_value(value)
            .map_err(|source| StorageError::Serialize { what, source })?;
        let canonical = serde_json::to_vec(&payload)
            .map_err(|source| StorageError::Serialize { what, source })?;
        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            checksum: compute_checksum(&canonical),
            payload,
        };
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|source| StorageError::Serialize { what, source })?;
        let temp = temp_path(path);
        if let Err(err) = write_synced(&temp, &bytes) {
            let _ = fs::remove_file(&temp);
            return Err(StorageError::io(&temp, err));
        }
        fs::rename(&temp, path).map_err(|err| {
            let _ = fs::remove_file(&temp);
            StorageError::io(path, err)
        })
    }

    fn read_json<T: DeserializeOwned>(
        &self,
        path: &Path,
        what: &'static str,
    ) -> Result<Option<T>, StorageError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageError::io(path, err)),
        };
        let envelope: Envelope = serde_json::from_slice(&bytes)
            .map_err(|source| StorageError::Serialize { what, source })?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(StorageError::UnsupportedVersion(envelope.version));
        }
        let canonical = serde_json::to_vec(&envelope.payload)
            .map_err(|source| StorageError::Serialize { what, source })?;
        let computed = compute_checksum(&canonical);
        if computed != envelope.checksum {
            return Err(StorageError::ChecksumMismatch {
                path: path.to_path_buf(),
                expected: envelope.checksum,
                computed,
            });
        }
        serde_json::from_value(envelope.payload)
            .map(Some)
            .map_err(|source| StorageError::Serialize { what, source })
    }

    fn take_json<T: DeserializeOwned>(
        &self,
        path: &Path,
        what: &'static str,
    ) -> Result<Option<T>, StorageError> {
        let value = self.read_json(path, what)?;
        if value.is_some() {
            remove_if_exists(path)?;
        }
        Ok(value)
    }

    fn report_files(&self, key: ConfigKey) -> Result<Vec<PathBuf>, StorageError> {
        let dir = self.reports_dir(key);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::io(&dir, err)),
        };
        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| StorageError::io(&dir, err))?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn write_active_configs(&self, snapshot: &ActiveConfigsSnapshot) -> Result<(), StorageError> {
        self.write_json(&self.root.join(ACTIVE_CONFIGS_FILE), "active configs", snapshot)
    }

    fn take_active_configs(&self) -> Result<Option<ActiveConfigsSnapshot>, StorageError> {
        self.take_json(&self.root.join(ACTIVE_CONFIGS_FILE), "active configs")
    }

    fn write_metadata(&self, snapshot: &MetadataSnapshot) -> Result<(), StorageError> {
        self.write_json(&self.root.join(METADATA_FILE), "metadata", snapshot)
    }

    fn take_metadata(&self) -> Result<Option<MetadataSnapshot>, StorageError> {
        self.take_json(&self.root.join(METADATA_FILE), "metadata")
    }

    fn write_report(&self, report: &StoredReport) -> Result<(), StorageError> {
        let dir = self.reports_dir(report.key);
        fs::create_dir_all(&dir).map_err(|err| StorageError::io(&dir, err))?;
        let stem = format!(
            "{:020}_{:020}",
            report.wall_ns.max(0),
            report.bucket_end_ns.max(0)
        );
        // Reports sharing a timestamp get increasing sequence suffixes.
        let mut seq = 0u32;
        let path = loop {
            let candidate = dir.join(format!("{stem}_{seq:06}.json"));
            if !candidate.exists() {
                break candidate;
            }
            seq += 1;
        };
        self.write_json(&path, "report", report)
    }

    fn read_reports(&self, key: ConfigKey) -> Result<Vec<StoredReport>, StorageError> {
        let mut reports = Vec::new();
        for path in self.report_files(key)? {
            if let Some(report) = self.read_json(&path, "report")? {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    fn take_reports(&self, key: ConfigKey) -> Result<Vec<StoredReport>, StorageError> {
        // Nothing is removed unless every report decodes.
        let mut taken = Vec::new();
        for path in self.report_files(key)? {
            if let Some(report) = self.read_json(&path, "report")? {
                taken.push((path, report));
            }
        }
        let mut reports = Vec::with_capacity(taken.len());
        for (path, report) in taken {
            remove_if_exists(&path)?;
            reports.push(report);
        }
        Ok(reports)
    }

    fn remove_reports(&self, key: ConfigKey) -> Result<(), StorageError> {
        let dir = self.reports_dir(key);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io(&dir, err)),
        }
    }

    fn purge_reports_before(
        &self,
        key: ConfigKey,
        cutoff_wall_ns: i64,
    ) -> Result<usize, StorageError> {
        let mut purged = 0;
        for path in self.report_files(key)? {
            let stale = self
                .read_json::<StoredReport>(&path, "report")?
                .is_some_and(|report| report.wall_ns < cutoff_wall_ns);
            if stale {
                remove_if_exists(&path)?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn purge_all(&self) -> Result<(), StorageError> {
        remove_if_exists(&self.root.join(ACTIVE_CONFIGS_FILE))?;
        remove_if_exists(&self.root.join(METADATA_FILE))?;
        let reports = self.root.join(REPORTS_DIR);
        match fs::remove_dir_all(&reports) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::io(&reports, err)),
        }
        fs::create_dir_all(&reports).map_err(|err| StorageError::io(&reports, err))
    }
}

/// Volatile store for tests and for running without a writable data directory.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    active_configs: Option<ActiveConfigsSnapshot>,
    metadata: Option<MetadataSnapshot>,
    reports: BTreeMap<ConfigKey, Vec<StoredReport>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest persisted active-config snapshot without consuming it.
    pub fn peek_active_configs(&self) -> Option<ActiveConfigsSnapshot> {
        self.state().active_configs.clone()
    }

    pub fn peek_metadata(&self) -> Option<MetadataSnapshot> {
        self.state().metadata.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn write_active_configs(&self, snapshot: &ActiveConfigsSnapshot) -> Result<(), StorageError> {
        self.state().active_configs = Some(snapshot.clone());
        Ok(())
    }

    fn take_active_configs(&self) -> Result<Option<ActiveConfigsSnapshot>, StorageError> {
        Ok(self.state().active_configs.take())
    }

    fn write_metadata(&self, snapshot: &MetadataSnapshot) -> Result<(), StorageError> {
        self.state().metadata = Some(snapshot.clone());
        Ok(())
    }

    fn take_metadata(&self) -> Result<Option<MetadataSnapshot>, StorageError> {
        Ok(self.state().metadata.take())
    }

    fn write_report(&self, report: &StoredReport) -> Result<(), StorageError> {
        self.state()
            .reports
            .entry(report.key)
            .or_default()
            .push(report.clone());
        Ok(())
    }

    fn read_reports(&self, key: ConfigKey) -> Result<Vec<StoredReport>, StorageError> {
        Ok(self.state().reports.get(&key).cloned().unwrap_or_default())
    }

    fn take_reports(&self, key: ConfigKey) -> Result<Vec<StoredReport>, StorageError> {
        Ok(self.state().reports.remove(&key).unwrap_or_default())
    }

    fn remove_reports(&self, key: ConfigKey) -> Result<(), StorageError> {
        self.state().reports.remove(&key);
        Ok(())
    }

    fn purge_reports_before(
        &self,
        key: ConfigKey,
        cutoff_wall_ns: i64,
    ) -> Result<usize, StorageError> {
        let mut state = self.state();
        let Some(reports) = state.reports.get_mut(&key) else {
            return Ok(0);
        };
        let before = reports.len();
        reports.retain(|report| report.wall_ns >= cutoff_wall_ns);
        Ok(before - reports.len())
    }

    fn purge_all(&self) -> Result<(), StorageError> {
        *self.state() = MemoryState::default();
        Ok(())
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StorageError::io(path, err)),
    }
}

fn compute_checksum(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    to_hex(&digest)
}

fn to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}
