//! # Operation State
//!
//! Per-operation JSON state file mapping file hash → pending/done/failed,
//! enabling resume after crash or cancellation. Files live at
//! `.blackbird/operation_<op>_<ts>.json` and are rewritten atomically.
//!
//! Concurrent worker updates serialize through a single [`StateWriter`]
//! task fed over a channel; adjacent updates collapse into one disk flush.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

/// File-name prefix of every operation state file.
const STATE_FILE_PREFIX: &str = "operation";

/// How many updates the writer accumulates before flushing to disk.
const FLUSH_EVERY: usize = 20;

/// Kind of operation a state file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Sync,
    Move,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Move => "move",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-file status inside a state file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Pending,
    Done,
    Failed(String),
}

impl FileStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Done => f.write_str("done"),
            Self::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "done" => Ok(Self::Done),
            other => match other.strip_prefix("failed") {
                Some(rest) => Ok(Self::Failed(
                    rest.trim_start_matches(':').trim().to_string(),
                )),
                None => Err(format!("unknown file status '{}'", other)),
            },
        }
    }
}

impl Serialize for FileStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FileStatus {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// JSON object keys must be strings; hashes serialize as decimal strings.
mod hash_keyed {
    use super::FileStatus;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<u64, FileStatus>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (hash, status) in map {
            out.serialize_entry(&hash.to_string(), status)?;
        }
        out.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<u64, FileStatus>, D::Error> {
        let raw: BTreeMap<String, FileStatus> = BTreeMap::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(key, status)| {
                key.parse::<u64>()
                    .map(|hash| (hash, status))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

/// Persistent record of one sync or move operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationState {
    pub operation_type: OperationType,
    /// Unix seconds when the operation was created.
    pub timestamp: u64,
    /// WebDAV URL for sync, source location name for move.
    pub source: String,
    pub target_location: String,
    /// Requested components; sync only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<String>>,
    #[serde(with = "hash_keyed")]
    pub files: BTreeMap<u64, FileStatus>,
}

impl OperationState {
    pub fn new(
        operation_type: OperationType,
        source: impl Into<String>,
        target_location: impl Into<String>,
        components: Option<Vec<String>>,
        file_hashes: impl IntoIterator<Item = u64>,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            operation_type,
            timestamp,
            source: source.into(),
            target_location: target_location.into(),
            components,
            files: file_hashes
                .into_iter()
                .map(|h| (h, FileStatus::Pending))
                .collect(),
        }
    }

    /// File name this state persists under.
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}.json",
            STATE_FILE_PREFIX, self.operation_type, self.timestamp
        )
    }

    /// Write the initial state file into the `.blackbird` directory and
    /// return its path.
    pub fn create_in(&self, blackbird_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(blackbird_dir)?;
        let path = blackbird_dir.join(self.file_name());
        self.save(&path)?;
        info!(path = %path.display(), files = self.files.len(), "Created operation state file");
        Ok(path)
    }

    /// Load a state file. A corrupt file refuses to load: resuming from it
    /// would silently drop work.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| SyncError::State {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&data).map_err(|e| SyncError::State {
            path: path.to_path_buf(),
            message: format!("corrupt state file: {}", e),
        })
    }

    /// Persist the state (atomic rename-over).
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn update(&mut self, hash: u64, status: FileStatus) {
        self.files.insert(hash, status);
    }

    /// Hashes that still need work: pending or failed.
    pub fn remaining(&self) -> Vec<u64> {
        self.files
            .iter()
            .filter(|(_, status)| status.is_pending() || status.is_failed())
            .map(|(&hash, _)| hash)
            .collect()
    }

    pub fn done_count(&self) -> usize {
        self.files.values().filter(|s| s.is_done()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.files.values().filter(|s| s.is_failed()).count()
    }

    pub fn pending_count(&self) -> usize {
        self.files.values().filter(|s| s.is_pending()).count()
    }
}

/// Delete a state file after a fully successful operation.
pub fn delete_state_file(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
        info!(path = %path.display(), "Deleted operation state file");
    } else {
        warn!(path = %path.display(), "State file already gone");
    }
    Ok(())
}

/// The most recently modified state file of the given kind, if any.
pub fn find_latest_state_file(
    blackbird_dir: &Path,
    operation_type: OperationType,
) -> Option<PathBuf> {
    let prefix = format!("{}_{}_", STATE_FILE_PREFIX, operation_type);
    let mut candidates: Vec<(SystemTime, PathBuf)> = fs::read_dir(blackbird_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(&prefix) && name.ends_with(".json"))
                .unwrap_or(false)
        })
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, entry.path()))
        })
        .collect();
    candidates.sort();
    candidates.pop().map(|(_, path)| path)
}

/// Single writer task that owns a state file during an operation.
///
/// Workers send `(hash, status)` updates through cloned
/// [`StateWriterHandle`]s; the writer batches up to [`FLUSH_EVERY`] updates
/// per flush and always flushes on shutdown.
pub struct StateWriter {
    tx: mpsc::UnboundedSender<(u64, FileStatus)>,
    task: JoinHandle<Result<OperationState>>,
}

/// Cheap cloneable sender side of a [`StateWriter`].
#[derive(Clone)]
pub struct StateWriterHandle {
    tx: mpsc::UnboundedSender<(u64, FileStatus)>,
}

impl StateWriterHandle {
    /// Record a status change. Infallible from the worker's point of view;
    /// a closed writer means the operation is already shutting down.
    pub fn update(&self, hash: u64, status: FileStatus) {
        let _ = self.tx.send((hash, status));
    }
}

impl StateWriter {
    /// Spawn the writer over an existing state file.
    pub fn spawn(path: PathBuf, mut state: OperationState) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(u64, FileStatus)>();

        let task = tokio::spawn(async move {
            let mut unflushed = 0usize;
            while let Some((hash, status)) = rx.recv().await {
                debug!(hash, status = %status, "State update");
                state.update(hash, status);
                unflushed += 1;
                if unflushed >= FLUSH_EVERY {
                    state.save(&path)?;
                    unflushed = 0;
                }
            }
            if unflushed > 0 {
                state.save(&path)?;
            }
            Ok(state)
        });

        Self { tx, task }
    }

    pub fn handle(&self) -> StateWriterHandle {
        StateWriterHandle {
            tx: self.tx.clone(),
        }
    }

    /// Close the channel, wait for the final flush, and return the state.
    pub async fn finish(self) -> Result<OperationState> {
        drop(self.tx);
        self.task.await.map_err(|e| SyncError::State {
            path: PathBuf::new(),
            message: format!("state writer task failed: {}", e),
        })?
    }
}
