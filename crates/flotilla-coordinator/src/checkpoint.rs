//! Checkpoint snapshots, the integrity-checked blob envelope and the stores
//! that persist blobs.
//!
//! A blob is `{version, timestamp, integrity_hash, payload}` where `payload`
//! is the base64 of the JSON snapshot and `integrity_hash` is the SHA-256 of
//! those snapshot bytes. Anything that fails to decode or verify is an
//! `IntegrityViolation`.

use crate::circuit_breaker::CircuitBreaker;
use crate::resources::Reservation;
use crate::types::{Agent, Task};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use flotilla_core::{AgentId, FlotillaError, FlotillaResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Format tag carried inside every snapshot.
pub const SNAPSHOT_FORMAT: &str = "flotilla.coordinator.v1";

/// Why a checkpoint was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTrigger {
    /// A configured number of tasks completed.
    TaskCount,
    /// The periodic timer fired.
    Interval,
    /// Requested by a caller before a risky operation.
    PreRiskOperation,
    /// Failure handling for an agent finished.
    ErrorRecovery,
    Manual,
    Shutdown,
}

impl std::fmt::Display for CheckpointTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointTrigger::TaskCount => write!(f, "task_count"),
            CheckpointTrigger::Interval => write!(f, "interval"),
            CheckpointTrigger::PreRiskOperation => write!(f, "pre_risk_operation"),
            CheckpointTrigger::ErrorRecovery => write!(f, "error_recovery"),
            CheckpointTrigger::Manual => write!(f, "manual"),
            CheckpointTrigger::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Everything needed to rebuild a coordinator, minus agent liveness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorSnapshot {
    pub format: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub trigger: CheckpointTrigger,
    pub agents: Vec<Agent>,
    pub tasks: Vec<Task>,
    pub reservations: Vec<Reservation>,
    pub breakers: BTreeMap<AgentId, CircuitBreaker>,
}

/// The persisted envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointBlob {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    /// Hex SHA-256 of the decoded payload bytes.
    pub integrity_hash: String,
    /// Base64 of the JSON snapshot.
    pub payload: String,
}

impl CheckpointBlob {
    /// Serialize and hash a snapshot.
    pub fn seal(snapshot: &CoordinatorSnapshot) -> FlotillaResult<Self> {
        let bytes = serde_json::to_vec(snapshot)?;
        Ok(Self {
            version: snapshot.version,
            timestamp: snapshot.created_at,
            integrity_hash: sha256_hex(&bytes),
            payload: STANDARD.encode(&bytes),
        })
    }

    pub fn to_bytes(&self) -> FlotillaResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse an envelope. A blob that does not parse is treated as corrupt.
    pub fn from_bytes(bytes: &[u8]) -> FlotillaResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            FlotillaError::IntegrityViolation(format!("malformed checkpoint envelope: {e}"))
        })
    }

    /// Decode the payload and check it against the recorded hash.
    pub fn verified_payload(&self) -> FlotillaResult<Vec<u8>> {
        let bytes = STANDARD.decode(self.payload.as_bytes()).map_err(|e| {
            FlotillaError::IntegrityViolation(format!("payload is not valid base64: {e}"))
        })?;
        let actual = sha256_hex(&bytes);
        if actual != self.integrity_hash {
            return Err(FlotillaError::IntegrityViolation(format!(
                "integrity hash mismatch: recorded {}, computed {actual}",
                self.integrity_hash
            )));
        }
        Ok(bytes)
    }

    /// Verify and decode the snapshot, cross-checking it against the envelope.
    pub fn open(&self) -> FlotillaResult<CoordinatorSnapshot> {
        let bytes = self.verified_payload()?;
        let snapshot: CoordinatorSnapshot = serde_json::from_slice(&bytes).map_err(|e| {
            FlotillaError::IntegrityViolation(format!("snapshot does not decode: {e}"))
        })?;
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(FlotillaError::IntegrityViolation(format!(
                "unsupported snapshot format {}",
                snapshot.format
            )));
        }
        if snapshot.version != self.version || snapshot.created_at != self.timestamp {
            return Err(FlotillaError::IntegrityViolation(
                "envelope version/timestamp disagree with snapshot".into(),
            ));
        }
        Ok(snapshot)
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Describes a blob handed to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub trigger: CheckpointTrigger,
}

/// Where a stored blob lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointHandle {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub location: String,
}

/// Durable blob storage for checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, blob: &[u8], meta: &CheckpointMetadata)
        -> FlotillaResult<CheckpointHandle>;
    /// The blob with the highest version, if any.
    async fn load_latest(&self) -> FlotillaResult<Option<Vec<u8>>>;
    async fn load(&self, version: u64) -> FlotillaResult<Option<Vec<u8>>>;
    /// Stored checkpoints, oldest first.
    async fn list(&self) -> FlotillaResult<Vec<CheckpointHandle>>;
}

/// In-process store, for embedding and tests.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    blobs: Mutex<BTreeMap<u64, (CheckpointHandle, Vec<u8>)>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored blob in place. Lets tests simulate corruption.
    pub fn tamper(&self, version: u64, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        match self.blobs.lock().get_mut(&version) {
            Some((_, bytes)) => {
                f(bytes);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(
        &self,
        blob: &[u8],
        meta: &CheckpointMetadata,
    ) -> FlotillaResult<CheckpointHandle> {
        let handle = CheckpointHandle {
            version: meta.version,
            timestamp: meta.timestamp,
            location: format!("memory:{}", meta.version),
        };
        self.blobs
            .lock()
            .insert(meta.version, (handle.clone(), blob.to_vec()));
        Ok(handle)
    }

    async fn load_latest(&self) -> FlotillaResult<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .lock()
            .values()
            .next_back()
            .map(|(_, bytes)| bytes.clone()))
    }

    async fn load(&self, version: u64) -> FlotillaResult<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(&version).map(|(_, b)| b.clone()))
    }

    async fn list(&self) -> FlotillaResult<Vec<CheckpointHandle>> {
        Ok(self.blobs.lock().values().map(|(h, _)| h.clone()).collect())
    }
}

/// One JSON file per checkpoint in a directory.
///
/// Files are named `checkpoint-<version>-<millis>.json` with the version
/// zero-padded, so name order is version order. Writes go to a temporary
/// file first and are renamed into place.
pub struct FileCheckpointStore {
    dir: PathBuf,
    keep_last: usize,
}

impl FileCheckpointStore {
    pub async fn new(dir: impl Into<PathBuf>, keep_last: usize) -> FlotillaResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir, keep_last })
    }

    /// Open a directory for reading without creating it.
    pub fn open_existing(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            keep_last: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(meta: &CheckpointMetadata) -> String {
        format!(
            "checkpoint-{:020}-{}.json",
            meta.version,
            meta.timestamp.timestamp_millis()
        )
    }

    async fn entries(&self) -> FlotillaResult<Vec<(CheckpointHandle, PathBuf)>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(handle) = parse_file_name(name, &path) {
                entries.push((handle, path));
            }
        }
        entries.sort_by_key(|(h, _)| h.version);
        Ok(entries)
    }

    async fn prune(&self) -> FlotillaResult<()> {
        if self.keep_last == 0 {
            return Ok(());
        }
        let entries = self.entries().await?;
        let excess = entries.len().saturating_sub(self.keep_last);
        for (handle, path) in entries.into_iter().take(excess) {
            tokio::fs::remove_file(&path).await?;
            debug!(version = handle.version, "Pruned old checkpoint");
        }
        Ok(())
    }
}

fn parse_file_name(name: &str, path: &Path) -> Option<CheckpointHandle> {
    let stem = name.strip_prefix("checkpoint-")?.strip_suffix(".json")?;
    let (version, millis) = stem.split_once('-')?;
    let version: u64 = version.parse().ok()?;
    let millis: i64 = millis.parse().ok()?;
    Some(CheckpointHandle {
        version,
        timestamp: DateTime::from_timestamp_millis(millis)?,
        location: path.display().to_string(),
    })
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(
        &self,
        blob: &[u8],
        meta: &CheckpointMetadata,
    ) -> FlotillaResult<CheckpointHandle> {
        let name = Self::file_name(meta);
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!(".{name}.tmp"));
        tokio::fs::write(&tmp, blob).await?;
        tokio::fs::rename(&tmp, &path).await?;
        info!(version = meta.version, trigger = %meta.trigger, path = %path.display(), "Checkpoint written");
        self.prune().await?;
        Ok(CheckpointHandle {
            version: meta.version,
            timestamp: meta.timestamp,
            location: path.display().to_string(),
        })
    }

    async fn load_latest(&self) -> FlotillaResult<Option<Vec<u8>>> {
        match self.entries().await?.pop() {
            Some((_, path)) => Ok(Some(tokio::fs::read(path).await?)),
            None => Ok(None),
        }
    }

    async fn load(&self, version: u64) -> FlotillaResult<Option<Vec<u8>>> {
        let found = self
            .entries()
            .await?
            .into_iter()
            .find(|(h, _)| h.version == version);
        match found {
            Some((_, path)) => Ok(Some(tokio::fs::read(path).await?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> FlotillaResult<Vec<CheckpointHandle>> {
        Ok(self.entries().await?.into_iter().map(|(h, _)| h).collect())
    }
}
