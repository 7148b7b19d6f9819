//! Provisioning state
//!
//! One [`ProvisionState`] record per (stack, environment). The record holds
//! the operation lock, the status of the current or last run and every
//! applied resource. All writes go through [`StateStore::compare_and_swap`]
//! on the record's `revision`, which makes the lock safe across processes.
//!
//! [`FileStateStore`] keeps records under
//! `.stackflow/state/<stack>/<environment>.json`. Each read-compare-write
//! holds an advisory lock on `<environment>.lock` next to the record.

use crate::error::StateError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use stackflow_core::{AppliedResource, Outputs};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;

pub const STATE_VERSION: u32 = 1;
const STATE_DIR: &str = "state";
const MUTEX_WAIT: Duration = Duration::from_secs(5);
const MUTEX_POLL: Duration = Duration::from_millis(10);

/// (stack, environment) pair a state record belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    pub stack: String,
    pub environment: String,
}

impl StateKey {
    pub fn new(stack: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            environment: environment.into(),
        }
    }

    /// Environment a PR environment (`<env>-pr-<n>`) was derived from
    pub fn base_environment(&self) -> &str {
        match self.environment.rsplit_once("-pr-") {
            Some((base, pr))
                if !base.is_empty() && !pr.is_empty() && pr.bytes().all(|b| b.is_ascii_digit()) =>
            {
                base
            }
            _ => &self.environment,
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stack, self.environment)
    }
}

/// Status of the current or last operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStatus {
    #[default]
    Idle,
    Planning,
    Applying,
    Succeeded,
    Failed,
    Cancelled,
}

impl ProvisionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProvisionStatus::Succeeded | ProvisionStatus::Failed | ProvisionStatus::Cancelled
        )
    }

    /// Planning or Applying
    pub fn is_active(&self) -> bool {
        matches!(self, ProvisionStatus::Planning | ProvisionStatus::Applying)
    }
}

impl fmt::Display for ProvisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionStatus::Idle => write!(f, "idle"),
            ProvisionStatus::Planning => write!(f, "planning"),
            ProvisionStatus::Applying => write!(f, "applying"),
            ProvisionStatus::Succeeded => write!(f, "succeeded"),
            ProvisionStatus::Failed => write!(f, "failed"),
            ProvisionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Operation holding a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Provision,
    Deploy,
    Destroy,
    DestroyParent,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Provision => write!(f, "provision"),
            Operation::Deploy => write!(f, "deploy"),
            Operation::Destroy => write!(f, "destroy"),
            Operation::DestroyParent => write!(f, "destroy-parent"),
        }
    }
}

/// Lock information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique per acquisition
    pub id: String,
    pub owner: String,
    pub operation: Operation,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(owner: impl Into<String>, operation: Operation) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let owner = owner.into();
        let now = Utc::now();
        let id = format!(
            "{}-{}-{}-{}",
            owner,
            std::process::id(),
            now.timestamp_nanos_opt().unwrap_or_default(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            id,
            owner,
            operation,
            acquired_at: now,
        }
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.acquired_at);
        age.to_std().is_ok_and(|age| age >= ttl)
    }
}

/// Persisted record for one (stack, environment)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionState {
    /// State file version
    pub version: u32,
    pub stack: String,
    pub environment: String,
    pub status: ProvisionStatus,
    /// Incremented by every successful compare-and-swap
    pub revision: u64,
    pub lock: Option<LockInfo>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub last_applied_version: Option<String>,
    /// Applied resources indexed by name
    #[serde(default)]
    pub resources: BTreeMap<String, AppliedResource>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProvisionState {
    pub fn new(key: &StateKey) -> Self {
        Self {
            version: STATE_VERSION,
            stack: key.stack.clone(),
            environment: key.environment.clone(),
            status: ProvisionStatus::Idle,
            revision: 0,
            lock: None,
            cancel_requested: false,
            last_applied_version: None,
            resources: BTreeMap::new(),
            updated_at: None,
        }
    }

    pub fn key(&self) -> StateKey {
        StateKey::new(&self.stack, &self.environment)
    }

    /// An operation currently holds the record
    pub fn is_locked(&self) -> bool {
        self.lock.is_some() && self.status.is_active()
    }

    pub fn is_locked_by(&self, lock_id: &str) -> bool {
        self.is_locked() && self.lock.as_ref().is_some_and(|l| l.id == lock_id)
    }

    /// Outputs of every applied resource
    pub fn outputs(&self) -> BTreeMap<String, Outputs> {
        self.resources
            .iter()
            .map(|(name, r)| (name.clone(), r.outputs.clone()))
            .collect()
    }

    pub fn set_resource(&mut self, resource: AppliedResource) {
        self.resources.insert(resource.name.clone(), resource);
        self.updated_at = Some(Utc::now());
    }

    pub fn remove_resource(&mut self, name: &str) -> Option<AppliedResource> {
        let result = self.resources.remove(name);
        if result.is_some() {
            self.updated_at = Some(Utc::now());
        }
        result
    }
}

/// Persisted state store
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load a record. A missing record is an Idle record with revision 0.
    async fn load(&self, key: &StateKey) -> Result<ProvisionState, StateError>;

    /// Replace the record if its revision still equals `expected`.
    ///
    /// On success the stored record carries revision `expected + 1`.
    async fn compare_and_swap(
        &self,
        key: &StateKey,
        expected: u64,
        next: &ProvisionState,
    ) -> Result<bool, StateError>;

    /// Environments holding a record for `stack`, PR environments included
    async fn environments(&self, stack: &str) -> Result<Vec<String>, StateError>;
}

/// State store backed by JSON files in the project directory
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Store under `<project_dir>/state`, typically `.stackflow/state`
    pub fn new(project_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: project_dir.as_ref().join(STATE_DIR),
        }
    }

    fn state_path(&self, key: &StateKey) -> PathBuf {
        self.dir
            .join(&key.stack)
            .join(format!("{}.json", key.environment))
    }

    fn backup_path(&self, key: &StateKey) -> PathBuf {
        self.dir
            .join(&key.stack)
            .join(format!("{}.json.backup", key.environment))
    }

    fn mutex_path(&self, key: &StateKey) -> PathBuf {
        self.dir
            .join(&key.stack)
            .join(format!("{}.lock", key.environment))
    }

    async fn read(&self, key: &StateKey) -> Result<ProvisionState, StateError> {
        let path = self.state_path(key);
        if !fs::try_exists(&path)
            .await
            .map_err(|e| StateError::io(&path, e))?
        {
            tracing::debug!(%key, "State file not found, returning idle state");
            return Ok(ProvisionState::new(key));
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| StateError::io(&path, e))?;
        let state: ProvisionState =
            serde_json::from_str(&content).map_err(|source| StateError::Json {
                path: path.clone(),
                source,
            })?;

        if state.version > STATE_VERSION {
            return Err(StateError::UnsupportedVersion {
                found: state.version,
                supported: STATE_VERSION,
            });
        }
        Ok(state)
    }

    async fn write(&self, key: &StateKey, state: &ProvisionState) -> Result<(), StateError> {
        let path = self.state_path(key);
        let temp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(state).map_err(|source| StateError::Json {
            path: path.clone(),
            source,
        })?;
        fs::write(&temp, content)
            .await
            .map_err(|e| StateError::io(&temp, e))?;

        if fs::try_exists(&path).await.unwrap_or(false) {
            let backup = self.backup_path(key);
            fs::copy(&path, &backup)
                .await
                .map_err(|e| StateError::io(&backup, e))?;
        }
        fs::rename(&temp, &path)
            .await
            .map_err(|e| StateError::io(&path, e))?;
        Ok(())
    }

    /// Exclusive access to one record's file for a read-compare-write
    ///
    /// The lock file itself is never removed. The OS releases the lock when
    /// the holder exits, so a crashed process cannot leave the record blocked.
    async fn acquire_mutex(&self, key: &StateKey) -> Result<FileMutex, StateError> {
        let path = self.mutex_path(key);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StateError::io(&path, e))?;

        let started = tokio::time::Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(FileMutex { file }),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if started.elapsed() >= MUTEX_WAIT {
                        return Err(StateError::Busy(path));
                    }
                    tokio::time::sleep(MUTEX_POLL).await;
                }
                Err(e) => return Err(StateError::io(&path, e)),
            }
        }
    }
}

/// Releases the advisory lock when dropped
struct FileMutex {
    file: std::fs::File,
}

impl Drop for FileMutex {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, key: &StateKey) -> Result<ProvisionState, StateError> {
        self.read(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &StateKey,
        expected: u64,
        next: &ProvisionState,
    ) -> Result<bool, StateError> {
        let dir = self.dir.join(&key.stack);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StateError::io(&dir, e))?;

        let _mutex = self.acquire_mutex(key).await?;
        let current = self.read(key).await?;
        if current.revision != expected {
            tracing::debug!(
                %key,
                expected,
                found = current.revision,
                "State revision mismatch"
            );
            return Ok(false);
        }

        let mut stored = next.clone();
        stored.version = STATE_VERSION;
        stored.revision = expected + 1;
        stored.updated_at = Some(Utc::now());
        self.write(key, &stored).await?;

        tracing::debug!(%key, revision = stored.revision, status = %stored.status, "Saved state");
        Ok(true)
    }

    async fn environments(&self, stack: &str) -> Result<Vec<String>, StateError> {
        let dir = self.dir.join(stack);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StateError::io(&dir, e)),
        };

        let mut environments = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StateError::io(&dir, e))?
        {
            let name = entry.file_name();
            // Backups and temp files end in `.backup` and `.tmp`
            if let Some(environment) = name.to_str().and_then(|n| n.strip_suffix(".json")) {
                environments.push(environment.to_string());
            }
        }
        environments.sort();
        Ok(environments)
    }
}

/// In-process state store
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<HashMap<StateKey, ProvisionState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &StateKey) -> Result<ProvisionState, StateError> {
        let records = self.records.lock().await;
        Ok(records
            .get(key)
            .cloned()
            .unwrap_or_else(|| ProvisionState::new(key)))
    }

    async fn compare_and_swap(
        &self,
        key: &StateKey,
        expected: u64,
        next: &ProvisionState,
    ) -> Result<bool, StateError> {
        let mut records = self.records.lock().await;
        let current = records.get(key).map(|s| s.revision).unwrap_or(0);
        if current != expected {
            return Ok(false);
        }
        let mut stored = next.clone();
        stored.revision = expected + 1;
        stored.updated_at = Some(Utc::now());
        records.insert(key.clone(), stored);
        Ok(true)
    }

    async fn environments(&self, stack: &str) -> Result<Vec<String>, StateError> {
        let records = self.records.lock().await;
        let mut environments: Vec<String> = records
            .keys()
            .filter(|k| k.stack == stack)
            .map(|k| k.environment.clone())
            .collect();
        environments.sort();
        Ok(environments)
    }
}
