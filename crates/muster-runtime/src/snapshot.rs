use async_trait::async_trait;
use chrono::{DateTime, Utc};
use muster_core::{Agent, MusterError, MusterResult, Task};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persisted runtime state: the task table and the agent table, as ordered
/// lists of records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Task records ordered by submission time.
    pub tasks: Vec<Task>,
    /// Agent records ordered by identifier.
    pub agents: Vec<Agent>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    /// Creates a snapshot timestamped now.
    pub fn new(tasks: Vec<Task>, agents: Vec<Agent>) -> Self {
        Self {
            tasks,
            agents,
            taken_at: Utc::now(),
        }
    }
}

/// Durable storage for runtime snapshots.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persists a snapshot, replacing any previous one.
    async fn save(&self, snapshot: &Snapshot) -> MusterResult<()>;
    /// Loads the last persisted snapshot, `None` when none exists.
    async fn load(&self) -> MusterResult<Option<Snapshot>>;
}

/// File-based snapshot store: one pretty-printed JSON document on disk.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Creates a store writing to `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, snapshot: &Snapshot) -> MusterResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(&self.path, json).await?;
        tracing::info!(path = %self.path.display(), tasks = snapshot.tasks.len(), "Snapshot saved");
        Ok(())
    }

    async fn load(&self) -> MusterResult<Option<Snapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&self.path).await?;
        let snapshot: Snapshot = serde_json::from_str(&data)
            .map_err(|e| MusterError::Config(format!("failed to parse snapshot: {e}")))?;
        Ok(Some(snapshot))
    }
}
