//! Persistence boundary
//!
//! The engine hands a [`SessionRecord`] to a [`SnapshotSink`] while recording and
//! once more when the session ends. Storage beyond that is the host's concern.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::metrics::{AdvancedMetrics, LapSummary, MetricsSnapshot};
use crate::session::SessionState;

/// Persisted view of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub snapshot: MetricsSnapshot,
    pub laps: Vec<LapSummary>,
    /// Present once the session has finished
    pub advanced: Option<AdvancedMetrics>,
}

#[async_trait]
pub trait SnapshotSink: Send + Sync + 'static {
    async fn persist(&self, record: &SessionRecord) -> Result<()>;
}

/// Writes `session-<uuid>.json` files into a directory, replacing on each save
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("session-{}.json", id))
    }

    pub async fn load(&self, id: Uuid) -> Result<SessionRecord> {
        let bytes = tokio::fs::read(self.path_for(id)).await?;
        serde_json::from_slice(&bytes).map_err(std::io::Error::from).map_err(Into::into)
    }
}

#[async_trait]
impl SnapshotSink for JsonFileSink {
    async fn persist(&self, record: &SessionRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let json = serde_json::to_vec_pretty(record).map_err(std::io::Error::from)?;
        let path = self.path_for(record.id);
        // Write-then-rename so a crash never leaves a half-written record; each
        // write stages under its own name so overlapping saves never share a file
        let staging = self
            .dir
            .join(format!(".session-{}.{}.json.tmp", record.id, Uuid::new_v4().simple()));
        tokio::fs::write(&staging, json).await?;
        tokio::fs::rename(&staging, &path).await?;

        debug!(session = %record.id, state = %record.state, path = %path.display(), "Session persisted");
        Ok(())
    }
}

/// Keeps every persisted record in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<SessionRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<SessionRecord> {
        self.records.lock().await.clone()
    }

    pub async fn latest(&self) -> Option<SessionRecord> {
        self.records.lock().await.last().cloned()
    }
}

#[async_trait]
impl SnapshotSink for MemorySink {
    async fn persist(&self, record: &SessionRecord) -> Result<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}
