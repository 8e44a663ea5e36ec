//! Finished-session records and where they are kept.
//!
//! Records are only produced when the user chooses to save; an unsaved session is discarded.
//! Stores take the record as-is; encryption and schema migration belong to the host app.

use crate::error::{VoiceError, VoiceResult};
use crate::transcript::TranscriptEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default)]
    pub learnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub role: String,
    pub interview_type: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: u64,
    /// Finalized entries only.
    pub transcript: Vec<TranscriptEntry>,
    /// 0..=100.
    pub score: Option<u8>,
    pub feedback: Option<Feedback>,
}

impl SessionRecord {
    pub fn validate(&self) -> VoiceResult<()> {
        match self.score {
            Some(score) if score > 100 => Err(VoiceError::Persistence(format!(
                "score {} out of range 0..=100",
                score
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, record: &SessionRecord) -> VoiceResult<()>;

    async fn load(&self, session_id: Uuid) -> VoiceResult<Option<SessionRecord>>;
}

/// In-process store, handy for tests and demos.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<Uuid, SessionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn save(&self, record: &SessionRecord) -> VoiceResult<()> {
        record.validate()?;
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(record.session_id, record.clone());
        Ok(())
    }

    async fn load(&self, session_id: Uuid) -> VoiceResult<Option<SessionRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&session_id)
            .cloned())
    }
}

/// One pretty-printed JSON file per session under `dir`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", session_id))
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn save(&self, record: &SessionRecord) -> VoiceResult<()> {
        record.validate()?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(record.session_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        info!(path = %path.display(), "JsonFileStore: session saved");
        Ok(())
    }

    async fn load(&self, session_id: Uuid) -> VoiceResult<Option<SessionRecord>> {
        match tokio::fs::read(self.path_for(session_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
