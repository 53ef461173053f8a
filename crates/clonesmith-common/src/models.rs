use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a training job. Moves strictly forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether `self -> next` is a legal forward move.
    ///
    /// `Queued -> Failed` is allowed so a job that never got to run (spawn
    /// failure, restart before pickup) can still be closed out.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Health of a clone's trained artifacts. Independent of whether a worker
/// is currently serving it (`CloneRecord::is_running`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloneStatus {
    Training,
    Ready,
    Failed,
}

impl CloneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Training => "training",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CloneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloneStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "training" => Ok(Self::Training),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid clone status: {}", s)),
        }
    }
}

/// Runtime state of a worker process. Never persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-source aggregate of the knowledge chunks a parsing stage produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnowledgeSource {
    pub source: String,
    pub chunks: usize,
    /// Byte size of the source file; absent when the file could not be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub model_id: String,
    pub dataset_path: PathBuf,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub persona: String,
    /// Lookup-only reference to the clone trained by this job.
    #[serde(default)]
    pub clone_id: Option<String>,
    #[serde(default)]
    pub processed_dir: Option<PathBuf>,
    #[serde(default)]
    pub knowledge_file: Option<PathBuf>,
    #[serde(default)]
    pub rag_index_dir: Option<PathBuf>,
    #[serde(default)]
    pub adapter_dir: Option<PathBuf>,
    #[serde(default)]
    pub knowledge_count: usize,
    #[serde(default)]
    pub knowledge_sources: Vec<KnowledgeSource>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneRecord {
    pub id: String,
    pub name: String,
    pub status: CloneStatus,
    #[serde(default)]
    pub is_running: bool,
    /// Lookup-only reference to the job that trained this clone.
    #[serde(default)]
    pub job_id: Option<String>,
    pub api_key: String,
    pub model_id: String,
    pub persona: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub adapter_dir: Option<PathBuf>,
    #[serde(default)]
    pub rag_index_dir: Option<PathBuf>,
    #[serde(default)]
    pub knowledge_count: usize,
    #[serde(default)]
    pub knowledge_sources: Vec<KnowledgeSource>,
    /// Integration ids, `"<clone_id>:<platform>"`.
    #[serde(default)]
    pub integrations: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Messaging-platform configuration for one clone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntegrationConfig {
    pub platform: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl IntegrationConfig {
    pub fn integration_id(clone_id: &str, platform: &str) -> String {
        format!("{}:{}", clone_id, platform)
    }
}
