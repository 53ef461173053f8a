//! Typed error hierarchy for clonesmith.
//!
//! One enum per subsystem:
//! - `StoreError`: record store lookups, validation and status rules
//! - `IntegrationError`: integration store validation and file access
//! - `PipelineError`: training request validation and stage failures
//! - `WorkerError`: worker spawn, liveness and orphan handling

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the job/clone record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: clonesmith_common::JobStatus,
        to: clonesmith_common::JobStatus,
    },

    #[error("Invalid record: {0}")]
    Validation(String),

    #[error("Failed to persist {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Record store is not running")]
    Unavailable,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn job_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "Job",
            id: id.to_string(),
        }
    }

    pub fn clone_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "Clone",
            id: id.to_string(),
        }
    }
}

/// Errors from the integration store.
#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("Invalid integration: {0}")]
    Validation(String),

    #[error("Failed to access integrations file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Integrations file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from the training pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid training request: {0}")]
    Validation(String),

    #[error("Failed to start stage '{stage}': {source}")]
    StageSpawn {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{}", stage_failed_message(stage, *exit_code))]
    StageFailed {
        stage: &'static str,
        exit_code: Option<i32>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn stage_failed_message(stage: &str, exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("Stage '{}' exited with code {}", stage, code),
        None => format!("Stage '{}' was terminated by a signal", stage),
    }
}

/// Errors from the worker manager.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Clone {0} not found")]
    CloneNotFound(String),

    #[error("Clone {0} is still training")]
    CloneNotTrained(String),

    #[error("Worker for clone {0} is already running")]
    AlreadyRunning(String),

    #[error("No worker is registered for clone {0}")]
    NotRegistered(String),

    #[error("Failed to spawn worker for clone {clone_id}: {source}")]
    Spawn {
        clone_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker for clone {clone_id} missed heartbeats for {elapsed_secs}s")]
    HeartbeatTimeout { clone_id: String, elapsed_secs: u64 },

    #[error("Orphaned worker pid {pid} for clone {clone_id} could not be terminated: {message}")]
    Orphan {
        clone_id: String,
        pid: u32,
        message: String,
    },

    #[error("Breadcrumb error: {0}")]
    Breadcrumb(#[source] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Integration(#[from] IntegrationError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
