//! Shared domain types for clonesmith.
//!
//! Everything in here is plain data: the persisted records (`Job`,
//! `CloneRecord`, `IntegrationConfig`), their status rules, and the wire
//! protocol a worker process speaks back to the orchestrator. A worker
//! written in Rust only needs this crate.

pub mod models;
pub mod protocol;

pub use models::{
    CloneRecord, CloneStatus, IntegrationConfig, Job, JobStatus, KnowledgeSource, WorkerStatus,
};
pub use protocol::{ProtocolError, WorkerMessage};
