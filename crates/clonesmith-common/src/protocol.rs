//! Worker liveness protocol.
//!
//! A worker process is configured entirely through its environment (see
//! [`env`]) and reports back with exactly three message kinds:
//!
//! | Variant     | When                         | Effect on the orchestrator       |
//! |-------------|------------------------------|----------------------------------|
//! | `Ready`     | once, after startup          | `starting -> running`            |
//! | `Heartbeat` | periodically                 | refreshes liveness               |
//! | `Error`     | terminal fault               | worker `error`, clone `failed`   |
//!
//! Messages are JSON objects tagged by `type`, e.g.
//! `{"type":"heartbeat","clone_id":"c1","ts":1718000000000}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable names a worker reads at spawn time.
pub mod env {
    pub const CLONE_ID: &str = "CLONE_ID";
    pub const MODEL_ID: &str = "CLONE_MODEL_ID";
    pub const ADAPTER_DIR: &str = "CLONE_ADAPTER_DIR";
    pub const RAG_INDEX_DIR: &str = "CLONE_RAG_INDEX_DIR";
    pub const PERSONA: &str = "CLONE_PERSONA";
    pub const SYSTEM_PROMPT: &str = "CLONE_SYSTEM_PROMPT";
    /// JSON array of `IntegrationConfig`.
    pub const INTEGRATIONS: &str = "CLONE_INTEGRATIONS";
    pub const CALLBACK_URL: &str = "CLONE_CALLBACK_URL";
    pub const API_KEY: &str = "CLONE_API_KEY";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready {
        clone_id: String,
    },
    Heartbeat {
        clone_id: String,
        /// Worker-side send time, unix milliseconds.
        #[serde(with = "chrono::serde::ts_milliseconds")]
        ts: DateTime<Utc>,
    },
    Error {
        clone_id: String,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed worker message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Worker message is missing a clone id")]
    MissingCloneId,
}

impl WorkerMessage {
    /// Decode and validate a raw message body.
    pub fn parse(raw: &[u8]) -> Result<Self, ProtocolError> {
        let message: WorkerMessage = serde_json::from_slice(raw)?;
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.clone_id().trim().is_empty() {
            return Err(ProtocolError::MissingCloneId);
        }
        Ok(())
    }

    pub fn clone_id(&self) -> &str {
        match self {
            Self::Ready { clone_id }
            | Self::Heartbeat { clone_id, .. }
            | Self::Error { clone_id, .. } => clone_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_heartbeat() {
        let raw = br#"{"type":"heartbeat","clone_id":"c1","ts":1718000000000}"#;
        let msg = WorkerMessage::parse(raw).unwrap();
        match msg {
            WorkerMessage::Heartbeat { clone_id, ts } => {
                assert_eq!(clone_id, "c1");
                assert_eq!(ts.timestamp_millis(), 1_718_000_000_000);
            }
            other => panic!("Expected Heartbeat, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_ready_and_error() {
        let ready = WorkerMessage::parse(br#"{"type":"ready","clone_id":"c2"}"#).unwrap();
        assert_eq!(ready.kind(), "ready");
        assert_eq!(ready.clone_id(), "c2");

        let error =
            WorkerMessage::parse(br#"{"type":"error","clone_id":"c2","message":"bot token revoked"}"#)
                .unwrap();
        assert!(matches!(error, WorkerMessage::Error { ref message, .. } if message == "bot token revoked"));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = WorkerMessage::parse(br#"{"type":"status","clone_id":"c1"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_blank_clone_id_is_rejected() {
        let err = WorkerMessage::parse(br#"{"type":"ready","clone_id":"  "}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingCloneId));
    }

    #[test]
    fn test_serialized_tag() {
        let json = serde_json::to_string(&WorkerMessage::Ready {
            clone_id: "c9".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"ready""#));
        assert!(json.contains(r#""clone_id":"c9""#));
    }
}
