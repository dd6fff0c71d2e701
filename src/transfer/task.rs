use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::pool::SessionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Upload,
    Download,
    Relay,
}

/// One side of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Endpoint {
    /// The caller's reader or sink
    Local,
    Remote { session: String, path: String },
}

impl Endpoint {
    pub fn remote(key: &SessionKey, path: &str) -> Self {
        Endpoint::Remote {
            session: key.to_string(),
            path: path.to_string(),
        }
    }
}

/// Record of an in-flight operation; lives only as long as the call.
#[derive(Debug, Clone, Serialize)]
pub struct TransferTask {
    pub id: Uuid,
    pub kind: TransferKind,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    started: Instant,
}

impl TransferTask {
    pub fn new(kind: TransferKind, source: Endpoint, destination: Endpoint) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            source,
            destination,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn complete(self, bytes: u64) -> TransferReport {
        let elapsed_ms = self.elapsed().as_millis() as u64;
        TransferReport {
            task: self,
            bytes,
            elapsed_ms,
        }
    }
}

/// Returned by every successful transfer
#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    #[serde(flatten)]
    pub task: TransferTask,
    pub bytes: u64,
    pub elapsed_ms: u64,
}
