//! Persistence collaborator for job outcomes.
//!
//! The store is the single source of truth for the polling path; the broker
//! is a best-effort low-latency overlay on top of it. The trait keeps the
//! seam narrow so a database-backed implementation can slot in without the
//! handlers changing.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use scribe_streaming::events::now_timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Processing,
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub job_id: String,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub created_at: String,
    pub updated_at: String,
}

pub trait JobStore: Send + Sync + fmt::Debug {
    fn create(&self, job_id: &str) -> DocumentRecord;

    fn update(
        &self,
        job_id: &str,
        status: RecordStatus,
        output: Option<String>,
        error: Option<String>,
        duration_ms: Option<u64>,
    );

    fn get(&self, job_id: &str) -> Option<DocumentRecord>;
}

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    records: RwLock<HashMap<String, DocumentRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for InMemoryJobStore {
    fn create(&self, job_id: &str) -> DocumentRecord {
        let now = now_timestamp();
        let record = DocumentRecord {
            job_id: job_id.to_string(),
            status: RecordStatus::Processing,
            output: None,
            error: None,
            duration_ms: None,
            created_at: now.clone(),
            updated_at: now,
        };
        let mut records = self.records.write().expect("store lock poisoned");
        records.insert(job_id.to_string(), record.clone());
        record
    }

    fn update(
        &self,
        job_id: &str,
        status: RecordStatus,
        output: Option<String>,
        error: Option<String>,
        duration_ms: Option<u64>,
    ) {
        let mut records = self.records.write().expect("store lock poisoned");
        if let Some(record) = records.get_mut(job_id) {
            record.status = status;
            if output.is_some() {
                record.output = output;
            }
            if error.is_some() {
                record.error = error;
            }
            if duration_ms.is_some() {
                record.duration_ms = duration_ms;
            }
            record.updated_at = now_timestamp();
        } else {
            tracing::warn!(job_id = job_id, "update for unknown job record dropped");
        }
    }

    fn get(&self, job_id: &str) -> Option<DocumentRecord> {
        let records = self.records.read().expect("store lock poisoned");
        records.get(job_id).cloned()
    }
}
