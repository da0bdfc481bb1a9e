//! Wire-level events exchanged with clients over a persistent channel.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use utoipa::ToSchema;

/// Frames the client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    SubscribeJob { job_id: String },
    UnsubscribeJob { job_id: String },
    HeartbeatResponse,
}

/// Frames the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    JobUpdate(JobUpdate),
    HeartbeatProbe,
    TimeoutNotice { message: String },
}

/// Job status as it appears on the wire. The broker-internal `subscribed`
/// state is never emitted: a job only becomes visible once it produces
/// events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum WireJobStatus {
    Processing,
    Completed,
    Failed,
}

impl WireJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub job_id: String,
    pub status: WireJobStatus,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Monotonically increasing byte counter on intermediate updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_received: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_length: Option<u64>,
    /// Total wall-clock duration in milliseconds, on completed updates.
    #[serde(rename = "duration", default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobUpdate {
    pub fn processing(
        job_id: impl Into<String>,
        message: Option<String>,
        data_received: Option<u64>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            status: WireJobStatus::Processing,
            timestamp: now_timestamp(),
            message,
            data_received,
            output_length: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn completed(job_id: impl Into<String>, output_length: u64, duration_ms: u64) -> Self {
        Self {
            job_id: job_id.into(),
            status: WireJobStatus::Completed,
            timestamp: now_timestamp(),
            message: None,
            data_received: None,
            output_length: Some(output_length),
            duration_ms: Some(duration_ms),
            error: None,
        }
    }

    pub fn failed(job_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: WireJobStatus::Failed,
            timestamp: now_timestamp(),
            message: None,
            data_received: None,
            output_length: None,
            duration_ms: None,
            error: Some(error.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

pub fn now_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_round_trip_tagged_json() {
        let parsed: ClientEvent =
            serde_json::from_str(r#"{"type":"subscribe-job","jobId":"job-1"}"#).unwrap();
        assert_eq!(
            parsed,
            ClientEvent::SubscribeJob {
                job_id: "job-1".to_string()
            }
        );

        let parsed: ClientEvent = serde_json::from_str(r#"{"type":"heartbeat-response"}"#).unwrap();
        assert_eq!(parsed, ClientEvent::HeartbeatResponse);
    }

    #[test]
    fn job_update_serializes_camel_case_and_omits_empty_fields() {
        let update = JobUpdate::processing("job-9", None, Some(1024));
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["jobId"], "job-9");
        assert_eq!(json["status"], "processing");
        assert_eq!(json["dataReceived"], 1024);
        assert!(json.get("outputLength").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobUpdate::completed("j", 10, 5).is_terminal());
        assert!(JobUpdate::failed("j", "boom").is_terminal());
        assert!(!JobUpdate::processing("j", None, None).is_terminal());
    }
}
