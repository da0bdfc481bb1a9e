//! HTTP surface: job submission, polling fallback, health, and the
//! WebSocket upgrade route.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use utoipa::ToSchema;

use scribe_error::ScribeError;
use scribe_invoker::{InvokeError, Invoker, InvokerEvent};
use scribe_streaming::{
    BrokerConfig, CleanupConfig, CleanupScheduler, ConnectionRegistry, JobBroker, JobUpdate,
    RegistryConfig,
};

use crate::store::{InMemoryJobStore, JobStore, RecordStatus};
use crate::ws::ws_handler;

pub const API_PREFIX: &str = "/v1";
const MAX_PROMPT_BYTES: usize = 8 * 1024;
const INVOKER_EVENT_BUFFER: usize = 64;

static JOB_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentRequest {
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentResponse {
    pub job_id: String,
    pub status: RecordStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub struct AppState {
    pub registry: ConnectionRegistry,
    pub broker: JobBroker,
    pub store: Arc<dyn JobStore>,
    pub invoker: Invoker,
    scheduler: CleanupScheduler,
    job_nonce: u64,
}

impl AppState {
    pub fn new(invoker: Invoker) -> Arc<Self> {
        Self::with_configs(
            invoker,
            RegistryConfig::default(),
            BrokerConfig::default(),
            CleanupConfig::default(),
        )
    }

    pub fn with_configs(
        invoker: Invoker,
        registry_config: RegistryConfig,
        broker_config: BrokerConfig,
        cleanup_config: CleanupConfig,
    ) -> Arc<Self> {
        let broker = JobBroker::new(broker_config);
        let registry = ConnectionRegistry::new(registry_config, broker.clone());
        let scheduler = CleanupScheduler::start(cleanup_config, registry.clone(), broker.clone());
        let job_nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Arc::new(Self {
            registry,
            broker,
            store: Arc::new(InMemoryJobStore::new()),
            invoker,
            scheduler,
            job_nonce,
        })
    }

    fn issue_job_id(&self) -> String {
        let n = JOB_ID_COUNTER.fetch_add(1, Ordering::SeqCst);
        format!("job-{:x}-{}", self.job_nonce, n)
    }

    /// Cancel every timer and clear all in-memory state. Volatile by
    /// design: in-flight subscriptions do not survive a restart.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        self.registry.shutdown().await;
        self.broker.shutdown().await;
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .route("/health", get(get_health))
        .route("/documents", post(create_document))
        .route("/documents/:job_id", get(get_document))
        .route("/ws", get(ws_handler))
        .with_state(state);

    Router::new()
        .nest(API_PREFIX, v1)
        .layer(TraceLayer::new_for_http())
}

/// ProblemDetails-producing wrapper so handlers can use `?`.
pub struct ApiError(pub ScribeError);

impl From<ScribeError> for ApiError {
    fn from(err: ScribeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem = self.0.to_problem_details();
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn create_document(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateDocumentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let prompt = request.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(ScribeError::InvalidRequest {
            message: "prompt must not be empty".to_string(),
        }
        .into());
    }
    if prompt.len() > MAX_PROMPT_BYTES {
        return Err(ScribeError::InvalidRequest {
            message: format!("prompt exceeds {MAX_PROMPT_BYTES} bytes"),
        }
        .into());
    }

    let job_id = state.issue_job_id();
    state.store.create(&job_id);
    tracing::info!(job_id = %job_id, prompt_bytes = prompt.len(), "document generation accepted");

    tokio::spawn(run_generation(state.clone(), job_id.clone(), prompt));

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateDocumentResponse {
            job_id,
            status: RecordStatus::Processing,
        }),
    ))
}

async fn get_document(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.store.get(&job_id) {
        Some(record) => Ok(Json(record)),
        None => Err(ScribeError::JobNotFound { job_id }.into()),
    }
}

/// Drives one invocation: relays invoker events into the broker, publishes
/// the terminal event, then persists the outcome. The store write happens
/// after `publish` returns, never inside the broker's critical section.
async fn run_generation(state: Arc<AppState>, job_id: String, prompt: String) {
    let (events_tx, mut events_rx) = mpsc::channel::<InvokerEvent>(INVOKER_EVENT_BUFFER);

    let forwarder = {
        let broker = state.broker.clone();
        let job_id = job_id.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let update = match event {
                    InvokerEvent::AttemptStarted { attempt } => JobUpdate::processing(
                        &job_id,
                        Some(format!("generation attempt {attempt} started")),
                        None,
                    ),
                    InvokerEvent::Progress { bytes_received } => {
                        JobUpdate::processing(&job_id, None, Some(bytes_received))
                    }
                };
                broker.publish(&job_id, update).await;
            }
        })
    };

    let result = state.invoker.run(&prompt, events_tx).await;
    // The event channel is closed once run returns; draining the forwarder
    // keeps all progress updates ahead of the terminal event.
    let _ = forwarder.await;

    match result {
        Ok(generated) => {
            let duration_ms = generated.duration.as_millis() as u64;
            state
                .broker
                .publish(
                    &job_id,
                    JobUpdate::completed(&job_id, generated.output.len() as u64, duration_ms),
                )
                .await;
            state.store.update(
                &job_id,
                RecordStatus::Completed,
                Some(generated.output),
                None,
                Some(duration_ms),
            );
        }
        Err(err) => {
            let summary = map_invoke_error(err).summary();
            state
                .broker
                .publish(&job_id, JobUpdate::failed(&job_id, summary.clone()))
                .await;
            state
                .store
                .update(&job_id, RecordStatus::Failed, None, Some(summary), None);
        }
    }
}

/// Folds an exhausted invocation into the shared error taxonomy so the
/// terminal job update carries the same wording as the HTTP surface.
fn map_invoke_error(err: InvokeError) -> ScribeError {
    match err {
        InvokeError::Timeout { after_ms } => ScribeError::Timeout {
            message: Some(format!("generation timed out after {after_ms}ms")),
        },
        InvokeError::SpawnFailed { program, error } => ScribeError::SpawnFailed {
            message: format!("`{program}`: {error}"),
        },
        InvokeError::ExitedNonZero { exit_code, stderr } => ScribeError::ProcessFailed {
            exit_code,
            stderr: (!stderr.is_empty()).then_some(stderr),
        },
        InvokeError::OutputTooLarge { limit_bytes } => {
            ScribeError::OutputTooLarge { limit_bytes }
        }
        InvokeError::Io(err) => ScribeError::StreamError {
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;
    use tower::ServiceExt;

    use scribe_invoker::InvokerConfig;

    fn shell_state(script: &str, max_retries: u32) -> Arc<AppState> {
        AppState::new(Invoker::new(InvokerConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
            timeout: Duration::from_secs(5),
            term_grace: Duration::from_millis(200),
            max_retries,
            retry_base_delay: Duration::from_millis(10),
            max_output_bytes: 1024 * 1024,
        }))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn post_document(router: &Router, prompt: &str) -> (StatusCode, Value) {
        let response = router
            .clone()
            .oneshot(
                Request::post("/v1/documents")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "prompt": prompt }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        (status, body_json(response).await)
    }

    async fn poll_until_terminal(router: &Router, job_id: &str) -> Value {
        for _ in 0..100 {
            let response = router
                .clone()
                .oneshot(
                    Request::get(format!("/v1/documents/{job_id}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            let body = body_json(response).await;
            if body["status"] != "processing" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn health_reports_version() {
        let state = shell_state("cat", 0);
        let router = build_router(state.clone());
        let response = router
            .oneshot(Request::get("/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        state.shutdown().await;
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_with_problem_details() {
        let state = shell_state("cat", 0);
        let router = build_router(state.clone());
        let (status, body) = post_document(&router, "   ").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "urn:scribe:error:invalid_request");
        state.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let state = shell_state("cat", 0);
        let router = build_router(state.clone());
        let response = router
            .oneshot(
                Request::get("/v1/documents/job-nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        state.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn generation_completes_and_is_pollable() {
        let state = shell_state("cat", 0);
        let router = build_router(state.clone());

        let (status, body) = post_document(&router, "write me a document").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "processing");
        let job_id = body["jobId"].as_str().unwrap().to_string();

        let record = poll_until_terminal(&router, &job_id).await;
        assert_eq!(record["status"], "completed");
        assert_eq!(record["output"], "write me a document");
        assert!(record["durationMs"].is_u64());
        state.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exhausted_retries_surface_as_failed_record() {
        let state = shell_state("exit 7", 1);
        let router = build_router(state.clone());

        let (_, body) = post_document(&router, "doomed prompt").await;
        let job_id = body["jobId"].as_str().unwrap().to_string();

        let record = poll_until_terminal(&router, &job_id).await;
        assert_eq!(record["status"], "failed");
        assert!(record["error"]
            .as_str()
            .unwrap()
            .contains("exit code 7"));
        state.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminal_event_is_published_exactly_once() {
        use scribe_streaming::testing::RecordingTransport;
        use scribe_streaming::{ServerEvent, Transport, WireJobStatus};

        let state = shell_state("exit 1", 2);
        let router = build_router(state.clone());

        let (_, body) = post_document(&router, "prompt").await;
        let job_id = body["jobId"].as_str().unwrap().to_string();

        let transport = RecordingTransport::new();
        // Relay the retained terminal state the way the ws path does, in
        // case the job finished before we subscribed.
        if let Some(update) = state.broker.subscribe(&job_id, transport.clone()).await {
            let _ = transport.send(&ServerEvent::JobUpdate(update));
        }
        poll_until_terminal(&router, &job_id).await;
        // Let any stray publishes land before counting.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let terminal: Vec<_> = transport
            .job_updates()
            .into_iter()
            .filter(|update| update.is_terminal())
            .collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].status, WireJobStatus::Failed);
        state.shutdown().await;
    }
}
