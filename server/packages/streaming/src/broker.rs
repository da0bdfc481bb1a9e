//! Job-subscription broker: maps job ids to subscribed connections and the
//! job's last known status, and multicasts progress/terminal events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::events::{JobUpdate, ServerEvent, WireJobStatus};
use crate::transport::{ConnectionId, Transport};

const DEFAULT_TERMINAL_GRACE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long a job record outlives its terminal event, so late-joining
    /// subscribers can still observe the final state.
    pub terminal_grace: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            terminal_grace: DEFAULT_TERMINAL_GRACE,
        }
    }
}

/// Per-job state machine: `Subscribed → Processing → {Completed | Failed}`.
/// Terminal states accept no further transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Subscribed,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

struct JobRecord {
    state: JobState,
    /// Subscription order is kept for deterministic fan-out; per-subscriber
    /// ordering over time comes from publishing under the lock.
    subscribers: Vec<(ConnectionId, Arc<dyn Transport>)>,
    started_at: Instant,
    last_update: Instant,
    terminal: Option<JobUpdate>,
    eviction: Option<JoinHandle<()>>,
}

impl JobRecord {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            state: JobState::Subscribed,
            subscribers: Vec::new(),
            started_at: now,
            last_update: now,
            terminal: None,
            eviction: None,
        }
    }
}

#[derive(Clone)]
pub struct JobBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    config: BrokerConfig,
    jobs: Mutex<HashMap<String, JobRecord>>,
}

impl JobBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Idempotent. Creates the job in `Subscribed` state when unknown.
    /// Returns the retained terminal update, if the job already finished
    /// within the grace period, so the caller can relay it.
    pub async fn subscribe(&self, job_id: &str, transport: Arc<dyn Transport>) -> Option<JobUpdate> {
        let connection_id = transport.id();
        let mut jobs = self.inner.jobs.lock().await;
        let record = jobs
            .entry(job_id.to_string())
            .or_insert_with(JobRecord::new);
        if !record
            .subscribers
            .iter()
            .any(|(id, _)| *id == connection_id)
        {
            record.subscribers.push((connection_id, transport));
            tracing::debug!(
                job_id = job_id,
                connection = %connection_id,
                subscribers = record.subscribers.len(),
                "connection subscribed to job"
            );
        }
        record.terminal.clone()
    }

    /// Idempotent. Never cancels the underlying invocation.
    pub async fn unsubscribe(&self, job_id: &str, connection_id: ConnectionId) {
        let mut jobs = self.inner.jobs.lock().await;
        if let Some(record) = jobs.get_mut(job_id) {
            record.subscribers.retain(|(id, _)| *id != connection_id);
        }
    }

    /// Fan the update out to every current subscriber, in publish order per
    /// subscriber. A delivery failure to one subscriber never affects the
    /// others. Terminal updates arm the grace-period eviction task; events
    /// published after a terminal state are dropped and logged.
    pub async fn publish(&self, job_id: &str, update: JobUpdate) {
        let mut jobs = self.inner.jobs.lock().await;
        let record = jobs
            .entry(job_id.to_string())
            .or_insert_with(JobRecord::new);

        if record.state.is_terminal() {
            tracing::warn!(
                job_id = job_id,
                status = ?update.status,
                "dropping event published after terminal state"
            );
            return;
        }

        record.last_update = Instant::now();
        record.state = match update.status {
            WireJobStatus::Processing => JobState::Processing,
            WireJobStatus::Completed => JobState::Completed,
            WireJobStatus::Failed => JobState::Failed,
        };

        if update.is_terminal() {
            record.terminal = Some(update.clone());
            record.eviction = Some(self.spawn_eviction(job_id.to_string()));
            tracing::info!(
                job_id = job_id,
                status = ?update.status,
                age_ms = record.started_at.elapsed().as_millis() as u64,
                subscribers = record.subscribers.len(),
                "job reached terminal state"
            );
        }

        let event = ServerEvent::JobUpdate(update);
        for (connection_id, transport) in &record.subscribers {
            if !transport.is_alive() {
                tracing::debug!(
                    job_id = job_id,
                    connection = %connection_id,
                    "skipping delivery to dead transport"
                );
                continue;
            }
            if let Err(err) = transport.send(&event) {
                tracing::warn!(
                    job_id = job_id,
                    connection = %connection_id,
                    error = %err,
                    "failed to deliver job update"
                );
            }
        }
    }

    /// Drop every edge held by a closed connection. Job state is untouched.
    pub async fn on_connection_closed(&self, connection_id: ConnectionId) {
        let mut jobs = self.inner.jobs.lock().await;
        for record in jobs.values_mut() {
            record.subscribers.retain(|(id, _)| *id != connection_id);
        }
    }

    /// Last known state and retained terminal update, for late subscribers
    /// and the polling path.
    pub async fn job_snapshot(&self, job_id: &str) -> Option<(JobState, Option<JobUpdate>)> {
        let jobs = self.inner.jobs.lock().await;
        jobs.get(job_id)
            .map(|record| (record.state, record.terminal.clone()))
    }

    pub async fn job_count(&self) -> usize {
        self.inner.jobs.lock().await.len()
    }

    pub async fn subscriber_count(&self, job_id: &str) -> usize {
        let jobs = self.inner.jobs.lock().await;
        jobs.get(job_id)
            .map(|record| record.subscribers.len())
            .unwrap_or(0)
    }

    /// Remove jobs not updated within `ceiling`, regardless of status.
    /// Guards against jobs whose terminal event was never published.
    pub async fn sweep_stale(&self, ceiling: Duration) -> usize {
        let now = Instant::now();
        let mut jobs = self.inner.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|job_id, record| {
            let stale = now.duration_since(record.last_update) > ceiling;
            if stale {
                tracing::info!(
                    job_id = %job_id,
                    state = ?record.state,
                    "reclaiming stale job"
                );
                if let Some(handle) = record.eviction.take() {
                    handle.abort();
                }
            }
            !stale
        });
        before - jobs.len()
    }

    /// Abort all eviction timers and clear the job map.
    pub async fn shutdown(&self) {
        let mut jobs = self.inner.jobs.lock().await;
        for record in jobs.values_mut() {
            if let Some(handle) = record.eviction.take() {
                handle.abort();
            }
        }
        jobs.clear();
    }

    fn spawn_eviction(&self, job_id: String) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        let grace = self.inner.config.terminal_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            // The job may already be gone (stale sweep, shutdown); a missing
            // record means someone else cleaned up first.
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut jobs = inner.jobs.lock().await;
            if jobs.remove(&job_id).is_some() {
                tracing::debug!(job_id = %job_id, "evicted terminal job after grace period");
            }
        })
    }
}
