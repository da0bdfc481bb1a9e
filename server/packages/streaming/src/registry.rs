//! Connection registry: admission, liveness, and forced eviction for every
//! persistent client channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::broker::JobBroker;
use crate::events::ServerEvent;
use crate::rate_limit::RateLimiter;
use crate::transport::{ConnectionId, Transport};

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_INACTIVITY_CEILING: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_MAX_CONNECTIONS_PER_SUBJECT: usize = 10;
const DEFAULT_IP_CONNECTION_LIMIT: u32 = 10;
const DEFAULT_IP_CONNECTION_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Liveness probe cadence. A probe left unanswered by the next tick
    /// counts as a failed heartbeat.
    pub heartbeat_interval: Duration,
    /// Session ceiling: a connection with no inbound activity for this long
    /// is force-disconnected.
    pub inactivity_ceiling: Duration,
    /// Concurrent connections allowed per subject (identity, or remote
    /// address for anonymous clients).
    pub max_connections_per_subject: usize,
    /// New-connection rate limit per remote address.
    pub ip_connection_limit: u32,
    pub ip_connection_window: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            inactivity_ceiling: DEFAULT_INACTIVITY_CEILING,
            max_connections_per_subject: DEFAULT_MAX_CONNECTIONS_PER_SUBJECT,
            ip_connection_limit: DEFAULT_IP_CONNECTION_LIMIT,
            ip_connection_window: DEFAULT_IP_CONNECTION_WINDOW,
        }
    }
}

/// Typed admission refusal, returned (not thrown) so the caller can close
/// the raw channel cleanly. No connection state exists when this comes back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionRejected {
    #[error("too many concurrent connections for {subject}")]
    TooManyConnections { subject: String },
    #[error("connection rate exceeded for {remote_addr}")]
    RateLimited { remote_addr: String },
}

struct ConnectionEntry {
    transport: Arc<dyn Transport>,
    subject: String,
    remote_addr: String,
    last_activity: Instant,
    probe_outstanding: bool,
    heartbeat_task: Option<JoinHandle<()>>,
    inactivity_task: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: RegistryConfig,
    broker: JobBroker,
    connections: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
    admission_limiter: RateLimiter,
    event_limiter: RateLimiter,
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig, broker: JobBroker) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                broker,
                connections: Mutex::new(HashMap::new()),
                admission_limiter: RateLimiter::new(),
                event_limiter: RateLimiter::new(),
            }),
        }
    }

    /// Admit a connection, start its heartbeat and inactivity timers, and
    /// return its id. Rejection leaves no trace in the registry.
    pub async fn accept(
        &self,
        transport: Arc<dyn Transport>,
        identity: Option<String>,
        remote_addr: &str,
    ) -> Result<ConnectionId, AdmissionRejected> {
        let config = &self.inner.config;
        if !self.inner.admission_limiter.try_consume(
            remote_addr,
            config.ip_connection_limit,
            config.ip_connection_window,
        ) {
            tracing::warn!(remote_addr = remote_addr, "connection rate limit exceeded");
            return Err(AdmissionRejected::RateLimited {
                remote_addr: remote_addr.to_string(),
            });
        }

        let connection_id = transport.id();
        let subject = identity.unwrap_or_else(|| remote_addr.to_string());
        {
            let mut connections = self.inner.connections.lock().await;
            let concurrent = connections
                .values()
                .filter(|entry| entry.subject == subject)
                .count();
            if concurrent >= config.max_connections_per_subject {
                tracing::warn!(
                    subject = %subject,
                    concurrent = concurrent,
                    "concurrent connection ceiling reached"
                );
                return Err(AdmissionRejected::TooManyConnections { subject });
            }

            connections.insert(
                connection_id,
                ConnectionEntry {
                    transport,
                    subject: subject.clone(),
                    remote_addr: remote_addr.to_string(),
                    last_activity: Instant::now(),
                    probe_outstanding: false,
                    heartbeat_task: None,
                    inactivity_task: None,
                },
            );
        }

        let heartbeat = spawn_heartbeat(&self.inner, connection_id);
        let inactivity = spawn_inactivity_watch(&self.inner, connection_id);
        {
            let mut connections = self.inner.connections.lock().await;
            match connections.get_mut(&connection_id) {
                Some(entry) => {
                    entry.heartbeat_task = Some(heartbeat);
                    entry.inactivity_task = Some(inactivity);
                }
                None => {
                    // Evicted between the two lock windows; the timers must
                    // not outlive the record.
                    heartbeat.abort();
                    inactivity.abort();
                }
            }
        }

        tracing::info!(
            connection = %connection_id,
            subject = %subject,
            remote_addr = remote_addr,
            "connection accepted"
        );
        Ok(connection_id)
    }

    /// Any inbound frame (heartbeat responses included) lands here.
    pub async fn record_activity(&self, connection_id: ConnectionId) {
        let mut connections = self.inner.connections.lock().await;
        if let Some(entry) = connections.get_mut(&connection_id) {
            entry.last_activity = Instant::now();
            entry.probe_outstanding = false;
        }
    }

    /// Per-event throttle keyed by (connection, event). Violations are
    /// logged and the event dropped; the connection is never evicted for
    /// this alone.
    pub async fn check_event_rate(
        &self,
        connection_id: ConnectionId,
        event_name: &str,
        limit: u32,
        window: Duration,
    ) -> bool {
        let key = format!("{connection_id}:{event_name}");
        let allowed = self.inner.event_limiter.try_consume(&key, limit, window);
        if !allowed {
            tracing::warn!(
                connection = %connection_id,
                event = event_name,
                limit = limit,
                "event rate limit exceeded, dropping event"
            );
        }
        allowed
    }

    /// Idempotent forced removal: cancels both timers, tells the broker to
    /// drop the connection's subscriptions, closes the transport. Safe to
    /// race from multiple paths; only the first call has effect.
    pub async fn evict(&self, connection_id: ConnectionId, reason: &str) {
        self.inner.evict(connection_id, reason).await;
    }

    pub async fn is_connected(&self, connection_id: ConnectionId) -> bool {
        self.inner
            .connections
            .lock()
            .await
            .contains_key(&connection_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    /// Backstop used by the cleanup scheduler: evict anything inactive
    /// beyond `hard_ceiling` even if its own timer was somehow lost.
    pub async fn sweep_inactive(&self, hard_ceiling: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<ConnectionId> = {
            let connections = self.inner.connections.lock().await;
            connections
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.last_activity) > hard_ceiling)
                .map(|(id, _)| *id)
                .collect()
        };
        let count = stale.len();
        for connection_id in stale {
            self.inner.evict(connection_id, "inactivity_sweep").await;
        }
        count
    }

    pub fn event_limiter(&self) -> &RateLimiter {
        &self.inner.event_limiter
    }

    pub fn admission_limiter(&self) -> &RateLimiter {
        &self.inner.admission_limiter
    }

    /// Evict every connection and cancel all timers.
    pub async fn shutdown(&self) {
        let ids: Vec<ConnectionId> = {
            let connections = self.inner.connections.lock().await;
            connections.keys().copied().collect()
        };
        for connection_id in ids {
            self.inner.evict(connection_id, "server_shutdown").await;
        }
    }
}

impl RegistryInner {
    async fn evict(&self, connection_id: ConnectionId, reason: &str) {
        let entry = {
            let mut connections = self.connections.lock().await;
            connections.remove(&connection_id)
        };
        let Some(mut entry) = entry else {
            // Somebody else already cleaned up; nothing outstanding remains.
            return;
        };

        self.broker.on_connection_closed(connection_id).await;
        entry.transport.disconnect(reason);
        tracing::info!(
            connection = %connection_id,
            subject = %entry.subject,
            remote_addr = %entry.remote_addr,
            reason = reason,
            "connection evicted"
        );

        // Abort last: a timer task evicting its own connection dies right
        // here, with every side effect above already applied.
        if let Some(task) = entry.heartbeat_task.take() {
            task.abort();
        }
        if let Some(task) = entry.inactivity_task.take() {
            task.abort();
        }
    }
}

enum HeartbeatTick {
    Gone,
    Missed,
    Probe(Arc<dyn Transport>),
}

fn spawn_heartbeat(inner: &Arc<RegistryInner>, connection_id: ConnectionId) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let interval = inner.config.heartbeat_interval;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else {
                break;
            };

            let tick = {
                let mut connections = inner.connections.lock().await;
                match connections.get_mut(&connection_id) {
                    None => HeartbeatTick::Gone,
                    Some(entry) if entry.probe_outstanding => HeartbeatTick::Missed,
                    Some(entry) => {
                        entry.probe_outstanding = true;
                        HeartbeatTick::Probe(entry.transport.clone())
                    }
                }
            };

            match tick {
                HeartbeatTick::Gone => break,
                HeartbeatTick::Missed => {
                    tracing::info!(connection = %connection_id, "heartbeat probe unanswered");
                    inner.evict(connection_id, "heartbeat_timeout").await;
                    break;
                }
                HeartbeatTick::Probe(transport) => {
                    if transport.send(&ServerEvent::HeartbeatProbe).is_err() {
                        inner.evict(connection_id, "transport_closed").await;
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_inactivity_watch(
    inner: &Arc<RegistryInner>,
    connection_id: ConnectionId,
) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let ceiling = inner.config.inactivity_ceiling;
    tokio::spawn(async move {
        loop {
            let deadline = {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let connections = inner.connections.lock().await;
                match connections.get(&connection_id) {
                    Some(entry) => entry.last_activity + ceiling,
                    None => return,
                }
            };
            tokio::time::sleep_until(deadline).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            let expired = {
                let connections = inner.connections.lock().await;
                match connections.get(&connection_id) {
                    // Activity may have advanced while we slept; loop and
                    // wait out the new deadline.
                    Some(entry) if entry.last_activity + ceiling <= Instant::now() => {
                        Some(entry.transport.clone())
                    }
                    Some(_) => None,
                    None => return,
                }
            };

            if let Some(transport) = expired {
                let _ = transport.send(&ServerEvent::TimeoutNotice {
                    message: "disconnecting due to inactivity".to_string(),
                });
                inner.evict(connection_id, "inactivity_timeout").await;
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::testing::RecordingTransport;

    fn test_config() -> RegistryConfig {
        RegistryConfig {
            heartbeat_interval: Duration::from_millis(40),
            inactivity_ceiling: Duration::from_secs(60),
            max_connections_per_subject: 4,
            ip_connection_limit: 100,
            ip_connection_window: Duration::from_secs(60),
        }
    }

    fn registry(config: RegistryConfig) -> (ConnectionRegistry, JobBroker) {
        let broker = JobBroker::new(BrokerConfig::default());
        (ConnectionRegistry::new(config, broker.clone()), broker)
    }

    #[tokio::test]
    async fn accept_registers_connection() {
        let (registry, _) = registry(test_config());
        let transport = RecordingTransport::new();
        let id = registry
            .accept(transport.clone(), None, "10.0.0.1")
            .await
            .unwrap();
        assert_eq!(id, transport.id());
        assert!(registry.is_connected(id).await);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_connection_ceiling_rejects_typed() {
        let config = RegistryConfig {
            max_connections_per_subject: 1,
            ..test_config()
        };
        let (registry, _) = registry(config);
        let first = RecordingTransport::new();
        registry
            .accept(first, Some("alice".to_string()), "10.0.0.1")
            .await
            .unwrap();

        let second = RecordingTransport::new();
        let err = registry
            .accept(second.clone(), Some("alice".to_string()), "10.0.0.2")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AdmissionRejected::TooManyConnections {
                subject: "alice".to_string()
            }
        );
        assert!(!registry.is_connected(second.id()).await);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn per_ip_connection_rate_is_limited() {
        let config = RegistryConfig {
            ip_connection_limit: 1,
            ..test_config()
        };
        let (registry, _) = registry(config);
        registry
            .accept(RecordingTransport::new(), None, "10.0.0.1")
            .await
            .unwrap();

        let err = registry
            .accept(RecordingTransport::new(), None, "10.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionRejected::RateLimited { .. }));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn unanswered_probe_evicts_connection() {
        let (registry, broker) = registry(test_config());
        let transport = RecordingTransport::new();
        let id = registry
            .accept(transport.clone(), None, "10.0.0.1")
            .await
            .unwrap();
        broker.subscribe("J1", transport.clone()).await;

        // First tick sends a probe, second tick sees it unanswered.
        tokio::time::sleep(Duration::from_millis(140)).await;

        assert!(transport.probe_count() >= 1);
        assert!(!registry.is_connected(id).await);
        assert_eq!(
            transport.disconnect_reason().as_deref(),
            Some("heartbeat_timeout")
        );
        assert_eq!(broker.subscriber_count("J1").await, 0);
    }

    #[tokio::test]
    async fn answered_probes_keep_connection_alive() {
        let (registry, _) = registry(test_config());
        let transport = RecordingTransport::new();
        let id = registry
            .accept(transport.clone(), None, "10.0.0.1")
            .await
            .unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            registry.record_activity(id).await;
        }
        assert!(registry.is_connected(id).await);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn inactivity_ceiling_sends_notice_then_evicts() {
        let config = RegistryConfig {
            heartbeat_interval: Duration::from_secs(60),
            inactivity_ceiling: Duration::from_millis(60),
            ..test_config()
        };
        let (registry, _) = registry(config);
        let transport = RecordingTransport::new();
        let id = registry
            .accept(transport.clone(), None, "10.0.0.1")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!registry.is_connected(id).await);
        assert_eq!(
            transport.disconnect_reason().as_deref(),
            Some("inactivity_timeout")
        );
        assert!(transport
            .events()
            .iter()
            .any(|event| matches!(event, ServerEvent::TimeoutNotice { .. })));
    }

    #[tokio::test]
    async fn evict_is_idempotent() {
        let (registry, _) = registry(test_config());
        let transport = RecordingTransport::new();
        let id = registry
            .accept(transport.clone(), None, "10.0.0.1")
            .await
            .unwrap();

        registry.evict(id, "first").await;
        registry.evict(id, "second").await;
        assert_eq!(transport.disconnect_reason().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn event_rate_check_drops_excess_events() {
        let (registry, _) = registry(test_config());
        let transport = RecordingTransport::new();
        let id = registry
            .accept(transport.clone(), None, "10.0.0.1")
            .await
            .unwrap();

        let window = Duration::from_secs(60);
        assert!(registry.check_event_rate(id, "subscribe-job", 2, window).await);
        assert!(registry.check_event_rate(id, "subscribe-job", 2, window).await);
        assert!(!registry.check_event_rate(id, "subscribe-job", 2, window).await);
        // A different event name has its own window.
        assert!(
            registry
                .check_event_rate(id, "unsubscribe-job", 2, window)
                .await
        );
        // The violation alone does not evict.
        assert!(registry.is_connected(id).await);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_evicts_connections_past_hard_ceiling() {
        let config = RegistryConfig {
            heartbeat_interval: Duration::from_secs(60),
            ..test_config()
        };
        let (registry, _) = registry(config);
        let stale = RecordingTransport::new();
        let fresh = RecordingTransport::new();
        let stale_id = registry
            .accept(stale.clone(), None, "10.0.0.1")
            .await
            .unwrap();
        let fresh_id = registry
            .accept(fresh.clone(), None, "10.0.0.2")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.record_activity(fresh_id).await;

        let evicted = registry.sweep_inactive(Duration::from_millis(20)).await;
        assert_eq!(evicted, 1);
        assert!(!registry.is_connected(stale_id).await);
        assert!(registry.is_connected(fresh_id).await);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_evicts_everything() {
        let (registry, _) = registry(test_config());
        for i in 0..3 {
            registry
                .accept(RecordingTransport::new(), None, &format!("10.0.0.{i}"))
                .await
                .unwrap();
        }
        assert_eq!(registry.connection_count().await, 3);
        registry.shutdown().await;
        assert_eq!(registry.connection_count().await, 0);
    }
}
