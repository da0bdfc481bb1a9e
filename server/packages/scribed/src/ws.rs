//! WebSocket endpoint: the concrete [`Transport`] behind the streaming
//! core's capability seam.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use scribe_streaming::{ClientEvent, ConnectionId, ServerEvent, Transport, TransportError};

use crate::router::AppState;

const SUBSCRIBE_RATE_LIMIT: u32 = 30;
const UNSUBSCRIBE_RATE_LIMIT: u32 = 30;
const EVENT_RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Authenticated principal, when the deployment fronting this server
    /// resolves one. Absent means anonymous.
    pub identity: Option<String>,
}

#[derive(Debug)]
enum OutboundFrame {
    Event(ServerEvent),
    Close(String),
}

/// Transport over the socket's writer task. `send` only enqueues, so
/// fan-out never blocks on a slow client; per-connection order is the
/// channel's FIFO order.
#[derive(Debug)]
struct WsTransport {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    alive: AtomicBool,
}

impl WsTransport {
    fn new(outbound: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self {
            id: ConnectionId::next(),
            outbound,
            alive: AtomicBool::new(true),
        }
    }
}

impl Transport for WsTransport {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, event: &ServerEvent) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(OutboundFrame::Event(event.clone()))
            .map_err(|_| TransportError::Closed)
    }

    fn disconnect(&self, reason: &str) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.send(OutboundFrame::Close(reason.to_string()));
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let remote_addr = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    ws.on_upgrade(move |socket| handle_socket(state, socket, query.identity, remote_addr))
}

async fn handle_socket(
    state: Arc<AppState>,
    socket: WebSocket,
    identity: Option<String>,
    remote_addr: String,
) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let transport = Arc::new(WsTransport::new(outbound_tx));

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            match frame {
                OutboundFrame::Event(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(err) => {
                            tracing::error!(error = %err, "failed to serialize server event");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close(reason) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let connection_id = match state
        .registry
        .accept(transport.clone(), identity, &remote_addr)
        .await
    {
        Ok(id) => id,
        Err(rejected) => {
            // Refused before any state was created; close the raw channel
            // and walk away.
            tracing::info!(
                remote_addr = %remote_addr,
                reason = %rejected,
                "websocket connection refused"
            );
            transport.disconnect(&rejected.to_string());
            let _ = writer.await;
            return;
        }
    };

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(connection = %connection_id, error = %err, "websocket read error");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                state.registry.record_activity(connection_id).await;
                if !handle_client_frame(&state, connection_id, &transport, &text).await {
                    break;
                }
            }
            Message::Ping(_) | Message::Pong(_) => {
                state.registry.record_activity(connection_id).await;
            }
            Message::Close(_) => break,
            Message::Binary(_) => {
                tracing::debug!(connection = %connection_id, "ignoring binary frame");
            }
        }
    }

    state.registry.evict(connection_id, "disconnected").await;
    let _ = writer.await;
}

/// Returns false once the registry no longer knows the connection; the
/// caller must stop reading frames for it.
async fn handle_client_frame(
    state: &Arc<AppState>,
    connection_id: ConnectionId,
    transport: &Arc<WsTransport>,
    text: &str,
) -> bool {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(err) => {
            tracing::debug!(
                connection = %connection_id,
                error = %err,
                "dropping unparseable client frame"
            );
            return true;
        }
    };

    match event {
        ClientEvent::SubscribeJob { job_id } => {
            if !state
                .registry
                .check_event_rate(
                    connection_id,
                    "subscribe-job",
                    SUBSCRIBE_RATE_LIMIT,
                    EVENT_RATE_WINDOW,
                )
                .await
            {
                return true;
            }
            // An evicted connection can still have frames in flight; a
            // subscription created for it now would dangle, since eviction
            // already told the broker to drop every edge it had.
            if !state.registry.is_connected(connection_id).await {
                return false;
            }
            let retained = state
                .broker
                .subscribe(&job_id, transport.clone() as Arc<dyn Transport>)
                .await;
            if !state.registry.is_connected(connection_id).await {
                // Evicted while the subscribe was in flight; the eviction
                // ran before the edge existed, so remove it here.
                state.broker.unsubscribe(&job_id, connection_id).await;
                return false;
            }
            // A job that already finished inside the grace window still
            // shows its terminal state to late subscribers.
            if let Some(update) = retained {
                let _ = transport.send(&ServerEvent::JobUpdate(update));
            }
            true
        }
        ClientEvent::UnsubscribeJob { job_id } => {
            if !state
                .registry
                .check_event_rate(
                    connection_id,
                    "unsubscribe-job",
                    UNSUBSCRIBE_RATE_LIMIT,
                    EVENT_RATE_WINDOW,
                )
                .await
            {
                return true;
            }
            state.broker.unsubscribe(&job_id, connection_id).await;
            true
        }
        // Activity was already recorded for the inbound frame; answering a
        // probe needs nothing else.
        ClientEvent::HeartbeatResponse => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::AppState;
    use scribe_invoker::{Invoker, InvokerConfig};

    fn test_state() -> Arc<AppState> {
        AppState::new(Invoker::new(InvokerConfig::default()))
    }

    fn channel_transport() -> (Arc<WsTransport>, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (Arc::new(WsTransport::new(outbound_tx)), outbound_rx)
    }

    #[tokio::test]
    async fn subscribe_on_live_connection_creates_edge() {
        let state = test_state();
        let (transport, _outbound) = channel_transport();
        let id = state
            .registry
            .accept(transport.clone() as Arc<dyn Transport>, None, "10.0.0.1")
            .await
            .unwrap();

        let keep_reading = handle_client_frame(
            &state,
            id,
            &transport,
            r#"{"type":"subscribe-job","jobId":"J1"}"#,
        )
        .await;
        assert!(keep_reading);
        assert_eq!(state.broker.subscriber_count("J1").await, 1);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn subscribe_after_eviction_leaves_no_edges() {
        let state = test_state();
        let (transport, _outbound) = channel_transport();
        let id = state
            .registry
            .accept(transport.clone() as Arc<dyn Transport>, None, "10.0.0.1")
            .await
            .unwrap();
        state.registry.evict(id, "heartbeat_timeout").await;

        // A frame already in flight when the eviction ran must not create
        // a subscription nothing can clean up afterwards.
        let keep_reading = handle_client_frame(
            &state,
            id,
            &transport,
            r#"{"type":"subscribe-job","jobId":"J1"}"#,
        )
        .await;
        assert!(!keep_reading, "read loop must stop for an evicted connection");
        assert_eq!(state.broker.subscriber_count("J1").await, 0);

        // The socket-close eviction finds no record and must still leave
        // the broker clean.
        state.registry.evict(id, "disconnected").await;
        assert_eq!(state.broker.subscriber_count("J1").await, 0);
        state.shutdown().await;
    }
}
