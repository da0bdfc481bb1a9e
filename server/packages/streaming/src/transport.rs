//! Minimal capability interface the core requires from a client channel.
//!
//! The registry and broker never name a concrete socket type; anything that
//! can deliver a [`ServerEvent`], report liveness, and be told to disconnect
//! qualifies (WebSocket in the server, a recording double in tests).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::events::ServerEvent;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Opaque per-connection-instance identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
}

pub trait Transport: Send + Sync + fmt::Debug {
    fn id(&self) -> ConnectionId;

    /// Enqueue one event for delivery. Must not block; delivery order per
    /// transport follows call order.
    fn send(&self, event: &ServerEvent) -> Result<(), TransportError>;

    /// Ask the underlying channel to close. Idempotent.
    fn disconnect(&self, reason: &str);

    fn is_alive(&self) -> bool;
}
