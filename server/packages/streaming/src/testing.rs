//! Test doubles for the transport seam.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::events::{JobUpdate, ServerEvent};
use crate::transport::{ConnectionId, Transport, TransportError};

/// In-memory transport that records every event it is asked to deliver.
#[derive(Debug)]
pub struct RecordingTransport {
    id: ConnectionId,
    events: Mutex<Vec<ServerEvent>>,
    disconnect_reason: Mutex<Option<String>>,
    alive: AtomicBool,
    fail_sends: AtomicBool,
}

impl RecordingTransport {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::next(),
            events: Mutex::new(Vec::new()),
            disconnect_reason: Mutex::new(None),
            alive: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
        })
    }

    pub fn events(&self) -> Vec<ServerEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn job_updates(&self) -> Vec<JobUpdate> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::JobUpdate(update) => Some(update),
                _ => None,
            })
            .collect()
    }

    pub fn probe_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, ServerEvent::HeartbeatProbe))
            .count()
    }

    pub fn disconnect_reason(&self) -> Option<String> {
        self.disconnect_reason.lock().expect("reason lock").clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

impl Transport for RecordingTransport {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, event: &ServerEvent) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.events.lock().expect("events lock").push(event.clone());
        Ok(())
    }

    fn disconnect(&self, reason: &str) {
        self.alive.store(false, Ordering::SeqCst);
        let mut guard = self.disconnect_reason.lock().expect("reason lock");
        if guard.is_none() {
            *guard = Some(reason.to_string());
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
