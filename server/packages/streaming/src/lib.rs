//! Connection registry and job-subscription broker.
//!
//! Multiplexes many persistent client connections onto many concurrent
//! generation jobs: ordered per-subscriber event delivery, heartbeat-based
//! dead-connection detection, per-connection and per-event rate limits, and
//! periodic sweeps that reclaim stale state. All shared maps are owned by
//! the registry and broker and mutated only through their methods; every
//! timer re-validates that its entity still exists before touching it.

pub mod broker;
pub mod cleanup;
pub mod events;
pub mod rate_limit;
pub mod registry;
pub mod testing;
pub mod transport;

pub use broker::{BrokerConfig, JobBroker, JobState};
pub use cleanup::{CleanupConfig, CleanupScheduler};
pub use events::{ClientEvent, JobUpdate, ServerEvent, WireJobStatus};
pub use rate_limit::RateLimiter;
pub use registry::{AdmissionRejected, ConnectionRegistry, RegistryConfig};
pub use transport::{ConnectionId, Transport, TransportError};
