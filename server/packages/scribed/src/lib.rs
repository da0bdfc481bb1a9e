//! Scribe server: HTTP/WebSocket surface over the invoker and the
//! streaming core.

pub mod cli;
pub mod router;
pub mod store;
pub mod ws;
