//! WebSocket relay: a standalone server hosting topics for remote sessions,
//! and the client transport that connects sessions to it.

mod client;
mod server;

pub use client::RelayTransport;
pub use server::{RelayConfig, RelayError, RelayServer, RelayStats};
