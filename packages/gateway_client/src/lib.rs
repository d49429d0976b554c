//! Client engine for a persistent, authenticated connection to an agent
//! gateway.
//!
//! The engine dials a WebSocket endpoint, answers the server's challenge
//! with an Ed25519 device signature, multiplexes correlated requests and
//! server-push events over one duplex channel, reconstructs streamed chat
//! responses into incremental chunks, and tracks sessions with unread
//! state. It is UI-agnostic: embedders drive it through [`GatewayClient`]
//! and observe it through a state watch and a notification broadcast.

pub mod client;
pub mod config;
pub mod correlator;
mod dispatch;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod protocol;
pub mod session;
mod stream;
pub mod transport;


pub use client::{ClientNotification, ConnectionState, EngineSnapshot, GatewayClient};
pub use config::ClientConfig;
pub use error::GatewayError;
pub use identity::DeviceIdentity;
pub use session::{ChatMessage, Role};
pub use stream::RunStatus;
