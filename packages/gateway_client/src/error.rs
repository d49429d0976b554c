//! Engine error taxonomy.
//!
//! Transport failures are recoverable (the lifecycle reconnects while told
//! to); protocol failures surface per-request. Handshake verdicts are not
//! errors here — they travel through `ConnectionState`.

use crate::protocol::ErrorShape;

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Dial or channel failure on the underlying transport.
    #[error("transport: {0}")]
    Transport(String),

    /// The channel closed while requests were still pending.
    #[error("connection lost")]
    ConnectionLost,

    /// A request was issued with no open channel.
    #[error("not connected")]
    NotConnected,

    /// Per-request wall-clock deadline elapsed.
    #[error("request timed out: {method}")]
    Timeout { method: String },

    /// The server answered `ok=false`.
    #[error("gateway error: {}", .0.display())]
    Rpc(ErrorShape),

    /// A frame violated the wire contract in a way the engine can name.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Local serialization failure building an outbound frame.
    #[error("serialize: {0}")]
    Serialize(String),

    /// The engine task has shut down.
    #[error("engine closed")]
    Closed,
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialize(err.to_string())
    }
}
