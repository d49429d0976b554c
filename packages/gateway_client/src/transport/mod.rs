//! Transport seam: ordered, complete text frames over a duplex channel.
//!
//! The engine assumes the transport delivers whole frames in order and
//! signals close/error; framing and compression live below this seam.
//!
//! - `ws` — real WebSocket connector (tokio-tungstenite)
//! - `memory` — in-process connector for tests and embedding

pub mod memory;
pub mod ws;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::GatewayError;

/// What the transport hands the engine.
#[derive(Debug)]
pub enum TransportEvent {
    /// One complete inbound text frame.
    Frame(String),
    /// The channel closed; `reason` is best-effort diagnostic text.
    Closed { reason: Option<String> },
}

/// An open duplex channel. Dropping either half tears the connection down.
pub struct Connection {
    /// Outbound complete text frames, fire-and-forget at this layer.
    pub outbound: mpsc::Sender<String>,
    /// Inbound events in strict transport order.
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Dials an endpoint and returns an open [`Connection`].
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Connection, GatewayError>>;
}
