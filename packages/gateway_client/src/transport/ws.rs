//! WebSocket connector over tokio-tungstenite.
//!
//! Reader and writer pump tasks bridge the socket to the engine's channels.
//! Only text frames are forwarded; ping/pong is handled by the library and
//! binary frames are dropped with a log.

use futures::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{Connection, Connector, TransportEvent};
use crate::error::GatewayError;

/// Channel depth between the pumps and the engine.
const CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Connection, GatewayError>> {
        Box::pin(async move {
            let (stream, _response) = connect_async(url)
                .await
                .map_err(|e| GatewayError::Transport(e.to_string()))?;
            debug!(url = %url, "websocket open");

            let (mut sink, mut source) = stream.split();
            let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(CHANNEL_DEPTH);
            let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(CHANNEL_DEPTH);

            // Writer pump: engine frames -> socket. Ends when the engine
            // drops its sender or the socket rejects a write.
            tokio::spawn(async move {
                while let Some(text) = outbound_rx.recv().await {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!(error = %e, "websocket write failed");
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            // Reader pump: socket -> engine, ending with a single Closed.
            tokio::spawn(async move {
                let reason = loop {
                    match source.next().await {
                        Some(Ok(Message::Text(text))) => {
                            if inbound_tx
                                .send(TransportEvent::Frame(text.to_string()))
                                .await
                                .is_err()
                            {
                                // Engine gone; nothing left to deliver to.
                                return;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break frame.map(|f| f.reason.to_string());
                        }
                        Some(Ok(Message::Binary(_))) => {
                            warn!("dropping unexpected binary websocket frame");
                        }
                        Some(Ok(_)) => {} // ping/pong
                        Some(Err(e)) => break Some(e.to_string()),
                        None => break None,
                    }
                };
                let _ = inbound_tx.send(TransportEvent::Closed { reason }).await;
            });

            Ok(Connection {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        })
    }
}
