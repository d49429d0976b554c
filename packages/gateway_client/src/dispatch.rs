//! Inbound frame classification.
//!
//! One function turns raw transport text into the closed set of things the
//! engine acts on. Anything malformed is dropped with a log line — a single
//! bad frame must never take the connection down.

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::protocol::{ChallengePayload, ChatEventPayload, EventKind, Frame};

/// What an inbound frame means to the engine.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// Correlated response, already folded into a per-request result.
    Response {
        id: String,
        result: Result<Value, GatewayError>,
    },
    /// Server-issued auth challenge.
    Challenge(ChallengePayload),
    /// Streaming chat event.
    Chat(ChatEventPayload),
    /// Known but passive event (agent chatter, heartbeat, tick).
    Passive,
    /// Unknown event, forwarded untouched to generic subscribers.
    Other {
        event: String,
        payload: Option<Value>,
        seq: Option<u64>,
    },
}

/// Classify one raw frame. `None` means the frame was dropped (and logged).
pub(crate) fn classify(text: &str) -> Option<Inbound> {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "dropping malformed frame");
            return None;
        }
    };

    match frame {
        Frame::Req { method, .. } => {
            // The gateway never issues requests toward the client.
            warn!(method = %method, "dropping unexpected inbound request frame");
            None
        }
        Frame::Res {
            id,
            ok,
            payload,
            error,
        } => {
            let result = if ok {
                Ok(payload.unwrap_or(Value::Null))
            } else {
                Err(GatewayError::Rpc(error.unwrap_or_default()))
            };
            Some(Inbound::Response { id, result })
        }
        Frame::Event {
            event,
            payload,
            seq,
        } => match EventKind::from_name(&event) {
            EventKind::Challenge => {
                let payload = payload.unwrap_or(Value::Null);
                match serde_json::from_value::<ChallengePayload>(payload) {
                    Ok(challenge) => Some(Inbound::Challenge(challenge)),
                    Err(e) => {
                        warn!(error = %e, "dropping challenge event with bad payload");
                        None
                    }
                }
            }
            EventKind::Chat => {
                let payload = payload.unwrap_or(Value::Null);
                match serde_json::from_value::<ChatEventPayload>(payload) {
                    Ok(chat) => Some(Inbound::Chat(chat)),
                    Err(e) => {
                        warn!(error = %e, "dropping chat event with bad payload");
                        None
                    }
                }
            }
            EventKind::Agent | EventKind::Heartbeat | EventKind::Tick => {
                debug!(event = %event, "passive event");
                Some(Inbound::Passive)
            }
            EventKind::Other(name) => Some(Inbound::Other {
                event: name,
                payload,
                seq,
            }),
        },
    }
}
