//! Gateway wire protocol types.
//!
//! Every frame on the channel is a JSON object with a `type` field:
//! `req` (correlated request), `res` (correlated response), `event`
//! (uncorrelated server push). Field names on the wire are camelCase.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request methods the engine issues.
pub mod methods {
    pub const CONNECT: &str = "connect";
    pub const SESSION_LIST: &str = "session.list";
    pub const SESSION_RESET: &str = "session.reset";
    pub const CHAT_SEND: &str = "chat.send";
    pub const CHAT_HISTORY: &str = "chat.history";
}

/// One frame on the duplex channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Req {
        id: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Res {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

/// Error body of a failed response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorShape {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorShape {
    /// Best-effort human-readable form for logs and error variants.
    pub fn display(&self) -> String {
        match (&self.code, &self.message) {
            (Some(code), Some(msg)) => format!("{code}: {msg}"),
            (Some(code), None) => code.clone(),
            (None, Some(msg)) => msg.clone(),
            (None, None) => "unknown error".to_string(),
        }
    }
}

/// Closed classification of inbound event names.
///
/// Unknown names land in `Other` and are forwarded untouched on the generic
/// notification stream rather than silently swallowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Challenge,
    Chat,
    Agent,
    Heartbeat,
    Tick,
    Other(String),
}

impl EventKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "connect.challenge" => EventKind::Challenge,
            "chat" => EventKind::Chat,
            "agent" => EventKind::Agent,
            "heartbeat" => EventKind::Heartbeat,
            "tick" => EventKind::Tick,
            other => EventKind::Other(other.to_string()),
        }
    }
}

// --- connect ---

/// Payload of the server's `connect.challenge` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengePayload {
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
}

/// Client descriptor inside `connect` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

/// Bearer-token block inside `connect` params.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
}

/// Device-identity block: the signed challenge proof.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceBlock {
    /// Stable device fingerprint.
    pub id: String,
    /// URL-safe base64 Ed25519 public key.
    pub public_key: String,
    /// Detached signature over the canonical signing payload.
    pub signature: String,
    /// Signing timestamp, ms since epoch.
    pub signed_at: u64,
    /// Echo of the challenge nonce that was signed.
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    pub auth: AuthBlock,
    pub locale: String,
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceBlock>,
}

/// Successful `connect` response payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<HelloSnapshot>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_defaults: Option<SessionDefaults>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_session_key: Option<String>,
}

// --- sessions ---

/// One row of the server's session list. `key` is the stable identity;
/// everything else is a display hint that may be absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionListPayload {
    #[serde(default)]
    pub sessions: Vec<SessionRow>,
}

/// `session.reset` response. The returned key may differ from the one sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionResetPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

// --- chat ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendParams {
    pub session_key: String,
    pub idempotency_key: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub mime_type: String,
    pub file_name: String,
    /// Base64-encoded file content.
    pub content: String,
}

impl Attachment {
    pub fn image(mime_type: impl Into<String>, file_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: "image".to_string(),
            mime_type: mime_type.into(),
            file_name: file_name.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// Streaming state of a `chat` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatEventState {
    Delta,
    Final,
    Aborted,
    Error,
}

impl ChatEventState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ChatEventState::Delta)
    }
}

/// One content block of a wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Unknown,
}

/// History responses carry either a plain string or a block list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Flatten to plain text, concatenating text blocks and skipping the rest.
    pub fn flatten(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::Unknown => None,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireChatMessage {
    pub role: String,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Payload of a `chat` event. Carries the *entire* accumulated text produced
/// so far, not just new content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEventPayload {
    pub run_id: String,
    pub session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub state: ChatEventState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<WireChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ChatEventPayload {
    /// The accumulated text snapshot this event carries, if any.
    pub fn snapshot_text(&self) -> Option<String> {
        self.message.as_ref().map(|m| m.content.flatten())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryParams {
    pub session_key: String,
    pub limit: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryPayload {
    #[serde(default)]
    pub messages: Vec<WireChatMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_frame_wire_shape() {
        let frame = Frame::Req {
            id: "7".into(),
            method: methods::SESSION_LIST.into(),
            params: None,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "req");
        assert_eq!(json["id"], "7");
        assert_eq!(json["method"], "session.list");
        assert!(json.get("params").is_none());
    }

    #[test]
    fn res_frame_parses_with_error() {
        let frame: Frame = serde_json::from_str(
            r#"{"type":"res","id":"3","ok":false,"error":{"code":"pairing_required"}}"#,
        )
        .unwrap();
        match frame {
            Frame::Res { id, ok, error, .. } => {
                assert_eq!(id, "3");
                assert!(!ok);
                assert_eq!(error.unwrap().code.as_deref(), Some("pairing_required"));
            }
            other => panic!("expected res, got {other:?}"),
        }
    }

    #[test]
    fn event_frame_parses_with_seq() {
        let frame: Frame =
            serde_json::from_str(r#"{"type":"event","event":"tick","seq":42}"#).unwrap();
        match frame {
            Frame::Event { event, seq, payload } => {
                assert_eq!(event, "tick");
                assert_eq!(seq, Some(42));
                assert!(payload.is_none());
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn event_kind_classification() {
        assert_eq!(EventKind::from_name("connect.challenge"), EventKind::Challenge);
        assert_eq!(EventKind::from_name("chat"), EventKind::Chat);
        assert_eq!(EventKind::from_name("heartbeat"), EventKind::Heartbeat);
        assert_eq!(
            EventKind::from_name("device.pairing"),
            EventKind::Other("device.pairing".into())
        );
    }

    #[test]
    fn connect_params_use_camel_case() {
        let params = ConnectParams {
            min_protocol: 1,
            max_protocol: 3,
            client: ClientInfo {
                id: "cli".into(),
                version: "0.1.0".into(),
                platform: "linux".into(),
                mode: "operator".into(),
            },
            role: "operator".into(),
            scopes: vec!["chat".into()],
            auth: AuthBlock {
                token: Some("abc".into()),
                device_token: None,
            },
            locale: "en-US".into(),
            user_agent: "gateway-client/0.1".into(),
            device: None,
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["minProtocol"], 1);
        assert_eq!(json["maxProtocol"], 3);
        assert_eq!(json["userAgent"], "gateway-client/0.1");
        assert_eq!(json["auth"]["token"], "abc");
    }

    #[test]
    fn chat_event_payload_snapshot_text() {
        let payload: ChatEventPayload = serde_json::from_str(
            r#"{"runId":"r1","sessionKey":"main","seq":1,"state":"delta",
                "message":{"role":"assistant","content":[{"type":"text","text":"Hi"},{"type":"tool_use"},{"type":"text","text":"!"}]}}"#,
        )
        .unwrap();
        assert_eq!(payload.run_id, "r1");
        assert_eq!(payload.state, ChatEventState::Delta);
        assert_eq!(payload.snapshot_text().unwrap(), "Hi!");
    }

    #[test]
    fn history_content_accepts_plain_string() {
        let msg: WireChatMessage =
            serde_json::from_str(r#"{"role":"user","content":"hello","timestamp":5}"#).unwrap();
        assert_eq!(msg.content.flatten(), "hello");
    }

    #[test]
    fn chat_event_without_run_id_is_rejected() {
        let res = serde_json::from_str::<ChatEventPayload>(
            r#"{"sessionKey":"main","state":"delta"}"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn attachment_wire_shape() {
        let json = serde_json::to_value(Attachment::image("image/png", "shot.png", "QUJD")).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["mimeType"], "image/png");
        assert_eq!(json["fileName"], "shot.png");
        assert_eq!(json["content"], "QUJD");
    }
}
