//! Session and message-history bookkeeping.
//!
//! Owned by the engine actor; mutated only from the inbound/command path.
//! The session list is replaced wholesale on each refresh — no per-entry
//! diffing. Message history is append/update only and cleared wholesale on
//! session switch.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::protocol::{HistoryPayload, SessionRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// History responses may carry system/tool roles; those are filtered out.
    pub fn from_wire(role: &str) -> Option<Role> {
        match role {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Default)]
pub(crate) struct SessionState {
    current_key: Option<String>,
    unread: BTreeSet<String>,
    sessions: Vec<SessionRow>,
    messages: Vec<ChatMessage>,
    revision: u64,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_key(&self) -> Option<&str> {
        self.current_key.as_deref()
    }

    /// Bumped on every message-cache mutation; an in-flight history load
    /// compares it to detect that its snapshot is already stale.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn touch(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }

    /// Adopt the handshake's default session key. A key picked by the user
    /// before a reconnect wins over the server default.
    pub fn adopt_default(&mut self, key: String) {
        if self.current_key.is_none() {
            self.current_key = Some(key);
        }
    }

    /// Switch the active session: set current, clear history, clear unread.
    pub fn switch_to(&mut self, key: String) {
        self.unread.remove(&key);
        self.current_key = Some(key);
        self.messages.clear();
        self.touch();
    }

    /// Adopt a server-assigned key after `session.reset`; clears history.
    pub fn adopt_reset(&mut self, key: String) {
        self.unread.remove(&key);
        self.current_key = Some(key);
        self.messages.clear();
        self.touch();
    }

    /// Replace the session-list snapshot wholesale.
    pub fn replace_sessions(&mut self, rows: Vec<SessionRow>) {
        self.sessions = rows;
    }

    /// Record activity on a non-active session. Returns true when the unread
    /// set actually changed.
    pub fn mark_unread(&mut self, key: &str) -> bool {
        if self.current_key.as_deref() == Some(key) {
            return false;
        }
        self.unread.insert(key.to_string())
    }

    pub fn replace_history(&mut self, messages: Vec<ChatMessage>) {
        self.messages = messages;
        self.touch();
    }

    pub fn push_message(&mut self, message: ChatMessage) {
        self.messages.push(message);
        self.touch();
    }

    /// Merge a finalized message: update in place when a streaming message
    /// with the same id exists, otherwise append in arrival order.
    pub fn upsert_message(&mut self, message: ChatMessage) {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => self.messages.push(message),
        }
        self.touch();
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn sessions(&self) -> &[SessionRow] {
        &self.sessions
    }

    pub fn unread(&self) -> Vec<String> {
        self.unread.iter().cloned().collect()
    }
}

/// Rebuild an ordered message list from a `chat.history` response: only
/// user/assistant roles survive, block content is flattened to plain text.
pub(crate) fn history_messages(payload: HistoryPayload) -> Vec<ChatMessage> {
    payload
        .messages
        .into_iter()
        .filter_map(|wire| {
            let role = Role::from_wire(&wire.role)?;
            let timestamp = wire
                .timestamp
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now);
            Some(ChatMessage {
                id: Uuid::new_v4().to_string(),
                role,
                content: wire.content.flatten(),
                timestamp,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ContentBlock, MessageContent, WireChatMessage};

    fn row(key: &str) -> SessionRow {
        SessionRow {
            key: key.to_string(),
            display_name: None,
            label: None,
            derived_title: None,
            updated_at: None,
            kind: None,
        }
    }

    #[test]
    fn switch_clears_history_and_unread() {
        let mut state = SessionState::new();
        state.switch_to("A".into());
        state.push_message(ChatMessage::user("hi"));
        state.mark_unread("B");

        state.switch_to("B".into());
        assert_eq!(state.current_key(), Some("B"));
        assert!(state.messages().is_empty());
        assert!(state.unread().is_empty());
    }

    #[test]
    fn unread_never_contains_active_session() {
        let mut state = SessionState::new();
        state.switch_to("A".into());
        assert!(!state.mark_unread("A"));
        assert!(state.mark_unread("B"));
        assert!(!state.mark_unread("B")); // already recorded
        assert_eq!(state.unread(), vec!["B".to_string()]);
    }

    #[test]
    fn adopt_default_does_not_override_user_choice() {
        let mut state = SessionState::new();
        state.adopt_default("main".into());
        assert_eq!(state.current_key(), Some("main"));

        state.switch_to("other".into());
        state.adopt_default("main".into());
        assert_eq!(state.current_key(), Some("other"));
    }

    #[test]
    fn sessions_replaced_wholesale() {
        let mut state = SessionState::new();
        state.replace_sessions(vec![row("A"), row("B")]);
        state.replace_sessions(vec![row("C")]);
        let keys: Vec<&str> = state.sessions().iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["C"]);
    }

    #[test]
    fn upsert_updates_streaming_message_in_place() {
        let mut state = SessionState::new();
        let mut msg = ChatMessage::user("partial");
        msg.role = Role::Assistant;
        let id = msg.id.clone();
        state.push_message(msg.clone());

        msg.content = "complete".into();
        state.upsert_message(msg);
        assert_eq!(state.messages().len(), 1);
        assert_eq!(state.messages()[0].id, id);
        assert_eq!(state.messages()[0].content, "complete");
    }

    #[test]
    fn revision_tracks_message_cache_changes() {
        let mut state = SessionState::new();
        let r0 = state.revision();
        state.push_message(ChatMessage::user("hi"));
        let r1 = state.revision();
        assert_ne!(r0, r1);

        state.switch_to("B".into());
        assert_ne!(state.revision(), r1);

        // Session-list and unread changes do not invalidate the cache.
        let r2 = state.revision();
        state.replace_sessions(vec![row("A")]);
        state.mark_unread("A");
        assert_eq!(state.revision(), r2);
    }

    #[test]
    fn history_filters_roles_and_flattens_blocks() {
        let payload = HistoryPayload {
            messages: vec![
                WireChatMessage {
                    role: "system".into(),
                    content: MessageContent::Text("prelude".into()),
                    timestamp: None,
                },
                WireChatMessage {
                    role: "user".into(),
                    content: MessageContent::Text("question".into()),
                    timestamp: Some(1_700_000_000_000),
                },
                WireChatMessage {
                    role: "assistant".into(),
                    content: MessageContent::Blocks(vec![
                        ContentBlock::Text { text: "ans".into() },
                        ContentBlock::Unknown,
                        ContentBlock::Text { text: "wer".into() },
                    ]),
                    timestamp: Some(1_700_000_000_500),
                },
            ],
        };
        let messages = history_messages(payload);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "question");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "answer");
    }
}
