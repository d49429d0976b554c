//! Streaming reconstructor: full-text snapshots in, incremental chunks out.
//!
//! The gateway's `chat` feed retransmits the *entire* accumulated text on
//! every delta. The reconstructor keeps the last snapshot per active run and
//! emits only the new suffix. It is owned by the engine actor and written
//! only from the inbound-processing path.

use tracing::debug;
use uuid::Uuid;

use crate::protocol::{ChatEventPayload, ChatEventState};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Complete,
    Aborted,
    Failed,
}

/// What an applied chat event asks the engine to do.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RunEffect {
    /// New suffix for the streaming assistant message.
    Chunk { message_id: String, delta: String },
    /// The run ended; `text` is the complete buffered content.
    Finalized {
        message_id: String,
        text: String,
        status: RunStatus,
        error_message: Option<String>,
    },
    /// Activity on a session other than the active one.
    Unread { session_key: String },
}

struct ActiveRun {
    run_id: String,
    message_id: String,
    session_key: String,
    buffer: String,
}

/// Per-connection reconstruction state. At most one run is active: the one
/// this client initiated and is currently rendering.
#[derive(Default)]
pub(crate) struct StreamReconstructor {
    active: Option<ActiveRun>,
}

impl StreamReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt a freshly acknowledged run, superseding any previous one.
    /// Returns the assistant message id allocated for it.
    pub fn begin(&mut self, run_id: String, session_key: String) -> String {
        let message_id = Uuid::new_v4().to_string();
        if let Some(old) = self.active.replace(ActiveRun {
            run_id,
            message_id: message_id.clone(),
            session_key,
            buffer: String::new(),
        }) {
            debug!(run = %old.run_id, "superseding active run");
        }
        message_id
    }

    pub fn active_run_id(&self) -> Option<&str> {
        self.active.as_ref().map(|r| r.run_id.as_str())
    }

    /// Forget the active run (connection teardown).
    pub fn clear(&mut self) {
        self.active = None;
    }

    /// Apply one `chat` event. `current_session` is the session key the user
    /// is looking at, used to classify foreign activity when no run is live.
    pub fn apply(
        &mut self,
        event: &ChatEventPayload,
        current_session: Option<&str>,
    ) -> Vec<RunEffect> {
        // A run whose session lost focus must never stream into the new
        // view; its events are foreign activity from here on.
        if let Some(run) = self.active.as_ref()
            && current_session != Some(run.session_key.as_str())
        {
            debug!(run = %run.run_id, session = %run.session_key, "detaching run for unfocused session");
            self.active = None;
        }

        let Some(run) = self.active.as_mut() else {
            // Nothing streaming; any other session's activity is unread.
            if current_session != Some(event.session_key.as_str()) {
                return vec![RunEffect::Unread {
                    session_key: event.session_key.clone(),
                }];
            }
            debug!(run = %event.run_id, "chat event with no active run");
            return vec![];
        };

        if event.session_key != run.session_key {
            // Foreign session: never render into the active view. If this
            // also terminates what we thought was our run, drop the run
            // state silently to avoid cross-session leakage.
            let effects = vec![RunEffect::Unread {
                session_key: event.session_key.clone(),
            }];
            if event.run_id == run.run_id && event.state.is_terminal() {
                debug!(run = %run.run_id, "active run terminated from foreign session");
                self.active = None;
            }
            return effects;
        }

        if event.run_id != run.run_id {
            debug!(run = %event.run_id, active = %run.run_id, "event for non-active run");
            return vec![];
        }

        let mut effects = Vec::new();
        if let Some(chunk) = Self::advance(run, event) {
            effects.push(chunk);
        }

        match event.state {
            ChatEventState::Delta => {}
            ChatEventState::Final => {
                effects.push(RunEffect::Finalized {
                    message_id: run.message_id.clone(),
                    text: run.buffer.clone(),
                    status: RunStatus::Complete,
                    error_message: None,
                });
                self.active = None;
            }
            ChatEventState::Aborted => {
                effects.push(RunEffect::Finalized {
                    message_id: run.message_id.clone(),
                    text: run.buffer.clone(),
                    status: RunStatus::Aborted,
                    error_message: event.error_message.clone(),
                });
                self.active = None;
            }
            ChatEventState::Error => {
                effects.push(RunEffect::Finalized {
                    message_id: run.message_id.clone(),
                    text: run.buffer.clone(),
                    status: RunStatus::Failed,
                    error_message: event.error_message.clone(),
                });
                self.active = None;
            }
        }
        effects
    }

    /// Diff the event's snapshot against the kept buffer. Emits a chunk and
    /// replaces the buffer only when the snapshot is strictly longer; a
    /// shorter snapshot violates the upstream contract and is ignored so the
    /// longer buffer wins.
    fn advance(run: &mut ActiveRun, event: &ChatEventPayload) -> Option<RunEffect> {
        let text = event.snapshot_text()?;
        if text.len() <= run.buffer.len() {
            if text.len() < run.buffer.len() {
                debug!(
                    run = %run.run_id,
                    kept = run.buffer.len(),
                    got = text.len(),
                    "snapshot shorter than buffer, keeping buffer"
                );
            }
            return None;
        }
        let Some(delta) = text.get(run.buffer.len()..) else {
            debug!(run = %run.run_id, "snapshot not a superset of buffer, keeping buffer");
            return None;
        };
        let delta = delta.to_string();
        run.buffer = text;
        Some(RunEffect::Chunk {
            message_id: run.message_id.clone(),
            delta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ContentBlock, MessageContent, WireChatMessage};
    use proptest::prelude::*;

    fn event(run: &str, session: &str, state: ChatEventState, text: Option<&str>) -> ChatEventPayload {
        ChatEventPayload {
            run_id: run.to_string(),
            session_key: session.to_string(),
            seq: None,
            state,
            message: text.map(|t| WireChatMessage {
                role: "assistant".to_string(),
                content: MessageContent::Blocks(vec![ContentBlock::Text { text: t.to_string() }]),
                timestamp: None,
            }),
            error_message: None,
        }
    }

    fn chunks(effects: &[RunEffect]) -> Vec<&str> {
        effects
            .iter()
            .filter_map(|e| match e {
                RunEffect::Chunk { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn snapshots_become_suffix_chunks() {
        let mut recon = StreamReconstructor::new();
        recon.begin("r1".into(), "main".into());

        let mut all = Vec::new();
        for text in ["Hi", "Hi there", "Hi there!"] {
            let effects = recon.apply(&event("r1", "main", ChatEventState::Delta, Some(text)), Some("main"));
            all.extend(chunks(&effects).into_iter().map(str::to_string));
        }
        assert_eq!(all, vec!["Hi", " there", "!"]);

        let effects = recon.apply(
            &event("r1", "main", ChatEventState::Final, Some("Hi there!")),
            Some("main"),
        );
        assert!(chunks(&effects).is_empty(), "final with same text emits no chunk");
        match &effects[..] {
            [RunEffect::Finalized { text, status, .. }] => {
                assert_eq!(text, "Hi there!");
                assert_eq!(*status, RunStatus::Complete);
            }
            other => panic!("expected finalize, got {other:?}"),
        }
        assert!(recon.active_run_id().is_none());
    }

    #[test]
    fn final_emits_remaining_suffix_first() {
        let mut recon = StreamReconstructor::new();
        recon.begin("r1".into(), "main".into());
        recon.apply(&event("r1", "main", ChatEventState::Delta, Some("Hi")), Some("main"));

        let effects = recon.apply(
            &event("r1", "main", ChatEventState::Final, Some("Hi there!")),
            Some("main"),
        );
        assert_eq!(chunks(&effects), vec![" there!"]);
        assert!(matches!(
            effects.last(),
            Some(RunEffect::Finalized { text, .. }) if text == "Hi there!"
        ));
    }

    #[test]
    fn shorter_snapshot_is_ignored() {
        let mut recon = StreamReconstructor::new();
        recon.begin("r1".into(), "main".into());
        recon.apply(&event("r1", "main", ChatEventState::Delta, Some("Hi there")), Some("main"));

        let effects = recon.apply(&event("r1", "main", ChatEventState::Delta, Some("Hi")), Some("main"));
        assert!(effects.is_empty());

        // Buffer unchanged: the next superset snapshot diffs against "Hi there".
        let effects = recon.apply(
            &event("r1", "main", ChatEventState::Delta, Some("Hi there!")),
            Some("main"),
        );
        assert_eq!(chunks(&effects), vec!["!"]);
    }

    #[test]
    fn equal_length_snapshot_emits_nothing() {
        let mut recon = StreamReconstructor::new();
        recon.begin("r1".into(), "main".into());
        recon.apply(&event("r1", "main", ChatEventState::Delta, Some("Hi")), Some("main"));
        let effects = recon.apply(&event("r1", "main", ChatEventState::Delta, Some("Hi")), Some("main"));
        assert!(effects.is_empty());
    }

    #[test]
    fn foreign_session_marks_unread_and_leaves_run_alone() {
        let mut recon = StreamReconstructor::new();
        recon.begin("r1".into(), "A".into());
        recon.apply(&event("r1", "A", ChatEventState::Delta, Some("Hi")), Some("A"));

        let effects = recon.apply(&event("r2", "B", ChatEventState::Delta, Some("other")), Some("A"));
        assert_eq!(
            effects,
            vec![RunEffect::Unread { session_key: "B".into() }]
        );
        assert_eq!(recon.active_run_id(), Some("r1"));

        // r1 still streams normally afterwards.
        let effects = recon.apply(&event("r1", "A", ChatEventState::Delta, Some("Hi!")), Some("A"));
        assert_eq!(chunks(&effects), vec!["!"]);
    }

    #[test]
    fn foreign_terminal_event_for_active_run_discards_silently() {
        let mut recon = StreamReconstructor::new();
        recon.begin("r1".into(), "A".into());

        let effects = recon.apply(&event("r1", "B", ChatEventState::Final, Some("leak")), Some("A"));
        assert_eq!(
            effects,
            vec![RunEffect::Unread { session_key: "B".into() }]
        );
        assert!(recon.active_run_id().is_none(), "run state dropped, no visible update");
    }

    #[test]
    fn event_without_active_run_only_marks_foreign_unread() {
        let mut recon = StreamReconstructor::new();
        let effects = recon.apply(&event("r9", "B", ChatEventState::Delta, Some("x")), Some("A"));
        assert_eq!(
            effects,
            vec![RunEffect::Unread { session_key: "B".into() }]
        );
        let effects = recon.apply(&event("r9", "A", ChatEventState::Delta, Some("x")), Some("A"));
        assert!(effects.is_empty());
    }

    #[test]
    fn run_detaches_when_its_session_loses_focus() {
        let mut recon = StreamReconstructor::new();
        recon.begin("r1".into(), "main".into());
        recon.apply(&event("r1", "main", ChatEventState::Delta, Some("Hi")), Some("main"));

        // The user switched to "B"; the run's own terminal event must not
        // render anywhere, only flag "main" as unread.
        let effects = recon.apply(
            &event("r1", "main", ChatEventState::Final, Some("Hi there!")),
            Some("B"),
        );
        assert_eq!(
            effects,
            vec![RunEffect::Unread { session_key: "main".into() }]
        );
        assert!(recon.active_run_id().is_none());
    }

    #[test]
    fn aborted_finalizes_with_buffered_text() {
        let mut recon = StreamReconstructor::new();
        recon.begin("r1".into(), "main".into());
        recon.apply(&event("r1", "main", ChatEventState::Delta, Some("partial")), Some("main"));

        let mut aborted = event("r1", "main", ChatEventState::Aborted, None);
        aborted.error_message = Some("interrupted".into());
        let effects = recon.apply(&aborted, Some("main"));
        match &effects[..] {
            [RunEffect::Finalized { text, status, error_message, .. }] => {
                assert_eq!(text, "partial");
                assert_eq!(*status, RunStatus::Aborted);
                assert_eq!(error_message.as_deref(), Some("interrupted"));
            }
            other => panic!("expected finalize, got {other:?}"),
        }
    }

    #[test]
    fn begin_supersedes_previous_run() {
        let mut recon = StreamReconstructor::new();
        let first = recon.begin("r1".into(), "main".into());
        let second = recon.begin("r2".into(), "main".into());
        assert_ne!(first, second);
        assert_eq!(recon.active_run_id(), Some("r2"));

        // Events for the superseded run are ignored.
        let effects = recon.apply(&event("r1", "main", ChatEventState::Delta, Some("late")), Some("main"));
        assert!(effects.is_empty());
    }

    proptest! {
        /// For any monotone snapshot sequence, the concatenated chunks equal
        /// the final snapshot and no chunk is emitted twice.
        #[test]
        fn chunk_concatenation_equals_final(parts in proptest::collection::vec("[a-zA-Z0-9 ]{0,8}", 1..12)) {
            let mut recon = StreamReconstructor::new();
            recon.begin("r1".into(), "main".into());

            let mut snapshot = String::new();
            let mut emitted = String::new();
            for part in &parts {
                snapshot.push_str(part);
                let effects = recon.apply(
                    &event("r1", "main", ChatEventState::Delta, Some(&snapshot)),
                    Some("main"),
                );
                for c in chunks(&effects) {
                    emitted.push_str(c);
                }
            }
            let effects = recon.apply(
                &event("r1", "main", ChatEventState::Final, Some(&snapshot)),
                Some("main"),
            );
            for c in chunks(&effects) {
                emitted.push_str(c);
            }
            prop_assert_eq!(emitted, snapshot.clone());
            match effects.last() {
                Some(RunEffect::Finalized { text, .. }) => prop_assert_eq!(text, &snapshot),
                other => prop_assert!(false, "expected finalize, got {:?}", other),
            }
        }
    }
}
