//! Message routing: turns an [`OutgoingMessage`] into a `message` event with
//! its targets resolved.
//!
//! Targets are computed once, at append time, from a registry snapshot and
//! stored in the payload; they are never recomputed from later state.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use super::mentions::extract_mentions;
use super::types::{AddressingMode, Intent, MessagePayload, OutgoingMessage};
use crate::error::{BusError, BusResult};
use crate::events::{is_system_origin, Event, EventDraft, EventFilter, EventStore, EventType};
use crate::sessions::SessionRegistry;

pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    store: Arc<EventStore>,
}

impl MessageRouter {
    pub fn new(registry: Arc<SessionRegistry>, store: Arc<EventStore>) -> Self {
        Self { registry, store }
    }

    /// Resolve addressing and build the event to append.
    pub fn route(&self, message: OutgoingMessage) -> BusResult<EventDraft> {
        let from = message.from.trim().to_string();
        if from.is_empty() {
            return Err(BusError::RoutingFailed("message has no sender".to_string()));
        }
        let body = message.body.trim().to_string();
        if body.is_empty() && message.intent.is_none() {
            return Err(BusError::RoutingFailed(
                "message has no body and no intent".to_string(),
            ));
        }
        let intent = message.intent.unwrap_or_default();
        if intent == Intent::Ack && message.reply_to.is_none() {
            return Err(BusError::RoutingFailed("ack requires reply_to".to_string()));
        }

        let parent = match message.reply_to {
            Some(seq) => Some(self.parent_message(seq)?),
            None => None,
        };
        let thread = message
            .thread
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| parent.as_ref().and_then(|p| p.thread.clone()));

        let mut mentions = message.mentions.clone();
        for name in extract_mentions(&body) {
            if !mentions.contains(&name) {
                mentions.push(name);
            }
        }

        let mode = match message.mode {
            Some(mode) => mode,
            None if !mentions.is_empty() => AddressingMode::Mentions,
            None if thread.is_some() || parent.is_some() => AddressingMode::Thread,
            None => AddressingMode::Broadcast,
        };

        let mut warnings = Vec::new();
        let (mode, targets) = match mode {
            AddressingMode::Mentions => {
                let targets = self.resolve_mentions(&from, &mentions, &mut warnings)?;
                (mode, targets)
            }
            AddressingMode::Thread => {
                let participants = self.thread_participants(&from, thread.as_deref(), parent.as_ref())?;
                if participants.is_empty() {
                    // Nobody else in the thread yet.
                    (AddressingMode::Broadcast, self.broadcast_targets(&from)?)
                } else {
                    (mode, participants)
                }
            }
            AddressingMode::Broadcast => (mode, self.broadcast_targets(&from)?),
        };

        if !warnings.is_empty() {
            tracing::warn!(from = %from, warnings = ?warnings, "Some mentions could not be resolved");
        }

        let payload = MessagePayload {
            from: from.clone(),
            body,
            mode,
            mentions,
            targets: targets.into_iter().collect(),
            intent,
            reply_to: message.reply_to,
            warnings,
            context: message.context,
        };
        let payload = serde_json::to_value(&payload)
            .map_err(|e| BusError::RoutingFailed(format!("unencodable payload: {}", e)))?;

        let mut draft = EventDraft::new(EventType::Message, from, payload).with_thread(thread);
        if let Some(ts) = message.client_timestamp {
            draft = draft.with_client_timestamp(ts);
        }
        Ok(draft)
    }

    fn parent_message(&self, seq: u64) -> BusResult<Event> {
        match self.store.get(seq)? {
            Some(event) if event.event_type == EventType::Message => Ok(event),
            Some(_) => Err(BusError::RoutingFailed(format!(
                "reply_to {} is not a message",
                seq
            ))),
            None => Err(BusError::RoutingFailed(format!(
                "reply_to {} does not exist",
                seq
            ))),
        }
    }

    /// Resolve every mention; unresolvable ones become warnings.
    ///
    /// Fails only when there is nothing to resolve.
    fn resolve_mentions(
        &self,
        from: &str,
        mentions: &[String],
        warnings: &mut Vec<String>,
    ) -> BusResult<BTreeSet<String>> {
        if mentions.is_empty() {
            return Err(BusError::RoutingFailed(
                "mention addressing without any mentions".to_string(),
            ));
        }

        let mut targets = BTreeSet::new();
        for name in mentions {
            match self.registry.resolve(name) {
                Ok(session) => {
                    if session.id != from {
                        targets.insert(session.id);
                    }
                }
                Err(e @ (BusError::UnknownSession(_) | BusError::AmbiguousSession { .. })) => {
                    warnings.push(e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        if targets.is_empty() {
            tracing::debug!(from, warnings = warnings.len(), "No mention resolved");
        }
        Ok(targets)
    }

    fn broadcast_targets(&self, from: &str) -> BusResult<BTreeSet<String>> {
        Ok(self
            .registry
            .reachable()?
            .into_iter()
            .map(|s| s.id)
            .filter(|id| id != from)
            .collect())
    }

    /// Senders and recipients of earlier messages in the thread, plus the
    /// parent's sender and recipients.
    fn thread_participants(
        &self,
        from: &str,
        thread: Option<&str>,
        parent: Option<&Event>,
    ) -> BusResult<BTreeSet<String>> {
        let mut participants = BTreeSet::new();

        if let Some(thread) = thread {
            let history = self.store.query(
                &EventFilter::new()
                    .types([EventType::Message])
                    .thread(thread),
            )?;
            for event in &history {
                collect_participants(event, &mut participants);
            }
        }
        if let Some(parent) = parent {
            collect_participants(parent, &mut participants);
        }

        participants.remove(from);
        participants.retain(|id| !is_system_origin(id));
        Ok(participants)
    }
}

fn collect_participants(event: &Event, into: &mut BTreeSet<String>) {
    into.insert(event.origin.clone());
    if let Some(targets) = event.payload.get("targets").and_then(Value::as_array) {
        into.extend(targets.iter().filter_map(Value::as_str).map(str::to_string));
    }
}

#[cfg(test)]
mod tests {
    //! Coverage:
    //! - validation (no sender, empty body without intent, ack without reply_to)
    //! - mention routing with partial and failed resolution
    //! - broadcast snapshot of reachable sessions, empty broadcast allowed
    //! - thread participants, reply_to thread inheritance, fallback to broadcast
    //! - deterministic target ordering
    //! - routing never appends; only the bus does

    use super::*;
    use crate::sessions::{SessionMeta, SessionProjection, SessionStatus, ToolKind};
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        store: Arc<EventStore>,
        registry: Arc<SessionRegistry>,
        router: MessageRouter,
    }

    fn setup() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(EventStore::open(tmp.path().join("bus.db")).unwrap());
        store.add_projection(Arc::new(SessionProjection));
        let registry = Arc::new(SessionRegistry::new(store.clone()));
        let router = MessageRouter::new(registry.clone(), store.clone());
        Fixture {
            _tmp: tmp,
            store,
            registry,
            router,
        }
    }

    impl Fixture {
        fn session(&self, id: &str, status: SessionStatus) {
            self.registry
                .register(id, ToolKind::Claude, SessionMeta::default())
                .unwrap();
            self.registry.update_status(id, status).unwrap();
        }

        /// Route and append, as the bus does.
        fn post(&self, message: OutgoingMessage) -> BusResult<Arc<Event>> {
            let draft = self.router.route(message)?;
            self.store.append(draft)
        }

        fn send(&self, message: OutgoingMessage) -> MessagePayload {
            let event = self.post(message).unwrap();
            MessagePayload::from_value(&event.payload).unwrap()
        }
    }

    // =========================================================================
    // validation
    // =========================================================================

    #[test]
    fn test_rejects_missing_sender() {
        let fx = setup();
        let err = fx.router.route(OutgoingMessage::new("  ", "hi")).unwrap_err();
        assert!(matches!(err, BusError::RoutingFailed(_)));
    }

    #[test]
    fn test_rejects_empty_body_without_intent() {
        let fx = setup();
        let err = fx.router.route(OutgoingMessage::new("a", "   ")).unwrap_err();
        assert!(matches!(err, BusError::RoutingFailed(_)));

        // A bare intent is enough.
        fx.session("b", SessionStatus::Listening);
        let draft = fx
            .router
            .route(OutgoingMessage::new("a", "").intent(Intent::Request))
            .unwrap();
        assert_eq!(draft.payload["intent"], "request");
    }

    #[test]
    fn test_ack_requires_reply_to() {
        let fx = setup();
        let err = fx
            .router
            .route(OutgoingMessage::new("a", "ok").intent(Intent::Ack))
            .unwrap_err();
        assert!(err.to_string().contains("reply_to"));
    }

    #[test]
    fn test_reply_to_must_be_message() {
        let fx = setup();
        fx.session("a", SessionStatus::Active);
        let status_seq = fx.store.head().unwrap();

        let err = fx
            .router
            .route(OutgoingMessage::new("a", "re").reply_to(status_seq))
            .unwrap_err();
        assert!(err.to_string().contains("not a message"));

        let err = fx
            .router
            .route(OutgoingMessage::new("a", "re").reply_to(9999))
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    // =========================================================================
    // mentions
    // =========================================================================

    #[test]
    fn test_mentions_resolve_and_sort() {
        let fx = setup();
        fx.session("alpha", SessionStatus::Listening);
        fx.session("charlie", SessionStatus::Idle);
        fx.session("bravo", SessionStatus::Listening);

        let payload = fx.send(OutgoingMessage::new("alpha", "@charlie and @bravo: look"));
        assert_eq!(payload.mode, AddressingMode::Mentions);
        assert_eq!(payload.targets, vec!["bravo", "charlie"]);
        assert_eq!(payload.mentions, vec!["charlie", "bravo"]);
        assert!(payload.warnings.is_empty());
    }

    #[test]
    fn test_route_only_builds_the_draft() {
        let fx = setup();
        fx.session("alpha", SessionStatus::Listening);
        fx.session("bravo", SessionStatus::Listening);
        let head = fx.store.head().unwrap();

        let draft = fx.router.route(OutgoingMessage::new("alpha", "@bravo hi")).unwrap();
        assert_eq!(draft.event_type, EventType::Message);
        assert_eq!(fx.store.head().unwrap(), head);
    }

    #[test]
    fn test_unknown_mention_becomes_warning() {
        let fx = setup();
        fx.session("alpha", SessionStatus::Listening);
        fx.session("bravo", SessionStatus::Listening);

        let payload = fx.send(OutgoingMessage::new("alpha", "@bravo @zulu hi"));
        assert_eq!(payload.targets, vec!["bravo"]);
        assert_eq!(payload.warnings.len(), 1);
        assert!(payload.warnings[0].contains("zulu"));
    }

    #[test]
    fn test_all_mentions_unknown_still_appended() {
        let fx = setup();
        fx.session("alpha", SessionStatus::Listening);
        let payload = fx.send(OutgoingMessage::new("alpha", "@zulu hi"));
        assert_eq!(payload.mode, AddressingMode::Mentions);
        assert!(payload.targets.is_empty());
        assert_eq!(payload.warnings.len(), 1);
    }

    #[test]
    fn test_explicit_mentions_and_prefix() {
        let fx = setup();
        fx.session("bravo-reviewer", SessionStatus::Idle);
        let payload = fx.send(OutgoingMessage::new("alpha", "please review").mention("bravo"));
        assert_eq!(payload.targets, vec!["bravo-reviewer"]);
    }

    // =========================================================================
    // broadcast
    // =========================================================================

    #[test]
    fn test_broadcast_targets_reachable_sessions_except_sender() {
        let fx = setup();
        fx.session("alpha", SessionStatus::Active);
        fx.session("bravo", SessionStatus::Listening);
        fx.session("charlie", SessionStatus::Idle);
        fx.session("delta", SessionStatus::Stopped);

        let payload = fx.send(OutgoingMessage::new("alpha", "standup"));
        assert_eq!(payload.mode, AddressingMode::Broadcast);
        assert_eq!(payload.targets, vec!["bravo"]);
    }

    #[test]
    fn test_broadcast_with_no_listeners_succeeds() {
        let fx = setup();
        let payload = fx.send(OutgoingMessage::new("alpha", "anyone?"));
        assert_eq!(payload.mode, AddressingMode::Broadcast);
        assert!(payload.targets.is_empty());
    }

    #[test]
    fn test_forced_broadcast_ignores_thread() {
        let fx = setup();
        fx.session("bravo", SessionStatus::Listening);
        let payload = fx.send(OutgoingMessage::new("alpha", "all").in_thread("t").broadcast());
        assert_eq!(payload.mode, AddressingMode::Broadcast);
        assert_eq!(payload.targets, vec!["bravo"]);
    }

    // =========================================================================
    // threads
    // =========================================================================

    #[test]
    fn test_thread_reply_targets_participants() {
        let fx = setup();
        fx.session("alpha", SessionStatus::Listening);
        fx.session("bravo", SessionStatus::Listening);
        fx.session("charlie", SessionStatus::Listening);
        fx.session("delta", SessionStatus::Listening);

        fx.send(OutgoingMessage::new("alpha", "@bravo start").in_thread("t1"));
        fx.send(OutgoingMessage::new("bravo", "@charlie join").in_thread("t1"));

        let payload = fx.send(OutgoingMessage::new("charlie", "done").in_thread("t1"));
        assert_eq!(payload.mode, AddressingMode::Thread);
        assert_eq!(payload.targets, vec!["alpha", "bravo"]);
    }

    #[test]
    fn test_mentions_override_thread() {
        let fx = setup();
        fx.session("alpha", SessionStatus::Listening);
        fx.session("bravo", SessionStatus::Listening);
        fx.session("charlie", SessionStatus::Listening);
        fx.send(OutgoingMessage::new("alpha", "@bravo start").in_thread("t1"));

        let payload = fx.send(OutgoingMessage::new("bravo", "@charlie fyi").in_thread("t1"));
        assert_eq!(payload.mode, AddressingMode::Mentions);
        assert_eq!(payload.targets, vec!["charlie"]);
    }

    #[test]
    fn test_reply_inherits_thread() {
        let fx = setup();
        fx.session("alpha", SessionStatus::Listening);
        fx.session("bravo", SessionStatus::Listening);

        let parent = fx
            .post(
                OutgoingMessage::new("alpha", "@bravo can you check?")
                    .in_thread("t1")
                    .intent(Intent::Request),
            )
            .unwrap();

        let child = fx
            .post(
                OutgoingMessage::new("bravo", "")
                    .intent(Intent::Ack)
                    .reply_to(parent.seq),
            )
            .unwrap();
        assert_eq!(child.thread.as_deref(), Some("t1"));
        let payload = MessagePayload::from_value(&child.payload).unwrap();
        assert_eq!(payload.intent, Intent::Ack);
        assert_eq!(payload.reply_to, Some(parent.seq));
        assert_eq!(payload.targets, vec!["alpha"]);
    }

    #[test]
    fn test_reply_without_thread_targets_parent_sender() {
        let fx = setup();
        fx.session("alpha", SessionStatus::Listening);
        fx.session("bravo", SessionStatus::Listening);
        fx.session("charlie", SessionStatus::Listening);

        let parent = fx.post(OutgoingMessage::new("alpha", "@bravo hi")).unwrap();
        let payload = fx.send(OutgoingMessage::new("bravo", "hello back").reply_to(parent.seq));
        assert_eq!(payload.mode, AddressingMode::Thread);
        assert_eq!(payload.targets, vec!["alpha"]);
    }

    #[test]
    fn test_empty_thread_falls_back_to_broadcast() {
        let fx = setup();
        fx.session("bravo", SessionStatus::Listening);
        let payload = fx.send(OutgoingMessage::new("alpha", "kickoff").in_thread("new"));
        assert_eq!(payload.mode, AddressingMode::Broadcast);
        assert_eq!(payload.targets, vec!["bravo"]);
    }

    #[test]
    fn test_context_and_client_timestamp_pass_through() {
        let fx = setup();
        let ts = chrono::Utc::now() - chrono::Duration::seconds(5);
        let mut msg = OutgoingMessage::new("alpha", "x").context(json!({"file": "/a"}));
        msg.client_timestamp = Some(ts);
        let draft = fx.router.route(msg).unwrap();
        assert_eq!(draft.payload["context"]["file"], "/a");
        assert_eq!(draft.client_timestamp, Some(ts));
    }
}
