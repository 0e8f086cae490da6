//! The bus: one owning context for store, registry, router, subscriptions,
//! collision detection and tool adapters.
//!
//! Every write goes through [`Bus::append`] (or a helper built on it) so that
//! collision notifications raised by an append are written right after it.
//! Several buses can live in one process; nothing here is global.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapters::AdapterRegistry;
use crate::collision::{CollisionDetector, CollisionRecord};
use crate::config::DaemonConfig;
use crate::error::{BusError, BusResult};
use crate::events::{Event, EventDraft, EventFilter, EventStore, EventType, HookEvent};
use crate::messaging::{MessageRouter, OutgoingMessage};
use crate::relay::{ControlAction, ControlFrame, RelayBridge, RelayHealth};
use crate::sessions::{
    validate_identity, Session, SessionMeta, SessionProjection, SessionRegistry, SessionStatus, ToolKind,
};
use crate::subscriptions::{Subscription, SubscriptionManager};

/// Sessions touched by one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub idled: Vec<String>,
    pub archived: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusHealth {
    pub head: u64,
    pub events: u64,
    pub writable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
    /// Session counts keyed by status name.
    pub sessions: BTreeMap<String, usize>,
    pub subscribers: usize,
    pub collisions: usize,
    pub relay: RelayHealth,
    pub started_at: DateTime<Utc>,
}

pub struct Bus {
    store: Arc<EventStore>,
    registry: Arc<SessionRegistry>,
    router: MessageRouter,
    subscriptions: Arc<SubscriptionManager>,
    collisions: Arc<CollisionDetector>,
    adapters: AdapterRegistry,
    relay: RwLock<Option<Arc<RelayBridge>>>,
    started_at: DateTime<Utc>,
}

impl Bus {
    pub fn open(config: &DaemonConfig) -> anyhow::Result<Self> {
        Self::open_at(&config.db_path, config.collision_window(), config.subscriber_buffer)
    }

    pub fn open_at(
        path: impl AsRef<Path>,
        collision_window: Duration,
        subscriber_buffer: usize,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(EventStore::open(path)?);
        store.add_projection(Arc::new(SessionProjection));

        let collisions = Arc::new(CollisionDetector::new(collision_window));
        let recent = EventFilter {
            types: vec![EventType::FileEdit],
            since: Some(Utc::now() - collisions.window()),
            ..Default::default()
        };
        let primed = collisions.prime(store.query(&recent)?.iter());
        tracing::debug!(primed, paths = collisions.tracked_paths(), "Collision detector primed");

        let subscriptions = Arc::new(SubscriptionManager::new(subscriber_buffer));
        store.add_listener(subscriptions.clone());
        store.add_listener(collisions.clone());

        let registry = Arc::new(SessionRegistry::new(store.clone()));
        let router = MessageRouter::new(registry.clone(), store.clone());

        tracing::info!(head = store.head()?, "Bus opened");

        Ok(Self {
            store,
            registry,
            router,
            subscriptions,
            collisions,
            adapters: AdapterRegistry::new(),
            relay: RwLock::new(None),
            started_at: Utc::now(),
        })
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn attach_relay(&self, bridge: Arc<RelayBridge>) {
        if let Ok(mut slot) = self.relay.write() {
            *slot = Some(bridge);
        }
    }

    pub fn relay(&self) -> Option<Arc<RelayBridge>> {
        self.relay.read().ok().and_then(|slot| slot.clone())
    }

    // =========================================================================
    // writes
    // =========================================================================

    /// Append one event, then any collision notifications it caused.
    pub fn append(&self, draft: EventDraft) -> BusResult<Arc<Event>> {
        let event = self.store.append(draft)?;
        self.flush_collisions();
        Ok(event)
    }

    fn flush_collisions(&self) {
        for record in self.collisions.take_pending() {
            let [first, second] = record.sessions();
            tracing::info!(path = %record.path, first, second, "Edit collision");
            if let Err(e) = self.store.append(record.notification(self.collisions.window())) {
                tracing::error!(error = %e, collision = record.id, "Failed to append collision notice");
            }
        }
    }

    /// Ingest a normalized hook event. Messages go through the router.
    ///
    /// The origin must be a plain local session id: reserved `_` names and
    /// `name:DEVICE` ids belong to the daemon and the relay.
    pub fn ingest(&self, mut hook: HookEvent) -> BusResult<Arc<Event>> {
        hook.origin = validate_identity(&hook.origin)?.to_string();
        if hook.event_type == EventType::Message {
            return self.send(message_from_hook(hook)?);
        }
        self.append(hook.into_draft())
    }

    /// Normalize a native payload with the adapter for `tool` and ingest the
    /// result. `origin` replaces whatever identity the payload carries.
    pub fn ingest_native(
        &self,
        tool: ToolKind,
        origin: Option<&str>,
        native: &Value,
    ) -> BusResult<Vec<Arc<Event>>> {
        let hooks = self.adapters.normalize(tool, native)?;
        let mut appended = Vec::with_capacity(hooks.len());
        for mut hook in hooks {
            if let Some(origin) = origin {
                hook.origin = origin.to_string();
            }
            appended.push(self.ingest(hook)?);
        }
        Ok(appended)
    }

    pub fn send(&self, message: OutgoingMessage) -> BusResult<Arc<Event>> {
        let draft = self.router.route(message)?;
        self.append(draft)
    }

    pub fn register(&self, id: &str, tool: ToolKind, meta: SessionMeta) -> BusResult<Session> {
        self.registry.register(id, tool, meta)
    }

    pub fn update_status(&self, id: &str, status: SessionStatus) -> BusResult<Session> {
        self.registry.update_status(id, status)
    }

    pub fn mark_idle(&self, id: &str, reason: &str) -> BusResult<bool> {
        self.registry.mark_idle(id, reason)
    }

    /// Idle quiet sessions and archive long-gone ones. Sessions in `busy`
    /// (bound to a live connection) are never idled.
    pub fn sweep(
        &self,
        now: DateTime<Utc>,
        idle_after: Duration,
        archive_after: Duration,
        busy: &HashSet<String>,
    ) -> BusResult<SweepReport> {
        let idle_cutoff = now - chrono::Duration::from_std(idle_after).unwrap_or_else(|_| chrono::Duration::zero());
        let archive_cutoff =
            now - chrono::Duration::from_std(archive_after).unwrap_or_else(|_| chrono::Duration::zero());
        let idled = self.registry.sweep_idle(idle_cutoff, busy)?;
        let archived = self.registry.archive_stale(archive_cutoff)?;
        Ok(SweepReport { idled, archived })
    }

    /// Clear the log and every projection. Collision state and subscriber
    /// queues are cleared through their listeners.
    pub fn reset(&self) -> BusResult<u64> {
        let removed = self.store.reset()?;
        tracing::warn!(removed, "Bus reset");
        Ok(removed)
    }

    /// Ask another device, through the relay, to act on one of its sessions.
    pub fn relay_control(&self, action: ControlAction, session: &str) -> BusResult<ControlFrame> {
        let bridge = self
            .relay()
            .ok_or_else(|| BusError::RelayDisconnected("relay is disabled".to_string()))?;
        bridge.send_control(action, session)
    }

    pub fn acknowledge_collision(&self, id: u64) -> BusResult<()> {
        if self.collisions.acknowledge(id) {
            Ok(())
        } else {
            Err(BusError::InvalidRequest(format!("unknown collision {}", id)))
        }
    }

    // =========================================================================
    // reads
    // =========================================================================

    pub fn query(&self, filter: &EventFilter) -> BusResult<Vec<Event>> {
        self.store.query(filter)
    }

    pub fn sessions(&self, status: Option<SessionStatus>) -> BusResult<Vec<Session>> {
        self.registry.list(status)
    }

    pub fn resolve(&self, name: &str) -> BusResult<Session> {
        self.registry.resolve(name)
    }

    /// Live subscription, optionally replaying stored events after `from`.
    pub fn subscribe(&self, filter: &EventFilter, from: Option<u64>) -> BusResult<Subscription> {
        match from {
            Some(cursor) => self.subscriptions.subscribe_from(&self.store, filter, cursor),
            None => self.subscriptions.subscribe(filter),
        }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.subscriptions.unsubscribe(id)
    }

    pub fn collisions(&self) -> Vec<CollisionRecord> {
        self.collisions.records()
    }

    pub fn health(&self) -> BusResult<BusHealth> {
        let mut sessions: BTreeMap<String, usize> = SessionStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for session in self.registry.list(None)? {
            *sessions.entry(session.status.as_str().to_string()).or_default() += 1;
        }

        Ok(BusHealth {
            head: self.store.head()?,
            events: self.store.count()?,
            writable: self.store.is_writable(),
            store_error: self.store.failure(),
            sessions,
            subscribers: self.subscriptions.len(),
            collisions: self.collisions.records().len(),
            relay: self
                .relay()
                .map(|bridge| bridge.health())
                .unwrap_or_else(RelayHealth::disabled),
            started_at: self.started_at,
        })
    }
}

/// A hook-submitted message payload uses the same fields as [`OutgoingMessage`].
fn message_from_hook(hook: HookEvent) -> BusResult<OutgoingMessage> {
    let mut payload = match hook.payload {
        Value::Object(map) => map,
        Value::String(body) => {
            let mut map = serde_json::Map::new();
            map.insert("body".into(), Value::String(body));
            map
        }
        Value::Null => serde_json::Map::new(),
        other => {
            return Err(BusError::InvalidRequest(format!(
                "message payload must be an object, got {}",
                other
            )))
        }
    };
    payload.insert("from".into(), Value::String(hook.origin));

    let mut message: OutgoingMessage = serde_json::from_value(Value::Object(payload))
        .map_err(|e| BusError::InvalidRequest(format!("bad message payload: {}", e)))?;
    if message.thread.is_none() {
        message.thread = hook.thread;
    }
    if message.client_timestamp.is_none() {
        message.client_timestamp = hook.client_timestamp;
    }
    Ok(message)
}
