//! Relay bridge: mirrors local events to a broker and imports other devices'.
//!
//! Push: local, non-system events of the configured types after the push
//! cursor are published in batches as a retained frame on our device topic.
//! The cursor only advances after the broker accepts the frame.
//!
//! Pull: frames from other devices are applied in sequence order. Each event
//! is appended together with that device's pull cursor in one transaction,
//! so a replayed retained frame never imports an event twice. Imported
//! events carry a [`RelayOrigin`] and are never pushed again.
//!
//! Every frame also carries a [`DeviceState`] snapshot. Receivers mirror the
//! sender's sessions as `name:SHORT` entries, archive the ones it no longer
//! lists, and drop all of them when the sender reports a newer reset.
//!
//! Control frames on `{namespace}/control` let one device stop a session on
//! another; each sender's frames are applied at most once, by timestamp.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{watch, Notify};

use super::backoff::Backoff;
use super::transport::{Publish, RelayConnection, RelayError, RelayTransport};
use super::wire::{
    control_topic, device_from_topic, device_topic, short_id, wildcard_topic, ControlAction, ControlFrame,
    DeviceState, RelayFrame, SessionState, WireEvent,
};
use crate::config::RelayConfig;
use crate::db::KvStore;
use crate::error::{BusError, BusResult};
use crate::events::{is_system_origin, EventDraft, EventFilter, EventStore, EventType, RelayOrigin};
use crate::sessions::SessionRegistry;
use crate::subscriptions::SubscriptionManager;

const DEVICE_ID_KEY: &str = "relay.device_id";
const PUSH_CURSOR_KEY: &str = "relay.push_cursor";
const PULL_CURSOR_PREFIX: &str = "relay.pull_cursor.";
const REMOTE_RESET_PREFIX: &str = "relay.remote_reset.";
const CONTROL_SEEN_PREFIX: &str = "relay.control_seen.";

fn pull_cursor_key(device: &str) -> String {
    format!("{}{}", PULL_CURSOR_PREFIX, device)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Disabled,
    Connecting,
    Connected,
    Disconnected,
    Stopped,
}

/// Snapshot of the bridge for health reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayHealth {
    pub state: RelayState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub push_cursor: u64,
    /// Last imported remote sequence number per device id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pull_cursors: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_publish: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_receive: Option<DateTime<Utc>>,
    pub reconnects: u64,
    pub published: u64,
    pub pulled: u64,
}

impl RelayHealth {
    pub fn disabled() -> Self {
        Self {
            state: RelayState::Disabled,
            broker: None,
            namespace: None,
            device_id: None,
            short_id: None,
            last_error: None,
            push_cursor: 0,
            pull_cursors: BTreeMap::new(),
            last_publish: None,
            last_receive: None,
            reconnects: 0,
            published: 0,
            pulled: 0,
        }
    }
}

pub struct RelayBridge {
    store: Arc<EventStore>,
    registry: Arc<SessionRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    transport: Arc<dyn RelayTransport>,
    namespace: String,
    event_types: Vec<EventType>,
    batch_size: usize,
    backoff_base: Duration,
    backoff_cap: Duration,
    push_interval: Duration,
    device_id: String,
    short_id: String,
    health: RwLock<RelayHealth>,
    wake: Notify,
    /// Control frames waiting for the connection task.
    outbox: Mutex<Vec<ControlFrame>>,
}

impl RelayBridge {
    pub fn new(
        store: Arc<EventStore>,
        registry: Arc<SessionRegistry>,
        subscriptions: Arc<SubscriptionManager>,
        transport: Arc<dyn RelayTransport>,
        config: &RelayConfig,
    ) -> BusResult<Self> {
        let device_id = match store.kv_get(DEVICE_ID_KEY)? {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                store.kv_set(DEVICE_ID_KEY, &id)?;
                id
            }
        };
        let short_id = short_id(&device_id);
        let push_cursor = store.kv_get_u64(PUSH_CURSOR_KEY)?.unwrap_or(0);

        let health = RelayHealth {
            state: RelayState::Stopped,
            broker: Some(transport.describe()),
            namespace: Some(config.namespace.clone()),
            device_id: Some(device_id.clone()),
            short_id: Some(short_id.clone()),
            push_cursor,
            ..RelayHealth::disabled()
        };

        Ok(Self {
            store,
            registry,
            subscriptions,
            transport,
            namespace: config.namespace.clone(),
            event_types: config.event_types.clone(),
            batch_size: config.batch_size.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_secs(config.backoff_cap_secs),
            push_interval: Duration::from_secs(config.push_interval_secs.max(1)),
            device_id,
            short_id,
            health: RwLock::new(health),
            wake: Notify::new(),
            outbox: Mutex::new(Vec::new()),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn short_id(&self) -> &str {
        &self.short_id
    }

    pub fn health(&self) -> RelayHealth {
        let mut health = self
            .health
            .read()
            .map(|h| h.clone())
            .unwrap_or_else(|_| RelayHealth::disabled());
        match self.store.kv_prefix(PULL_CURSOR_PREFIX) {
            Ok(entries) => {
                health.pull_cursors = entries
                    .into_iter()
                    .filter_map(|(key, value)| {
                        let device = key.strip_prefix(PULL_CURSOR_PREFIX)?.to_string();
                        Some((device, value.parse().ok()?))
                    })
                    .collect();
            }
            Err(e) => tracing::debug!(error = %e, "Pull cursors unavailable"),
        }
        health
    }

    /// Ask the bridge to publish pending events now.
    pub fn request_push(&self) -> BusResult<()> {
        self.require_connected()?;
        self.wake.notify_one();
        Ok(())
    }

    /// Ask the device owning `session` (a `name:SHORT` id) to act on it.
    pub fn send_control(&self, action: ControlAction, session: &str) -> BusResult<ControlFrame> {
        let Some((target, short)) = session.trim().rsplit_once(':') else {
            return Err(BusError::InvalidRequest(format!(
                "'{}' is not a remote session (expected name:DEVICE)",
                session
            )));
        };
        if target.is_empty() || short.is_empty() {
            return Err(BusError::InvalidRequest(format!("malformed session id '{}'", session)));
        }
        if short.eq_ignore_ascii_case(&self.short_id) {
            return Err(BusError::InvalidRequest(format!(
                "'{}' belongs to this device",
                session
            )));
        }
        self.require_connected()?;

        let frame = ControlFrame {
            from_device: self.device_id.clone(),
            from_short: self.short_id.clone(),
            ts: Utc::now(),
            action,
            target: target.to_string(),
            target_device: short.to_uppercase(),
        };
        if let Ok(mut outbox) = self.outbox.lock() {
            outbox.push(frame.clone());
        }
        self.wake.notify_one();
        Ok(frame)
    }

    fn require_connected(&self) -> BusResult<()> {
        let health = self.health();
        if health.state != RelayState::Connected {
            return Err(BusError::RelayDisconnected(
                health
                    .last_error
                    .unwrap_or_else(|| format!("relay is {:?}", health.state).to_lowercase()),
            ));
        }
        Ok(())
    }

    /// Connect, serve, and reconnect with backoff until `shutdown` is set.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.backoff_base, self.backoff_cap);
        let mut connected_before = false;
        let will = Publish::new(device_topic(&self.namespace, &self.device_id), "", true);

        tracing::info!(
            broker = %self.transport.describe(),
            namespace = %self.namespace,
            device = %self.short_id,
            "Relay bridge starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(RelayState::Connecting, None);

            match self.transport.connect(Some(will.clone())).await {
                Ok(mut conn) => {
                    backoff.reset();
                    if connected_before {
                        self.update_health(|h| h.reconnects += 1);
                    }
                    connected_before = true;
                    self.set_state(RelayState::Connected, None);
                    tracing::info!(broker = %self.transport.describe(), "Relay connected");

                    match self.serve(conn.as_mut(), &mut shutdown).await {
                        Ok(()) => {
                            let _ = conn.close().await;
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Relay connection lost");
                            self.set_state(RelayState::Disconnected, Some(e.to_string()));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt = backoff.attempts() + 1, "Relay connect failed");
                    self.set_state(RelayState::Disconnected, Some(e.to_string()));
                }
            }

            let delay = backoff.next_delay();
            tracing::debug!(?delay, "Relay reconnect scheduled");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.set_state(RelayState::Stopped, None);
        tracing::info!("Relay bridge stopped");
    }

    /// Service one connection. `Ok` means shutdown was requested.
    async fn serve(
        &self,
        conn: &mut dyn RelayConnection,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), RelayError> {
        conn.subscribe(&wildcard_topic(&self.namespace)).await?;

        let mut local = self.subscriptions.subscribe(&self.push_filter(0))?;
        self.push_pending(conn).await?;

        let mut ticker = tokio::time::interval(self.push_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                item = local.next() => {
                    if item.is_none() {
                        return Err(RelayError::Closed);
                    }
                    // The store is the source of truth; drain and push by cursor.
                    while local.try_next().is_some() {}
                    self.push_pending(conn).await?;
                }
                incoming = conn.recv() => {
                    let Some(message) = incoming else {
                        return Err(RelayError::Closed);
                    };
                    if let Err(e) = self.apply_message(&message) {
                        tracing::warn!(topic = %message.topic, error = %e, "Dropping relay message");
                    }
                }
                _ = self.wake.notified() => {
                    self.flush_control(conn).await?;
                    self.push_pending(conn).await?;
                }
                _ = ticker.tick() => {
                    // A quiet link still has to prove the broker is there.
                    if self.push_pending(conn).await? == 0 {
                        conn.ping().await?;
                    }
                }
            }
        }
    }

    fn push_filter(&self, after: u64) -> EventFilter {
        EventFilter {
            after_seq: Some(after),
            types: self.event_types.clone(),
            local_only: true,
            exclude_system: true,
            ..Default::default()
        }
    }

    /// Publish everything after the push cursor. Returns the number of events sent.
    pub async fn push_pending(&self, conn: &mut dyn RelayConnection) -> Result<usize, RelayError> {
        let mut total = 0;
        loop {
            let cursor = self.store.kv_get_u64(PUSH_CURSOR_KEY)?.unwrap_or(0);
            let mut filter = self.push_filter(cursor);
            filter.limit = Some(self.batch_size + 1);
            let mut events = self.store.query(&filter)?;
            if events.is_empty() {
                return Ok(total);
            }

            let has_more = events.len() > self.batch_size;
            events.truncate(self.batch_size);
            let last_seq = events.last().map_or(cursor, |e| e.seq);

            // Local bookkeeping about remote sessions stays local.
            events.retain(|e| !e.origin.contains(':'));
            if events.is_empty() {
                self.store.kv_set(PUSH_CURSOR_KEY, &last_seq.to_string())?;
                self.update_health(|h| h.push_cursor = last_seq);
                if has_more {
                    continue;
                }
                return Ok(total);
            }

            let frame = RelayFrame {
                device: self.device_id.clone(),
                short_id: self.short_id.clone(),
                events: events.iter().map(WireEvent::from).collect(),
                has_more,
                state: Some(self.build_state()?),
            };
            let payload = serde_json::to_string(&frame)?;
            let topic = device_topic(&self.namespace, &self.device_id);

            if let Err(e) = conn.publish(Publish::new(topic, payload, true)).await {
                self.update_health(|h| h.last_error = Some(e.to_string()));
                return Err(e);
            }
            self.store.kv_set(PUSH_CURSOR_KEY, &last_seq.to_string())?;

            let sent = events.len();
            total += sent;
            self.update_health(|h| {
                h.push_cursor = last_seq;
                h.published += sent as u64;
                h.last_publish = Some(Utc::now());
            });
            tracing::debug!(sent, cursor = last_seq, has_more, "Relay frame published");

            if !has_more {
                return Ok(total);
            }
        }
    }

    /// Publish queued control frames. Unsent frames stay queued for the next connection.
    async fn flush_control(&self, conn: &mut dyn RelayConnection) -> Result<(), RelayError> {
        let pending = match self.outbox.lock() {
            Ok(mut outbox) => std::mem::take(&mut *outbox),
            Err(_) => return Ok(()),
        };
        let topic = control_topic(&self.namespace);
        let mut queue = pending.into_iter();
        while let Some(frame) = queue.next() {
            let payload = serde_json::to_string(&frame)?;
            if let Err(e) = conn.publish(Publish::new(topic.clone(), payload, false)).await {
                if let Ok(mut outbox) = self.outbox.lock() {
                    let mut unsent: Vec<ControlFrame> = std::iter::once(frame).chain(queue).collect();
                    unsent.append(&mut outbox);
                    *outbox = unsent;
                }
                return Err(e);
            }
            tracing::info!(
                action = %frame.action,
                session = %frame.target,
                device = %frame.target_device,
                "Relay control sent"
            );
        }
        Ok(())
    }

    /// This device's local sessions and last reset, as advertised to peers.
    pub fn build_state(&self) -> Result<DeviceState, RelayError> {
        let sessions = self
            .registry
            .list(None)?
            .iter()
            .filter(|s| !s.is_remote() && !s.id.contains(':'))
            .map(SessionState::from)
            .collect();
        Ok(DeviceState {
            sessions,
            reset_ts: self.store.last_reset()?,
        })
    }

    /// Apply one broker message. Returns the number of events imported.
    pub fn apply_message(&self, message: &Publish) -> Result<usize, RelayError> {
        if message.topic == control_topic(&self.namespace) {
            self.apply_control(&message.payload)?;
            return Ok(0);
        }
        let Some(device) = device_from_topic(&self.namespace, &message.topic) else {
            return Ok(0);
        };
        if device == self.device_id {
            return Ok(0);
        }

        if message.payload.is_empty() {
            let archived = self.registry.archive_device(device)?;
            tracing::info!(device = %device, sessions = archived.len(), "Relay device gone");
            return Ok(0);
        }

        let frame: RelayFrame = serde_json::from_str(&message.payload)?;
        if frame.device != device {
            tracing::warn!(topic_device = %device, frame_device = %frame.device, "Relay frame device mismatch");
        }

        if let Some(reset_ts) = frame.state.as_ref().and_then(|s| s.reset_ts) {
            self.check_remote_reset(device, &frame.short_id, reset_ts)?;
        }

        let key = pull_cursor_key(device);
        let mut last = self.store.kv_get_u64(&key)?.unwrap_or(0);
        let max_remote = frame.events.iter().map(|e| e.seq).max().unwrap_or(0);

        // Remote sequence numbers never go backwards unless its log was recreated.
        if last > 0 && max_remote > 0 && max_remote < last {
            tracing::info!(device = %frame.short_id, remote = max_remote, cursor = last, "Relay cursor regression, resetting");
            self.registry.archive_device(device)?;
            self.store.kv_set(&key, "0")?;
            last = 0;
        }

        let mut events = frame.events;
        events.sort_by_key(|e| e.seq);

        let mut applied = 0;
        for wire in events {
            if wire.seq <= last {
                continue;
            }
            let seq = wire.seq;
            let draft = self.localize(wire, device, &frame.short_id);
            self.store.append_with(draft, |conn| {
                KvStore::new(conn).set(&key, &seq.to_string())
            })?;
            last = seq;
            applied += 1;
        }

        if applied > 0 {
            tracing::debug!(device = %frame.short_id, applied, "Relay events imported");
        }
        if let Some(state) = &frame.state {
            self.sync_sessions(device, &frame.short_id, &state.sessions)?;
        }
        self.update_health(|h| {
            h.pulled += applied as u64;
            h.last_receive = Some(Utc::now());
        });
        Ok(applied)
    }

    /// Forget a device's sessions once it reports a reset newer than the last one seen.
    fn check_remote_reset(&self, device: &str, short: &str, reset_ts: DateTime<Utc>) -> Result<(), RelayError> {
        let key = format!("{}{}", REMOTE_RESET_PREFIX, device);
        let seen = self
            .store
            .kv_get(&key)?
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|t| t.with_timezone(&Utc));
        if seen.is_some_and(|seen| reset_ts <= seen) {
            return Ok(());
        }
        let archived = self.registry.archive_device(device)?;
        self.store.kv_set(&key, &reset_ts.to_rfc3339())?;
        tracing::info!(device = %short, sessions = archived.len(), "Relay device reset");
        Ok(())
    }

    /// Mirror a device's advertised sessions. Returns how many entries changed.
    fn sync_sessions(&self, device: &str, short: &str, sessions: &[SessionState]) -> Result<usize, RelayError> {
        let mut listed = HashSet::new();
        let mut changed = 0;

        for remote in sessions {
            if remote.id.is_empty() || is_system_origin(&remote.id) || remote.id.contains(':') {
                continue;
            }
            let id = namespaced(&remote.id, short);
            listed.insert(id.clone());

            let differs = match self.registry.get(&id)? {
                None => true,
                Some(current) => {
                    current.status != remote.status
                        || current.tool != remote.tool
                        || current.directory != remote.directory
                        || remote.label.as_ref().is_some_and(|l| *l != current.label)
                }
            };
            if !differs {
                continue;
            }

            let mut payload = json!({
                "status": remote.status.as_str(),
                "tool": remote.tool.as_str(),
                "snapshot": true,
            });
            if let Some(label) = &remote.label {
                payload["label"] = json!(label);
            }
            if let Some(directory) = &remote.directory {
                payload["directory"] = json!(directory);
            }
            self.store.append(
                EventDraft::new(EventType::Status, id, payload)
                    .with_client_timestamp(remote.last_seen)
                    .with_relay(RelayOrigin {
                        device: device.to_string(),
                        short_id: short.to_string(),
                        remote_seq: 0,
                    }),
            )?;
            changed += 1;
        }

        for session in self.registry.list(None)? {
            if session.device.as_deref() == Some(device) && !listed.contains(&session.id) {
                self.registry.archive(&session.id)?;
                changed += 1;
            }
        }
        if changed > 0 {
            tracing::debug!(device = %short, changed, "Relay sessions synced");
        }
        Ok(changed)
    }

    fn apply_control(&self, payload: &str) -> Result<(), RelayError> {
        let frame: ControlFrame = serde_json::from_str(payload)?;
        if frame.from_device == self.device_id || !frame.target_device.eq_ignore_ascii_case(&self.short_id) {
            return Ok(());
        }

        let key = format!("{}{}", CONTROL_SEEN_PREFIX, frame.from_device);
        let seen = self.store.kv_get(&key)?.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
        let ts = frame.ts.timestamp_micros();
        if ts <= seen {
            tracing::debug!(from = %frame.from_short, "Ignoring replayed relay control");
            return Ok(());
        }
        self.store.kv_set(&key, &ts.to_string())?;

        match frame.action {
            ControlAction::Stop => {
                let by = format!("remote:{}", frame.from_short);
                if self.registry.stop(&frame.target, &by)? {
                    tracing::info!(session = %frame.target, from = %frame.from_short, "Session stopped by remote device");
                } else {
                    tracing::warn!(session = %frame.target, from = %frame.from_short, "Remote stop for unknown or stopped session");
                }
            }
            ControlAction::Start => {
                // Sessions are launched by their tool; there is nothing to start here.
                tracing::info!(session = %frame.target, from = %frame.from_short, "Remote start ignored");
            }
        }
        Ok(())
    }

    /// Rewrite a remote event into this device's naming.
    ///
    /// Remote session ids gain the remote short id as suffix; names carrying
    /// our own suffix lose it, so they match local sessions again.
    fn localize(&self, wire: WireEvent, device: &str, remote_short: &str) -> EventDraft {
        let origin = namespaced(&wire.origin, remote_short);
        let mut payload = wire.payload;

        if let Value::Object(map) = &mut payload {
            if let Some(Value::String(from)) = map.get_mut("from") {
                *from = namespaced(from, remote_short);
            }
            for field in ["targets", "mentions"] {
                if let Some(Value::Array(names)) = map.get_mut(field) {
                    for name in names.iter_mut() {
                        if let Value::String(s) = name {
                            *s = self.localize_target(s, remote_short);
                        }
                    }
                    if field == "targets" {
                        names.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
                    }
                }
            }
            // Remote sequence numbers mean nothing in the local log.
            if let Some(reply_to) = map.remove("reply_to") {
                map.insert("remote_reply_to".to_string(), reply_to);
            }
        }

        EventDraft::new(wire.event_type, origin, payload)
            .with_thread(wire.thread)
            .with_client_timestamp(wire.ts)
            .with_relay(RelayOrigin {
                device: device.to_string(),
                short_id: remote_short.to_string(),
                remote_seq: wire.seq,
            })
    }

    fn localize_target(&self, name: &str, remote_short: &str) -> String {
        if let Some((local, suffix)) = name.rsplit_once(':') {
            if suffix.eq_ignore_ascii_case(&self.short_id) {
                return local.to_string();
            }
        }
        namespaced(name, remote_short)
    }

    fn set_state(&self, state: RelayState, error: Option<String>) {
        self.update_health(|h| {
            h.state = state;
            if error.is_some() {
                h.last_error = error;
            }
        });
    }

    fn update_health(&self, f: impl FnOnce(&mut RelayHealth)) {
        if let Ok(mut health) = self.health.write() {
            f(&mut health);
        }
    }
}

/// `name` → `name:SHORT`, leaving system names and already-suffixed names alone.
fn namespaced(name: &str, short: &str) -> String {
    if name.is_empty() || is_system_origin(name) || name.contains(':') {
        name.to_string()
    } else {
        format!("{}:{}", name, short)
    }
}

#[cfg(test)]
mod tests {
    //! Coverage:
    //! - push: batching, cursor advance after publish, no re-publish of relayed events
    //! - pull: namespacing, own-suffix stripping, relay tagging, replay dedupe
    //! - device gone, cursor regression, own frames ignored
    //! - state snapshots: mirrored sessions, archival of unlisted ones, remote reset
    //! - control frames: stop applied once per send, start ignored, run-loop delivery
    //! - run loop: partition and reconnect without duplicates, local ops unaffected
    //! - run loop: a broker that stops answering is dropped even with nothing to push

    use super::*;
    use crate::relay::MemoryHub;
    use crate::sessions::{SessionMeta, SessionProjection, SessionStatus, ToolKind};
    use serde_json::json;
    use tempfile::TempDir;

    struct Node {
        _tmp: TempDir,
        store: Arc<EventStore>,
        registry: Arc<SessionRegistry>,
        bridge: Arc<RelayBridge>,
    }

    fn config(batch_size: usize) -> RelayConfig {
        RelayConfig {
            url: Some("memory".to_string()),
            namespace: "team".to_string(),
            enabled: true,
            event_types: vec![EventType::Message, EventType::Status, EventType::Lifecycle],
            batch_size,
            backoff_base_ms: 10,
            backoff_cap_secs: 1,
            push_interval_secs: 1,
        }
    }

    fn node(hub: &MemoryHub, batch_size: usize) -> Node {
        node_with(Arc::new(hub.transport()), batch_size)
    }

    fn node_with(transport: Arc<dyn RelayTransport>, batch_size: usize) -> Node {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(EventStore::open(tmp.path().join("bus.db")).unwrap());
        store.add_projection(Arc::new(SessionProjection));
        let subscriptions = Arc::new(SubscriptionManager::default());
        store.add_listener(subscriptions.clone());
        let registry = Arc::new(SessionRegistry::new(store.clone()));
        let bridge = Arc::new(
            RelayBridge::new(
                store.clone(),
                registry.clone(),
                subscriptions,
                transport,
                &config(batch_size),
            )
            .unwrap(),
        );
        Node {
            _tmp: tmp,
            store,
            registry,
            bridge,
        }
    }

    fn message(from: &str, body: &str, targets: &[&str]) -> EventDraft {
        EventDraft::new(
            EventType::Message,
            from,
            json!({"from": from, "body": body, "mode": "mentions", "targets": targets, "mentions": targets}),
        )
    }

    /// Imported messages, in log order.
    fn relayed(store: &EventStore) -> Vec<crate::events::Event> {
        store
            .query(&EventFilter::new().types([EventType::Message]))
            .unwrap()
            .into_iter()
            .filter(|e| e.is_relayed())
            .collect()
    }

    async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    // =========================================================================
    // push
    // =========================================================================

    #[tokio::test]
    async fn test_push_batches_and_advances_cursor() {
        let hub = MemoryHub::new();
        let a = node(&hub, 2);
        let mut watcher = hub.transport().connect(None).await.unwrap();
        watcher.subscribe("team/+").await.unwrap();
        let mut conn = hub.transport().connect(None).await.unwrap();

        for i in 0..5 {
            a.store.append(message("alpha", &format!("m{}", i), &[])).unwrap();
        }
        // Not in the pushed type set.
        a.store
            .append(EventDraft::new(EventType::FileEdit, "alpha", json!({"path": "/x"})))
            .unwrap();

        assert_eq!(a.bridge.push_pending(conn.as_mut()).await.unwrap(), 5);
        assert_eq!(a.bridge.push_pending(conn.as_mut()).await.unwrap(), 0);
        assert_eq!(a.bridge.health().push_cursor, 5);

        let mut frames = Vec::new();
        while let Ok(Some(msg)) =
            tokio::time::timeout(Duration::from_millis(50), watcher.recv()).await
        {
            frames.push(serde_json::from_str::<RelayFrame>(&msg.payload).unwrap());
        }
        assert_eq!(
            frames.iter().map(|f| (f.events.len(), f.has_more)).collect::<Vec<_>>(),
            vec![(2, true), (2, true), (1, false)]
        );
        assert_eq!(frames[0].device, a.bridge.device_id());
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_cursor() {
        let hub = MemoryHub::new();
        let a = node(&hub, 10);
        let mut conn = hub.transport().connect(None).await.unwrap();
        a.store.append(message("alpha", "hi", &[])).unwrap();

        hub.set_online(false);
        assert!(a.bridge.push_pending(conn.as_mut()).await.is_err());
        assert_eq!(a.store.kv_get_u64(PUSH_CURSOR_KEY).unwrap(), None);

        hub.set_online(true);
        let mut conn = hub.transport().connect(None).await.unwrap();
        assert_eq!(a.bridge.push_pending(conn.as_mut()).await.unwrap(), 1);
    }

    // =========================================================================
    // pull
    // =========================================================================

    fn frame_from(source: &Node, events: Vec<WireEvent>) -> Publish {
        let frame = RelayFrame {
            device: source.bridge.device_id().to_string(),
            short_id: source.bridge.short_id().to_string(),
            events,
            has_more: false,
            state: None,
        };
        Publish::new(
            device_topic("team", source.bridge.device_id()),
            serde_json::to_string(&frame).unwrap(),
            true,
        )
    }

    fn wire(seq: u64, draft: EventDraft) -> WireEvent {
        WireEvent {
            seq,
            ts: Utc::now(),
            event_type: draft.event_type,
            origin: draft.origin,
            payload: draft.payload,
            thread: draft.thread,
        }
    }

    #[tokio::test]
    async fn test_apply_namespaces_and_tags() {
        let hub = MemoryHub::new();
        let a = node(&hub, 10);
        let b = node(&hub, 10);
        let own = format!("gamma:{}", b.bridge.short_id());

        let msg = frame_from(
            &a,
            vec![wire(7, message("alpha", "hi", &[own.as_str(), "beta"]).with_thread(Some("t".into())))],
        );
        assert_eq!(b.bridge.apply_message(&msg).unwrap(), 1);

        let events = relayed(&b.store);
        assert_eq!(events.len(), 1);
        let e = &events[0];
        let short = a.bridge.short_id();
        assert_eq!(e.origin, format!("alpha:{}", short));
        assert_eq!(e.payload["from"], format!("alpha:{}", short));
        assert_eq!(e.payload["targets"], json!([format!("beta:{}", short), "gamma"]));
        assert_eq!(e.thread.as_deref(), Some("t"));
        let relay = e.relay.as_ref().unwrap();
        assert_eq!(relay.remote_seq, 7);
        assert_eq!(relay.device, a.bridge.device_id());

        // The remote sender now exists as a session.
        let session = b.registry.get(&format!("alpha:{}", short)).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.is_remote());
    }

    #[tokio::test]
    async fn test_replayed_frame_is_not_imported_twice() {
        let hub = MemoryHub::new();
        let a = node(&hub, 10);
        let b = node(&hub, 10);
        let msg = frame_from(
            &a,
            vec![wire(1, message("alpha", "one", &[])), wire(2, message("alpha", "two", &[]))],
        );

        assert_eq!(b.bridge.apply_message(&msg).unwrap(), 2);
        assert_eq!(b.bridge.apply_message(&msg).unwrap(), 0);
        assert_eq!(relayed(&b.store).len(), 2);
        let health = b.bridge.health();
        assert_eq!(health.pulled, 2);
        assert_eq!(health.pull_cursors.get(a.bridge.device_id()), Some(&2));
    }

    #[tokio::test]
    async fn test_imported_events_are_not_republished() {
        let hub = MemoryHub::new();
        let a = node(&hub, 10);
        let b = node(&hub, 10);
        b.bridge
            .apply_message(&frame_from(&a, vec![wire(1, message("alpha", "x", &[]))]))
            .unwrap();

        let mut conn = hub.transport().connect(None).await.unwrap();
        assert_eq!(b.bridge.push_pending(conn.as_mut()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_own_frames_and_foreign_topics_ignored() {
        let hub = MemoryHub::new();
        let a = node(&hub, 10);
        let own = frame_from(&a, vec![wire(1, message("alpha", "x", &[]))]);
        assert_eq!(a.bridge.apply_message(&own).unwrap(), 0);

        let foreign = Publish::new("elsewhere/dev", own.payload.clone(), true);
        assert_eq!(a.bridge.apply_message(&foreign).unwrap(), 0);
        assert!(relayed(&a.store).is_empty());
    }

    #[tokio::test]
    async fn test_empty_payload_archives_device_sessions() {
        let hub = MemoryHub::new();
        let a = node(&hub, 10);
        let b = node(&hub, 10);
        b.bridge
            .apply_message(&frame_from(&a, vec![wire(1, message("alpha", "x", &[]))]))
            .unwrap();
        assert_eq!(b.registry.list(None).unwrap().len(), 1);

        let gone = Publish::new(device_topic("team", a.bridge.device_id()), "", true);
        b.bridge.apply_message(&gone).unwrap();
        assert!(b.registry.list(None).unwrap().is_empty());

        // The archive bookkeeping is not echoed back to the broker.
        let mut conn = hub.transport().connect(None).await.unwrap();
        assert_eq!(b.bridge.push_pending(conn.as_mut()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cursor_regression_resets() {
        let hub = MemoryHub::new();
        let a = node(&hub, 10);
        let b = node(&hub, 10);
        b.bridge
            .apply_message(&frame_from(&a, vec![wire(50, message("alpha", "old", &[]))]))
            .unwrap();

        // Remote log recreated: numbering starts over.
        let applied = b
            .bridge
            .apply_message(&frame_from(&a, vec![wire(1, message("alpha", "new", &[]))]))
            .unwrap();
        assert_eq!(applied, 1);
        assert_eq!(
            b.store.kv_get_u64(&pull_cursor_key(a.bridge.device_id())).unwrap(),
            Some(1)
        );
    }

    // =========================================================================
    // state snapshots
    // =========================================================================

    fn remote_session(id: &str, status: SessionStatus) -> SessionState {
        SessionState {
            id: id.to_string(),
            tool: ToolKind::Claude,
            status,
            label: None,
            directory: None,
            last_seen: Utc::now(),
        }
    }

    fn state_from(source: &Node, state: DeviceState) -> Publish {
        let frame = RelayFrame {
            device: source.bridge.device_id().to_string(),
            short_id: source.bridge.short_id().to_string(),
            events: Vec::new(),
            has_more: false,
            state: Some(state),
        };
        Publish::new(
            device_topic("team", source.bridge.device_id()),
            serde_json::to_string(&frame).unwrap(),
            true,
        )
    }

    fn archived_count(store: &EventStore, id: &str) -> usize {
        store
            .query(&EventFilter::new().origin(id).types([EventType::Lifecycle]))
            .unwrap()
            .iter()
            .filter(|e| e.payload["action"] == "archived")
            .count()
    }

    #[tokio::test]
    async fn test_frames_carry_local_sessions_only() {
        let hub = MemoryHub::new();
        let a = node(&hub, 10);
        let b = node(&hub, 10);
        a.store
            .append(EventDraft::new(
                EventType::Lifecycle,
                "alpha",
                json!({"action": "started", "cwd": "/work/alpha"}),
            ))
            .unwrap();
        // A session mirrored from elsewhere must not be advertised again.
        a.bridge
            .apply_message(&state_from(&b, DeviceState {
                sessions: vec![remote_session("zed", SessionStatus::Listening)],
                reset_ts: None,
            }))
            .unwrap();

        let mut watcher = hub.transport().connect(None).await.unwrap();
        watcher.subscribe("team/+").await.unwrap();
        let mut conn = hub.transport().connect(None).await.unwrap();
        assert_eq!(a.bridge.push_pending(conn.as_mut()).await.unwrap(), 1);

        let msg = watcher.recv().await.unwrap();
        let frame: RelayFrame = serde_json::from_str(&msg.payload).unwrap();
        let state = frame.state.unwrap();
        assert_eq!(state.sessions.len(), 1);
        assert_eq!(state.sessions[0].id, "alpha");
        assert_eq!(state.sessions[0].status, SessionStatus::Starting);
        assert_eq!(state.sessions[0].directory.as_deref(), Some("/work/alpha"));
        assert_eq!(state.reset_ts, None);
    }

    #[tokio::test]
    async fn test_state_mirrors_and_archives_remote_sessions() {
        let hub = MemoryHub::new();
        let a = node(&hub, 10);
        let b = node(&hub, 10);
        let short = a.bridge.short_id().to_string();
        let alpha = format!("alpha:{}", short);
        let beta = format!("beta:{}", short);

        let mut listening = remote_session("alpha", SessionStatus::Listening);
        listening.directory = Some("/work/alpha".into());
        let first = state_from(&a, DeviceState {
            sessions: vec![listening, remote_session("beta", SessionStatus::Active)],
            reset_ts: None,
        });
        b.bridge.apply_message(&first).unwrap();

        let mirrored = b.registry.get(&alpha).unwrap().unwrap();
        assert_eq!(mirrored.status, SessionStatus::Listening);
        assert_eq!(mirrored.directory.as_deref(), Some("/work/alpha"));
        assert_eq!(mirrored.device.as_deref(), Some(a.bridge.device_id()));
        assert!(b.registry.get(&beta).unwrap().is_some());

        // Unchanged snapshots append nothing.
        let head = b.store.head().unwrap();
        b.bridge.apply_message(&first).unwrap();
        assert_eq!(b.store.head().unwrap(), head);

        b.bridge
            .apply_message(&state_from(&a, DeviceState {
                sessions: vec![remote_session("alpha", SessionStatus::Stopped)],
                reset_ts: None,
            }))
            .unwrap();
        assert_eq!(b.registry.get(&alpha).unwrap().unwrap().status, SessionStatus::Stopped);
        assert!(b.registry.get(&beta).unwrap().is_none());

        // Mirrored sessions are never pushed back.
        let mut conn = hub.transport().connect(None).await.unwrap();
        assert_eq!(b.bridge.push_pending(conn.as_mut()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_newer_remote_reset_drops_sessions_once() {
        let hub = MemoryHub::new();
        let a = node(&hub, 10);
        let b = node(&hub, 10);
        let alpha = format!("alpha:{}", a.bridge.short_id());
        let sessions = vec![remote_session("alpha", SessionStatus::Listening)];

        b.bridge
            .apply_message(&state_from(&a, DeviceState { sessions: sessions.clone(), reset_ts: None }))
            .unwrap();
        assert_eq!(archived_count(&b.store, &alpha), 0);

        let reset = Utc::now();
        let after_reset = state_from(&a, DeviceState { sessions, reset_ts: Some(reset) });
        b.bridge.apply_message(&after_reset).unwrap();
        assert_eq!(archived_count(&b.store, &alpha), 1);
        // Re-listed in the same snapshot, so it comes back.
        assert!(b.registry.get(&alpha).unwrap().is_some());

        b.bridge.apply_message(&after_reset).unwrap();
        assert_eq!(archived_count(&b.store, &alpha), 1);
    }

    #[tokio::test]
    async fn test_local_reset_is_advertised() {
        let hub = MemoryHub::new();
        let a = node(&hub, 10);
        a.store.append(message("alpha", "x", &[])).unwrap();
        assert_eq!(a.bridge.build_state().unwrap().sessions.len(), 1);

        a.store.reset().unwrap();
        let state = a.bridge.build_state().unwrap();
        assert!(state.sessions.is_empty());
        assert!(state.reset_ts.is_some());
    }

    // =========================================================================
    // control
    // =========================================================================

    fn control(from: &Node, to: &Node, action: ControlAction, target: &str) -> Publish {
        let frame = ControlFrame {
            from_device: from.bridge.device_id().to_string(),
            from_short: from.bridge.short_id().to_string(),
            ts: Utc::now(),
            action,
            target: target.to_string(),
            target_device: to.bridge.short_id().to_lowercase(),
        };
        Publish::new("team/control", serde_json::to_string(&frame).unwrap(), false)
    }

    #[tokio::test]
    async fn test_control_stop_applies_once() {
        let hub = MemoryHub::new();
        let a = node(&hub, 10);
        let b = node(&hub, 10);
        let c = node(&hub, 10);
        b.registry.register("worker", ToolKind::Codex, SessionMeta::default()).unwrap();
        b.registry.update_status("worker", SessionStatus::Listening).unwrap();

        // Addressed to another device: ignored.
        b.bridge.apply_message(&control(&a, &c, ControlAction::Stop, "worker")).unwrap();
        assert_eq!(b.registry.get("worker").unwrap().unwrap().status, SessionStatus::Listening);

        let stop = control(&a, &b, ControlAction::Stop, "worker");
        assert_eq!(b.bridge.apply_message(&stop).unwrap(), 0);
        assert_eq!(b.registry.get("worker").unwrap().unwrap().status, SessionStatus::Stopped);

        // A replay of the same frame does nothing.
        b.registry.update_status("worker", SessionStatus::Listening).unwrap();
        b.bridge.apply_message(&stop).unwrap();
        assert_eq!(b.registry.get("worker").unwrap().unwrap().status, SessionStatus::Listening);

        let start = control(&a, &b, ControlAction::Start, "worker");
        b.bridge.apply_message(&start).unwrap();
        assert_eq!(b.registry.get("worker").unwrap().unwrap().status, SessionStatus::Listening);
    }

    #[tokio::test]
    async fn test_send_control_validates_target() {
        let hub = MemoryHub::new();
        let a = node(&hub, 10);
        let own = format!("worker:{}", a.bridge.short_id());
        for bad in ["worker", ":ABCD", "worker:", own.as_str()] {
            assert!(
                matches!(a.bridge.send_control(ControlAction::Stop, bad), Err(BusError::InvalidRequest(_))),
                "{}",
                bad
            );
        }
        assert!(matches!(
            a.bridge.send_control(ControlAction::Stop, "worker:ZZZZ"),
            Err(BusError::RelayDisconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_request_push_requires_connection() {
        let hub = MemoryHub::new();
        let a = node(&hub, 10);
        assert!(matches!(
            a.bridge.request_push(),
            Err(BusError::RelayDisconnected(_))
        ));
    }

    // =========================================================================
    // run loop
    // =========================================================================

    #[tokio::test]
    async fn test_partition_and_reconnect_without_duplicates() {
        let hub = MemoryHub::new();
        let a = node(&hub, 10);
        let b = node(&hub, 10);
        let (stop_tx, stop_rx) = watch::channel(false);

        let run_a = tokio::spawn(Arc::clone(&a.bridge).run(stop_rx.clone()));
        let run_b = tokio::spawn(Arc::clone(&b.bridge).run(stop_rx));

        wait_for("bridges connected", || {
            a.bridge.health().state == RelayState::Connected
                && b.bridge.health().state == RelayState::Connected
        })
        .await;

        a.store.append(message("alpha", "before", &[])).unwrap();
        wait_for("first event relayed", || relayed(&b.store).len() == 1).await;

        hub.set_online(false);
        wait_for("disconnect noticed", || {
            a.bridge.health().state != RelayState::Connected
        })
        .await;

        // Local appends keep working during the partition.
        a.store.append(message("alpha", "during-1", &[])).unwrap();
        a.store.append(message("alpha", "during-2", &[])).unwrap();
        assert_eq!(relayed(&b.store).len(), 1);

        hub.set_online(true);
        wait_for("catch-up after reconnect", || relayed(&b.store).len() == 3).await;

        let bodies: Vec<String> = relayed(&b.store)
            .iter()
            .map(|e| e.payload["body"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(bodies, vec!["before", "during-1", "during-2"]);
        assert!(a.bridge.health().reconnects >= 1);

        stop_tx.send(true).unwrap();
        run_a.await.unwrap();
        run_b.await.unwrap();
        assert_eq!(a.bridge.health().state, RelayState::Stopped);
    }

    #[tokio::test]
    async fn test_remote_stop_through_running_bridges() {
        let hub = MemoryHub::new();
        let a = node(&hub, 10);
        let b = node(&hub, 10);
        b.registry.register("worker", ToolKind::Claude, SessionMeta::default()).unwrap();
        b.registry.update_status("worker", SessionStatus::Listening).unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let run_a = tokio::spawn(Arc::clone(&a.bridge).run(stop_rx.clone()));
        let run_b = tokio::spawn(Arc::clone(&b.bridge).run(stop_rx));
        wait_for("bridges connected", || {
            a.bridge.health().state == RelayState::Connected
                && b.bridge.health().state == RelayState::Connected
        })
        .await;

        let target = format!("worker:{}", b.bridge.short_id());
        let sent = a.bridge.send_control(ControlAction::Stop, &target).unwrap();
        assert_eq!(sent.target, "worker");
        wait_for("remote stop applied", || {
            b.registry.get("worker").unwrap().unwrap().status == SessionStatus::Stopped
        })
        .await;

        // The stop is b's own lifecycle event, so a mirrors it.
        wait_for("stop mirrored back", || {
            a.registry
                .get(&target)
                .unwrap()
                .is_some_and(|s| s.status == SessionStatus::Stopped)
        })
        .await;

        stop_tx.send(true).unwrap();
        run_a.await.unwrap();
        run_b.await.unwrap();
    }

    /// Accepts relay clients, acknowledges connect and subscribe, then goes quiet.
    async fn silent_broker() -> String {
        use crate::relay::broker::{BrokerFrame, ClientFrame};
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let reply = match serde_json::from_str::<ClientFrame>(&line) {
                            Ok(ClientFrame::Connect { .. }) => BrokerFrame::ConnAck,
                            Ok(ClientFrame::Subscribe { id, .. }) => BrokerFrame::SubAck { id },
                            _ => continue,
                        };
                        let mut out = serde_json::to_string(&reply).unwrap();
                        out.push('\n');
                        write.write_all(out.as_bytes()).await.unwrap();
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_unresponsive_broker_is_detected_while_idle() {
        let addr = silent_broker().await;
        let transport = crate::relay::TcpTransport::new(&addr, "idle")
            .unwrap()
            .with_ack_timeout(Duration::from_millis(200));
        let a = node_with(Arc::new(transport), 10);
        let (stop_tx, stop_rx) = watch::channel(false);
        let run = tokio::spawn(Arc::clone(&a.bridge).run(stop_rx));

        wait_for("connected", || a.bridge.health().state == RelayState::Connected).await;
        // Nothing to push: only the idle ping can notice the dead broker.
        wait_for("dead broker noticed", || a.bridge.health().reconnects >= 1).await;
        let error = a.bridge.health().last_error.unwrap_or_default();
        assert!(error.contains("did not acknowledge"), "{}", error);
        assert_eq!(a.bridge.health().published, 0);

        stop_tx.send(true).unwrap();
        run.await.unwrap();
    }
}
