//! A small retained-message topic broker.
//!
//! Used by the `agentbusd broker` subcommand (over TCP, one JSON frame per
//! line) and by the in-memory transport. Topics are `/`-separated; patterns
//! may use `+` for one level and a trailing `#` for the rest. Retained
//! messages are replayed to new subscribers, an empty retained payload
//! clears the topic, and a client's will is published when it drops
//! without a clean disconnect. Each client has a bounded queue; a client
//! that lets it fill up is dropped as if its connection was lost.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use super::transport::{Publish, RelayError};

/// Messages queued per client before it is disconnected.
pub const CLIENT_QUEUE: usize = 1024;

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Connect {
        client_id: String,
        #[serde(default)]
        will: Option<Publish>,
    },
    Subscribe {
        id: u64,
        pattern: String,
    },
    Publish {
        id: u64,
        topic: String,
        #[serde(default)]
        payload: String,
        #[serde(default)]
        retain: bool,
    },
    /// Liveness check, answered with a matching `Pong`.
    Ping {
        id: u64,
    },
    Disconnect,
}

/// Frames sent by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BrokerFrame {
    ConnAck,
    SubAck { id: u64 },
    PubAck { id: u64 },
    Message {
        topic: String,
        payload: String,
        retain: bool,
    },
    Pong { id: u64 },
    Error { message: String },
}

/// Whether `topic` matches `pattern`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct ClientEntry {
    tx: mpsc::Sender<Publish>,
    patterns: Vec<String>,
    will: Option<Publish>,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<u64, ClientEntry>,
    retained: BTreeMap<String, Publish>,
    next_id: u64,
}

impl BrokerState {
    /// Deliver `message`, then the wills of any clients whose queue overflowed.
    fn route(&mut self, message: &Publish) {
        let mut pending = VecDeque::from([message.clone()]);
        while let Some(message) = pending.pop_front() {
            if message.retain {
                if message.payload.is_empty() {
                    self.retained.remove(&message.topic);
                } else {
                    self.retained.insert(message.topic.clone(), message.clone());
                }
            }
            let mut overflowed = Vec::new();
            for (id, client) in &self.clients {
                if client.patterns.iter().any(|p| topic_matches(p, &message.topic))
                    && client.tx.try_send(message.clone()).is_err()
                {
                    overflowed.push(*id);
                }
            }
            for id in overflowed {
                pending.extend(self.evict(id));
            }
        }
    }

    /// Drop a client that stopped draining its queue. Returns its will.
    fn evict(&mut self, id: u64) -> Option<Publish> {
        let entry = self.clients.remove(&id)?;
        tracing::warn!(client = id, "Broker client queue full, disconnecting");
        entry.will
    }
}

#[derive(Default)]
pub struct BrokerCore {
    state: Mutex<BrokerState>,
}

impl BrokerCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client; returns its id and the queue of messages for it.
    pub fn attach(&self, will: Option<Publish>) -> (u64, mpsc::Receiver<Publish>) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.clients.insert(
            id,
            ClientEntry {
                tx,
                patterns: Vec::new(),
                will,
            },
        );
        (id, rx)
    }

    /// Add a subscription and replay matching retained messages.
    pub fn subscribe(&self, client: u64, pattern: &str) -> Result<(), RelayError> {
        let mut state = self.lock();
        let retained: Vec<Publish> = state
            .retained
            .values()
            .filter(|m| topic_matches(pattern, &m.topic))
            .cloned()
            .collect();
        let entry = state.clients.get_mut(&client).ok_or(RelayError::Closed)?;
        entry.patterns.push(pattern.to_string());
        let overflowed = retained
            .into_iter()
            .any(|message| entry.tx.try_send(message).is_err());
        if overflowed {
            if let Some(will) = state.evict(client) {
                state.route(&will);
            }
            return Err(RelayError::Closed);
        }
        Ok(())
    }

    pub fn publish(&self, client: u64, message: Publish) -> Result<(), RelayError> {
        let mut state = self.lock();
        if !state.clients.contains_key(&client) {
            return Err(RelayError::Closed);
        }
        state.route(&message);
        Ok(())
    }

    /// Remove a client. An unclean detach publishes its will.
    pub fn detach(&self, client: u64, clean: bool) {
        let mut state = self.lock();
        if let Some(entry) = state.clients.remove(&client) {
            if let (false, Some(will)) = (clean, entry.will) {
                tracing::debug!(client, topic = %will.topic, "Publishing will");
                state.route(&will);
            }
        }
    }

    /// Drop every client as if its connection was lost.
    pub fn detach_all(&self) {
        let ids: Vec<u64> = self.lock().clients.keys().copied().collect();
        for id in ids {
            self.detach(id, false);
        }
    }

    pub fn retained(&self, topic: &str) -> Option<Publish> {
        self.lock().retained.get(topic).cloned()
    }

    pub fn is_attached(&self, client: u64) -> bool {
        self.lock().clients.contains_key(&client)
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        // A panic while routing leaves the maps consistent, so keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Accept broker clients until `shutdown` flips to true.
pub async fn serve_broker(
    listener: TcpListener,
    core: Arc<BrokerCore>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "Broker listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tracing::debug!(%peer, "Broker client connected");
                let core = Arc::clone(&core);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, core).await {
                        tracing::debug!(%peer, error = %e, "Broker client ended");
                    }
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("Broker shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_client(stream: TcpStream, core: Arc<BrokerCore>) -> Result<(), RelayError> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let will = match lines.next_line().await? {
        Some(line) => match serde_json::from_str::<ClientFrame>(&line)? {
            ClientFrame::Connect { client_id, will } => {
                tracing::debug!(%client_id, "Broker client identified");
                will
            }
            _ => {
                write_frame(
                    &mut write,
                    &BrokerFrame::Error {
                        message: "expected connect".to_string(),
                    },
                )
                .await?;
                return Ok(());
            }
        },
        None => return Ok(()),
    };

    let (id, mut rx) = core.attach(will);
    let mut clean = false;
    let result = async {
        write_frame(&mut write, &BrokerFrame::ConnAck).await?;
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let reply = match serde_json::from_str::<ClientFrame>(&line) {
                        Ok(ClientFrame::Subscribe { id: req, pattern }) => {
                            core.subscribe(id, &pattern)?;
                            BrokerFrame::SubAck { id: req }
                        }
                        Ok(ClientFrame::Publish { id: req, topic, payload, retain }) => {
                            core.publish(id, Publish { topic, payload, retain })?;
                            BrokerFrame::PubAck { id: req }
                        }
                        Ok(ClientFrame::Ping { id: req }) => BrokerFrame::Pong { id: req },
                        Ok(ClientFrame::Disconnect) => {
                            clean = true;
                            break;
                        }
                        Ok(ClientFrame::Connect { .. }) => BrokerFrame::Error {
                            message: "already connected".to_string(),
                        },
                        Err(e) => BrokerFrame::Error {
                            message: format!("invalid frame: {}", e),
                        },
                    };
                    write_frame(&mut write, &reply).await?;
                }
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    write_frame(
                        &mut write,
                        &BrokerFrame::Message {
                            topic: message.topic,
                            payload: message.payload,
                            retain: message.retain,
                        },
                    )
                    .await?;
                }
            }
        }
        Ok::<(), RelayError>(())
    }
    .await;

    core.detach(id, clean);
    tracing::debug!(client = id, clean, remaining = core.client_count(), "Broker client detached");
    result
}

pub(crate) async fn write_frame<T: Serialize>(
    write: &mut OwnedWriteHalf,
    frame: &T,
) -> Result<(), RelayError> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    write.write_all(line.as_bytes()).await?;
    write.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("team/+", "team/dev1"));
        assert!(!topic_matches("team/+", "team/dev1/x"));
        assert!(!topic_matches("team/+", "team"));
        assert!(topic_matches("team/#", "team/a/b"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(topic_matches("team/dev1", "team/dev1"));
        assert!(!topic_matches("team/dev1", "team/dev2"));
    }

    #[test]
    fn test_retained_replayed_on_subscribe() {
        let core = BrokerCore::new();
        let (a, _rx_a) = core.attach(None);
        core.publish(a, Publish::new("team/a", "{}", true)).unwrap();
        core.publish(a, Publish::new("team/b", "{}", false)).unwrap();

        let (b, mut rx_b) = core.attach(None);
        core.subscribe(b, "team/+").unwrap();
        let replayed = rx_b.try_recv().unwrap();
        assert_eq!(replayed.topic, "team/a");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_empty_retained_payload_clears() {
        let core = BrokerCore::new();
        let (a, _rx) = core.attach(None);
        core.publish(a, Publish::new("team/a", "{}", true)).unwrap();
        core.publish(a, Publish::new("team/a", "", true)).unwrap();
        assert!(core.retained("team/a").is_none());
    }

    #[test]
    fn test_will_on_unclean_detach_only() {
        let core = BrokerCore::new();
        let (watcher, mut rx) = core.attach(None);
        core.subscribe(watcher, "team/+").unwrap();

        let (clean, _r1) = core.attach(Some(Publish::new("team/c", "", true)));
        core.detach(clean, true);
        assert!(rx.try_recv().is_err());

        let (dirty, _r2) = core.attach(Some(Publish::new("team/d", "", true)));
        core.detach(dirty, false);
        assert_eq!(rx.try_recv().unwrap().topic, "team/d");
    }

    #[test]
    fn test_publish_after_detach_fails() {
        let core = BrokerCore::new();
        let (a, _rx) = core.attach(None);
        core.detach(a, true);
        assert!(matches!(
            core.publish(a, Publish::new("t", "x", false)),
            Err(RelayError::Closed)
        ));
        assert_eq!(core.client_count(), 0);
    }

    #[test]
    fn test_full_queue_disconnects_client_and_publishes_will() {
        let core = BrokerCore::new();
        let (watcher, mut watch_rx) = core.attach(None);
        core.subscribe(watcher, "team/+").unwrap();

        let (slow, mut slow_rx) = core.attach(Some(Publish::new("team/slow", "", true)));
        core.subscribe(slow, "team/+").unwrap();

        let (publisher, _rx) = core.attach(None);
        for n in 0..CLIENT_QUEUE {
            core.publish(publisher, Publish::new("team/p", n.to_string(), false)).unwrap();
            // The watcher keeps up, the slow client never reads.
            assert_eq!(watch_rx.try_recv().unwrap().payload, n.to_string());
        }
        assert_eq!(core.client_count(), 3);

        core.publish(publisher, Publish::new("team/p", "overflow", false)).unwrap();
        assert_eq!(core.client_count(), 2);
        assert_eq!(watch_rx.try_recv().unwrap().payload, "overflow");
        assert_eq!(watch_rx.try_recv().unwrap().topic, "team/slow");
        assert!(matches!(
            core.publish(slow, Publish::new("team/slow", "x", false)),
            Err(RelayError::Closed)
        ));

        // Queued messages drain, then the stream ends.
        let mut drained = 0;
        while slow_rx.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, CLIENT_QUEUE);
        assert!(matches!(
            slow_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_frame_tags() {
        let json = serde_json::to_string(&BrokerFrame::PubAck { id: 4 }).unwrap();
        assert_eq!(json, r#"{"op":"pub_ack","id":4}"#);
        let ping: ClientFrame = serde_json::from_str(r#"{"op":"ping","id":9}"#).unwrap();
        assert_eq!(ping, ClientFrame::Ping { id: 9 });
        let frame: ClientFrame =
            serde_json::from_str(r#"{"op":"subscribe","id":1,"pattern":"a/+"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Subscribe {
                id: 1,
                pattern: "a/+".to_string()
            }
        );
    }
}
