//! Socket server: one task per connection, requests answered in order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use super::protocol::{encode, parse_request, ProtocolError, Request, Response, MAX_LINE_BYTES};
use crate::bus::Bus;
use crate::error::BusResult;
use crate::sessions::SessionMeta;
use crate::subscriptions::{StreamItem, Subscription};

/// Frames buffered per connection before subscription forwarders wait.
const OUTBOUND_BUFFER: usize = 256;

pub(crate) struct ServerState {
    bus: Arc<Bus>,
    idle_after: Duration,
    /// Session bound to each live connection.
    bindings: Mutex<HashMap<u64, String>>,
    next_conn: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl ServerState {
    pub(crate) fn new(bus: Arc<Bus>, idle_after: Duration, shutdown: watch::Sender<bool>) -> Self {
        Self {
            bus,
            idle_after,
            bindings: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Sessions with a live connection.
    pub(crate) fn bound_sessions(&self) -> HashSet<String> {
        self.bindings
            .lock()
            .map(|b| b.values().cloned().collect())
            .unwrap_or_default()
    }

    fn bind(&self, conn: u64, session: &str, replace: bool) {
        if let Ok(mut bindings) = self.bindings.lock() {
            if replace || !bindings.contains_key(&conn) {
                bindings.insert(conn, session.to_string());
            }
        }
    }

    fn bound(&self, conn: u64) -> Option<String> {
        self.bindings.lock().ok().and_then(|b| b.get(&conn).cloned())
    }

    fn unbind(&self, conn: u64) {
        if let Ok(mut bindings) = self.bindings.lock() {
            bindings.remove(&conn);
        }
    }
}

/// Accept connections until `shutdown` flips to true.
pub(crate) async fn serve(
    listener: UnixListener,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let conn = state.next_conn.fetch_add(1, Ordering::Relaxed);
                    connections.spawn(handle_connection(stream, state.clone(), conn, shutdown.clone()));
                }
                Err(e) => tracing::warn!(error = %e, "Accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    // Connections see the same shutdown signal; give them a moment to flush.
    let drain = async { while connections.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(2), drain).await.is_err() {
        connections.shutdown().await;
    }
    tracing::debug!("Socket server stopped");
}

async fn handle_connection(
    stream: UnixStream,
    state: Arc<ServerState>,
    conn: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read, write) = stream.into_split();
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let writer = tokio::spawn(write_frames(write, rx));
    let mut lines = FramedRead::new(read, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut subscriptions: HashMap<u64, JoinHandle<()>> = HashMap::new();

    let idle = tokio::time::sleep(state.idle_after);
    tokio::pin!(idle);
    let mut idle_reported = false;

    tracing::debug!(conn, "Client connected");

    loop {
        tokio::select! {
            line = lines.next() => {
                let line = match line {
                    Some(Ok(line)) => line,
                    None => break,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        // The rest of the oversized line is unread; the stream cannot resync.
                        tracing::warn!(conn, limit = MAX_LINE_BYTES, "Request line too long, closing");
                        let _ = tx.send(Response::error("protocol", ProtocolError::LineTooLong.to_string())).await;
                        break;
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        tracing::debug!(conn, error = %e, "Read failed");
                        break;
                    }
                };
                idle.as_mut().reset(Instant::now() + state.idle_after);
                idle_reported = false;
                if line.trim().is_empty() {
                    continue;
                }

                let request = match parse_request(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        if tx.send(Response::error("protocol", e.to_string())).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };
                let stop = matches!(request, Request::Shutdown);
                if let Some(response) = dispatch(&state, conn, request, &tx, &mut subscriptions).await {
                    if tx.send(response).await.is_err() {
                        break;
                    }
                }
                if stop {
                    tracing::info!(conn, "Shutdown requested by client");
                    let _ = state.shutdown.send(true);
                }
            }
            _ = &mut idle, if !idle_reported => {
                idle_reported = true;
                if let Some(session) = state.bound(conn) {
                    match state.bus.mark_idle(&session, "connection idle") {
                        Ok(true) => tracing::info!(conn, session = %session, "Session idle"),
                        Ok(false) => {}
                        Err(e) => tracing::warn!(conn, session = %session, error = %e, "Failed to mark session idle"),
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    for (id, task) in subscriptions {
        task.abort();
        state.bus.unsubscribe(id);
    }
    state.unbind(conn);
    drop(tx);
    let _ = writer.await;
    tracing::debug!(conn, "Client disconnected");
}

/// Handle one request. Returns `None` when the response was already queued.
async fn dispatch(
    state: &ServerState,
    conn: u64,
    request: Request,
    tx: &mpsc::Sender<Response>,
    subscriptions: &mut HashMap<u64, JoinHandle<()>>,
) -> Option<Response> {
    let bus = &state.bus;
    let result: BusResult<Response> = match request {
        Request::Ping => Ok(Response::Pong {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
        Request::Register {
            id,
            tool,
            label,
            terminal,
        } => bus
            .register(&id, tool, SessionMeta { label, terminal })
            .map(|session| {
                state.bind(conn, &session.id, true);
                Response::Session { session }
            }),
        Request::SetStatus { id, status } => bus
            .update_status(&id, status)
            .map(|session| Response::Session { session }),
        Request::Ingest { event } => {
            let origin = event.origin.clone();
            bus.ingest(event).map(|event| {
                state.bind(conn, &origin, false);
                Response::Appended {
                    events: vec![(*event).clone()],
                }
            })
        }
        Request::IngestNative {
            tool,
            origin,
            payload,
        } => bus
            .ingest_native(tool, origin.as_deref(), &payload)
            .map(|events| {
                if let Some(first) = events.first() {
                    state.bind(conn, &first.origin, false);
                }
                Response::Appended {
                    events: events.iter().map(|e| (**e).clone()).collect(),
                }
            }),
        Request::Send { message } => {
            let from = message.from.clone();
            bus.send(message).map(|event| {
                state.bind(conn, &from, false);
                Response::Appended {
                    events: vec![(*event).clone()],
                }
            })
        }
        Request::Query { filter } => bus.query(&filter).map(|events| Response::Events { events }),
        Request::ListSessions { status } => bus
            .sessions(status)
            .map(|sessions| Response::Sessions { sessions }),
        Request::Resolve { name } => bus.resolve(&name).map(|session| Response::Session { session }),
        Request::Subscribe { filter, from } => match bus.subscribe(&filter, from) {
            Ok(subscription) => {
                let id = subscription.id();
                // Acknowledge before any item can be forwarded.
                if tx.send(Response::Subscribed { id }).await.is_err() {
                    return None;
                }
                subscriptions.insert(id, tokio::spawn(forward(subscription, tx.clone())));
                tracing::debug!(conn, subscription = id, "Subscribed");
                return None;
            }
            Err(e) => Err(e),
        },
        Request::Unsubscribe { id } => {
            let existed = match subscriptions.remove(&id) {
                Some(task) => {
                    task.abort();
                    bus.unsubscribe(id)
                }
                None => false,
            };
            Ok(Response::Unsubscribed { id, existed })
        }
        Request::Reset => bus.reset().map(|removed| Response::ResetDone { removed }),
        Request::Health => bus.health().map(|health| Response::Health {
            health: Box::new(health),
        }),
        Request::Collisions => Ok(Response::Collisions {
            collisions: bus.collisions(),
        }),
        Request::AckCollision { id } => bus
            .acknowledge_collision(id)
            .map(|()| Response::Acknowledged { id }),
        Request::RelayControl { action, session } => bus
            .relay_control(action, &session)
            .map(|control| Response::ControlSent { control }),
        Request::Shutdown => Ok(Response::ShuttingDown),
    };

    Some(result.unwrap_or_else(|e| {
        tracing::debug!(conn, kind = e.kind(), error = %e, "Request failed");
        Response::from(e)
    }))
}

async fn forward(subscription: Subscription, tx: mpsc::Sender<Response>) {
    let id = subscription.id();
    let stream = subscription.into_stream();
    futures::pin_mut!(stream);
    while let Some(item) = stream.next().await {
        let frame = match item {
            StreamItem::Event(event) => Response::Event {
                subscription: id,
                event: (*event).clone(),
            },
            StreamItem::Gap {
                missed,
                resume_after,
            } => Response::Gap {
                subscription: id,
                missed,
                resume_after,
            },
        };
        if tx.send(frame).await.is_err() {
            break;
        }
    }
}

async fn write_frames(mut write: OwnedWriteHalf, mut rx: mpsc::Receiver<Response>) {
    while let Some(response) = rx.recv().await {
        let line = match encode(&response) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode response");
                continue;
            }
        };
        if write.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
    let _ = write.shutdown().await;
}
