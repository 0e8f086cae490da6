//! TCP client for the relay broker.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::broker::{write_frame, BrokerFrame, ClientFrame};
use super::transport::{Publish, RelayConnection, RelayError, RelayTransport};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);
/// Broker messages buffered before the connection is given up.
const INBOUND_BUFFER: usize = 1024;
const ACK_BUFFER: usize = 64;

/// Strip an optional `tcp://` scheme and check for `host:port`.
pub fn parse_relay_url(url: &str) -> Result<String, RelayError> {
    let addr = url.trim();
    let addr = addr.strip_prefix("tcp://").unwrap_or(addr).trim_end_matches('/');
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(addr.to_string())
        }
        _ => Err(RelayError::InvalidUrl(url.to_string())),
    }
}

pub struct TcpTransport {
    addr: String,
    client_id: String,
    ack_timeout: Duration,
}

impl TcpTransport {
    pub fn new(url: &str, client_id: impl Into<String>) -> Result<Self, RelayError> {
        Ok(Self {
            addr: parse_relay_url(url)?,
            client_id: client_id.into(),
            ack_timeout: ACK_TIMEOUT,
        })
    }

    /// How long to wait for acks and pongs before giving up on the broker.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }
}

#[async_trait]
impl RelayTransport for TcpTransport {
    async fn connect(&self, will: Option<Publish>) -> Result<Box<dyn RelayConnection>, RelayError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| RelayError::Unreachable(format!("{}: connect timed out", self.addr)))?
            .map_err(|e| RelayError::Unreachable(format!("{}: {}", self.addr, e)))?;
        stream.set_nodelay(true)?;

        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write_frame(
            &mut write,
            &ClientFrame::Connect {
                client_id: self.client_id.clone(),
                will,
            },
        )
        .await?;

        let first = tokio::time::timeout(self.ack_timeout, lines.next_line())
            .await
            .map_err(|_| RelayError::Unreachable(format!("{}: no connect ack", self.addr)))??;
        match first.as_deref().map(serde_json::from_str::<BrokerFrame>) {
            Some(Ok(BrokerFrame::ConnAck)) => {}
            Some(Ok(BrokerFrame::Error { message })) => return Err(RelayError::Unreachable(message)),
            Some(Ok(other)) => {
                return Err(RelayError::Unreachable(format!("unexpected frame: {:?}", other)))
            }
            Some(Err(e)) => return Err(RelayError::Frame(e)),
            None => return Err(RelayError::Closed),
        }

        let (messages_tx, messages) = mpsc::channel(INBOUND_BUFFER);
        let (acks_tx, acks) = mpsc::channel(ACK_BUFFER);
        let reader = tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<BrokerFrame>(&line) {
                    Ok(BrokerFrame::Message { topic, payload, retain }) => {
                        // Blocking here would also hold back acks; drop the link
                        // instead and let the retained frames replay on reconnect.
                        match messages_tx.try_send(Publish { topic, payload, retain }) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                tracing::warn!("Relay inbound queue full, dropping connection");
                                break;
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                    Ok(
                        BrokerFrame::SubAck { id }
                        | BrokerFrame::PubAck { id }
                        | BrokerFrame::Pong { id },
                    ) => {
                        // Late acks for requests that already timed out are dropped.
                        let _ = acks_tx.try_send(id);
                    }
                    Ok(BrokerFrame::Error { message }) => {
                        tracing::warn!(%message, "Broker reported an error");
                    }
                    Ok(BrokerFrame::ConnAck) => {}
                    Err(e) => tracing::warn!(error = %e, "Ignoring malformed broker frame"),
                }
            }
        });

        tracing::debug!(addr = %self.addr, "Connected to relay broker");
        Ok(Box::new(TcpConnection {
            write,
            messages,
            acks,
            reader,
            next_id: 0,
            ack_timeout: self.ack_timeout,
        }))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

struct TcpConnection {
    write: OwnedWriteHalf,
    messages: mpsc::Receiver<Publish>,
    acks: mpsc::Receiver<u64>,
    reader: JoinHandle<()>,
    next_id: u64,
    ack_timeout: Duration,
}

impl TcpConnection {
    async fn request(&mut self, frame: impl FnOnce(u64) -> ClientFrame) -> Result<(), RelayError> {
        self.next_id += 1;
        let id = self.next_id;
        write_frame(&mut self.write, &frame(id)).await?;

        let acks = &mut self.acks;
        tokio::time::timeout(self.ack_timeout, async move {
            while let Some(acked) = acks.recv().await {
                if acked == id {
                    return Ok(());
                }
            }
            Err(RelayError::Closed)
        })
        .await
        .map_err(|_| RelayError::Unreachable("broker did not acknowledge".to_string()))?
    }
}

#[async_trait]
impl RelayConnection for TcpConnection {
    async fn subscribe(&mut self, pattern: &str) -> Result<(), RelayError> {
        let pattern = pattern.to_string();
        self.request(move |id| ClientFrame::Subscribe { id, pattern })
            .await
    }

    async fn publish(&mut self, message: Publish) -> Result<(), RelayError> {
        self.request(move |id| ClientFrame::Publish {
            id,
            topic: message.topic,
            payload: message.payload,
            retain: message.retain,
        })
        .await
    }

    async fn ping(&mut self) -> Result<(), RelayError> {
        self.request(|id| ClientFrame::Ping { id }).await
    }

    async fn recv(&mut self) -> Option<Publish> {
        self.messages.recv().await
    }

    async fn close(&mut self) -> Result<(), RelayError> {
        write_frame(&mut self.write, &ClientFrame::Disconnect).await?;
        self.write.shutdown().await?;
        Ok(())
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
