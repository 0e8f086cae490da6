//! Broker transport abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::BusError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Frame(#[from] serde_json::Error),

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("Local store error: {0}")]
    Store(String),
}

impl From<RelayError> for BusError {
    fn from(e: RelayError) -> Self {
        BusError::RelayDisconnected(e.to_string())
    }
}

impl From<BusError> for RelayError {
    fn from(e: BusError) -> Self {
        RelayError::Store(e.to_string())
    }
}

/// A message on a broker topic. An empty payload clears a retained topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publish {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub retain: bool,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        }
    }
}

/// Opens broker connections.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Connect, registering `will` to be published if the connection is lost
    /// without a clean close.
    async fn connect(&self, will: Option<Publish>) -> Result<Box<dyn RelayConnection>, RelayError>;

    /// Human-readable broker address.
    fn describe(&self) -> String;
}

/// One live broker connection.
#[async_trait]
pub trait RelayConnection: Send {
    /// Subscribe to a topic pattern (`+` matches one level, `#` the rest).
    async fn subscribe(&mut self, pattern: &str) -> Result<(), RelayError>;

    /// Publish; returns once the broker has accepted the message.
    async fn publish(&mut self, message: Publish) -> Result<(), RelayError>;

    /// Round trip to the broker; fails if it does not answer in time.
    async fn ping(&mut self) -> Result<(), RelayError>;

    /// Next message for our subscriptions; `None` when the connection is gone.
    /// Cancel safe.
    async fn recv(&mut self) -> Option<Publish>;

    /// Close cleanly so the will is not published.
    async fn close(&mut self) -> Result<(), RelayError>;
}
