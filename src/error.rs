//! Error taxonomy for the bus.
//!
//! Failures that only concern one caller (an unresolvable mention, a slow
//! subscriber) are reported to that caller. Failures on the shared append
//! path surface as [`BusError::StoreUnavailable`] for everyone.

use thiserror::Error;

use crate::adapters::AdapterError;
use crate::config::ConfigError;
use crate::events::FilterError;

/// Errors surfaced by bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Event store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Ambiguous session '{name}': matches {}", .candidates.join(", "))]
    AmbiguousSession {
        name: String,
        candidates: Vec<String>,
    },

    #[error("Routing failed: {0}")]
    RoutingFailed(String),

    #[error("Relay disconnected: {0}")]
    RelayDisconnected(String),

    #[error("Subscriber {id} overflowed, {missed} events dropped")]
    SubscriberOverflow { id: u64, missed: u64 },

    #[error("Invalid filter: {0}")]
    InvalidFilter(#[from] FilterError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl BusError {
    /// Short machine-readable kind, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            BusError::StoreUnavailable(_) => "store_unavailable",
            BusError::UnknownSession(_) => "unknown_session",
            BusError::AmbiguousSession { .. } => "ambiguous_session",
            BusError::RoutingFailed(_) => "routing_failed",
            BusError::RelayDisconnected(_) => "relay_disconnected",
            BusError::SubscriberOverflow { .. } => "subscriber_overflow",
            BusError::InvalidFilter(_) => "invalid_filter",
            BusError::Adapter(_) => "adapter",
            BusError::Config(_) => "config",
            BusError::InvalidRequest(_) => "invalid_request",
        }
    }
}

/// Result alias used across the crate.
pub type BusResult<T> = Result<T, BusError>;
