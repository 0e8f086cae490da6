//! Cross-machine relay.
//!
//! The bridge mirrors a subset of local events to a topic broker and imports
//! events published by other devices in the same namespace. The broker is
//! reached through [`RelayTransport`]; `tcp` talks to `agentbusd broker`,
//! `memory` keeps everything in-process.

mod backoff;
mod bridge;
mod broker;
mod memory;
mod tcp;
mod transport;
mod wire;

pub use backoff::Backoff;
pub use bridge::{RelayBridge, RelayHealth, RelayState};
pub use broker::{serve_broker, topic_matches, BrokerCore};
pub use memory::{MemoryHub, MemoryTransport};
pub use tcp::{parse_relay_url, TcpTransport};
pub use transport::{Publish, RelayConnection, RelayError, RelayTransport};
pub use wire::{
    control_topic, device_topic, short_id, wildcard_topic, ControlAction, ControlFrame, DeviceState, RelayFrame,
    SessionState, WireEvent,
};
