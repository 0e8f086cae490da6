//! agentbus library
//!
//! Coordination daemon for AI coding agents working side by side: an
//! append-only event log, a registry of agent sessions, message routing,
//! live subscriptions, edit collision warnings and an optional relay that
//! mirrors events between machines.
//!
//! ## Main Components
//!
//! - [`events`] - Event types, filters and the SQLite-backed store
//! - [`sessions`] - Session registry projected from lifecycle events
//! - [`messaging`] - Mention/broadcast/thread routing
//! - [`subscriptions`] - Bounded live subscriptions with gap reporting
//! - [`collision`] - Concurrent edit detection
//! - [`relay`] - Cross-device relay bridge and broker
//! - [`adapters`] - Native hook payload normalization per tool
//! - [`bus`] - The owning context tying the above together
//! - [`daemon`] - Socket server, sweeper and client
//!
//! ## Quick Start
//!
//! ```ignore
//! use agentbus::{Bus, DaemonConfig, OutgoingMessage};
//!
//! let config = DaemonConfig::default();
//! let bus = Bus::open(&config)?;
//! bus.send(OutgoingMessage::new("alice", "@bob the API is merged"))?;
//! ```

pub mod adapters;
pub mod bus;
pub mod collision;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod events;
pub mod messaging;
pub mod relay;
pub mod sessions;
pub mod subscriptions;

pub use adapters::{AdapterError, AdapterRegistry, ToolAdapter};
pub use bus::{Bus, BusHealth, SweepReport};
pub use collision::{CollisionDetector, CollisionRecord};
pub use config::{ConfigError, DaemonConfig, RelayConfig, XdgDirs};
pub use daemon::{Client, Daemon, DaemonError, DaemonHandle, Request, Response};
pub use db::Database;
pub use error::{BusError, BusResult};
pub use events::{Event, EventDraft, EventFilter, EventStore, EventType, HookEvent};
pub use messaging::{AddressingMode, Intent, MessagePayload, MessageRouter, OutgoingMessage};
pub use relay::{RelayBridge, RelayHealth};
pub use sessions::{Session, SessionRegistry, SessionStatus, ToolKind};
pub use subscriptions::{StreamItem, Subscription, SubscriptionManager};
