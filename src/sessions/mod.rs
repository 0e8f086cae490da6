//! Session registry: who is on the bus and what they are doing.

mod projection;
mod registry;
mod types;

pub use projection::{action, SessionProjection};
pub(crate) use registry::validate_identity;
pub use registry::{SessionMeta, SessionRegistry};
pub use types::{Session, SessionStatus, ToolKind};
