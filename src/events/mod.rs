//! Event log: types, filters and the append-only store.

mod filter;
mod predicate;
mod store;
mod types;

pub use filter::{CompiledFilter, EventFilter};
pub use predicate::{CompareOp, FilterError, Predicate};
pub use store::{AppendListener, EventStore, Projection};
pub use types::{
    is_system_origin, Event, EventDraft, EventType, HookEvent, RelayOrigin, SYSTEM_ORIGIN,
};
