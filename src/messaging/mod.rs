//! Message routing between sessions.
//!
//! A message is an event of type `message` whose payload records the sender,
//! the addressing mode and the targets resolved at send time:
//!
//! - **mentions**: `@name` tokens in the body plus explicit recipients
//! - **broadcast**: every listening or active session except the sender
//! - **thread**: participants of the thread (or of the replied-to message)

mod mentions;
mod router;
mod types;

pub use mentions::extract_mentions;
pub use router::MessageRouter;
pub use types::{AddressingMode, Intent, MessagePayload, OutgoingMessage};
