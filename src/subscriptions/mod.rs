//! Live, filtered event subscriptions.

mod manager;
mod slot;

pub use manager::{Subscription, SubscriptionManager, DEFAULT_SUBSCRIBER_BUFFER};
pub use slot::StreamItem;
