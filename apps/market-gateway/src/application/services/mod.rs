//! Application Services
//!
//! - `SubscriptionHub`: subscription dedup and push fan-out over a
//!   [`SubscriptionPort`](crate::application::ports::SubscriptionPort)

mod subscription_hub;

pub use subscription_hub::{BroadcastOutcome, CallbackError, SubscriberCallback, SubscriptionHub};
