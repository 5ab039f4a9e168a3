//! Topic routing
//!
//! Inbound messages are matched against MQTT topic filters and handed to the
//! handler registered for each matching filter. The subscription registry
//! remembers what was subscribed so the session can replay it after a
//! reconnect.

pub mod filter;
pub mod router;
pub mod subscriptions;

pub use filter::{RoutingError, TopicFilter};
pub use router::{TopicHandler, TopicRouter};
pub use subscriptions::{SubscriptionRegistry, TopicSubscription};
