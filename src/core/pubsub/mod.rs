// src/core/pubsub/mod.rs

//! Client-side publish-subscribe: subscription registries, dedicated
//! subscription connections, push routing, and off-socket callback dispatch.

pub mod connection;
pub mod dispatcher;
pub mod hub;
pub mod registry;
pub mod router;

pub use connection::SubscriptionConnection;
pub use dispatcher::Dispatcher;
pub use hub::SubscriptionHub;
pub use registry::{
    MessageCallback, Payload, PayloadFormat, PubSubMessage, Subscription, SubscriptionKind,
    SubscriptionRegistry,
};
pub use router::SubscriptionRouter;

/// The channel on which the server publishes key invalidations for clients
/// that redirect tracking to a RESP2 connection.
pub const INVALIDATION_CHANNEL: &str = "__redis__:invalidate";
