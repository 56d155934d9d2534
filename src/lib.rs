// src/lib.rs

//! A pooled, pipelining RESP client for SpinelDB and other Redis-compatible
//! servers, with pub/sub and server-assisted client-side caching.

pub mod client;
pub mod config;
pub mod core;

// Re-export
pub use crate::client::{Client, Pipeline};
pub use crate::config::{ConnectionOptions, Endpoint, RespProtocol};
pub use crate::core::cache::{CacheKey, CacheMode, ClientSideCache, MemoryCache};
pub use crate::core::pubsub::{Payload, PayloadFormat, PubSubMessage, Subscription, SubscriptionKind};
pub use crate::core::{ClientError, Command, CommandFlags, RespFrame};
pub use tokio_util::sync::CancellationToken;
