// src/core/pubsub/registry.rs

//! The per-connection map of subscriptions to callbacks.

use bytes::Bytes;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use strum_macros::Display;

/// Which subscribe family a subscription belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SubscriptionKind {
    Channel,
    Pattern,
    Shard,
}

impl SubscriptionKind {
    pub const ALL: [SubscriptionKind; 3] = [
        SubscriptionKind::Channel,
        SubscriptionKind::Pattern,
        SubscriptionKind::Shard,
    ];

    pub fn subscribe_command(self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "SUBSCRIBE",
            SubscriptionKind::Pattern => "PSUBSCRIBE",
            SubscriptionKind::Shard => "SSUBSCRIBE",
        }
    }

    pub fn unsubscribe_command(self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "UNSUBSCRIBE",
            SubscriptionKind::Pattern => "PUNSUBSCRIBE",
            SubscriptionKind::Shard => "SUNSUBSCRIBE",
        }
    }

    /// Recognizes a subscribe or unsubscribe acknowledgement tag. The flag is
    /// true for subscribe acks.
    pub fn from_ack(tag: &str) -> Option<(Self, bool)> {
        match tag {
            "subscribe" => Some((SubscriptionKind::Channel, true)),
            "psubscribe" => Some((SubscriptionKind::Pattern, true)),
            "ssubscribe" => Some((SubscriptionKind::Shard, true)),
            "unsubscribe" => Some((SubscriptionKind::Channel, false)),
            "punsubscribe" => Some((SubscriptionKind::Pattern, false)),
            "sunsubscribe" => Some((SubscriptionKind::Shard, false)),
            _ => None,
        }
    }
}

/// How a callback wants its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFormat {
    #[default]
    Text,
    Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Bytes(Bytes),
}

impl Payload {
    pub fn decode(raw: Bytes, format: PayloadFormat) -> Self {
        match format {
            PayloadFormat::Text => Payload::Text(String::from_utf8_lossy(&raw).into_owned()),
            PayloadFormat::Bytes => Payload::Bytes(raw),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(s) => s.as_bytes(),
            Payload::Bytes(b) => b,
        }
    }
}

/// A message delivered to a subscription callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub kind: SubscriptionKind,
    pub channel: Bytes,
    /// The matching pattern, for pattern subscriptions.
    pub pattern: Option<Bytes>,
    pub payload: Payload,
}

pub type MessageCallback = Arc<dyn Fn(PubSubMessage) + Send + Sync>;

#[derive(Clone)]
pub struct Subscription {
    pub callback: MessageCallback,
    pub format: PayloadFormat,
}

impl Subscription {
    pub fn new(callback: MessageCallback, format: PayloadFormat) -> Self {
        Self { callback, format }
    }

    /// A subscription whose messages are consumed elsewhere.
    pub fn noop() -> Self {
        Self {
            callback: Arc::new(|_| {}),
            format: PayloadFormat::Bytes,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// Subscriptions owned by one subscription connection. The registry outlives
/// the socket, so a replacement connection can replay it.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: DashMap<(SubscriptionKind, Bytes), Subscription>,
    /// Subscription count last reported by the server in an ack.
    acked: AtomicUsize,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a callback. Returns true if the name was new.
    pub fn register(&self, kind: SubscriptionKind, name: Bytes, sub: Subscription) -> bool {
        self.entries.insert((kind, name), sub).is_none()
    }

    pub fn remove(&self, kind: SubscriptionKind, name: &Bytes) -> Option<Subscription> {
        self.entries
            .remove(&(kind, name.clone()))
            .map(|(_, sub)| sub)
    }

    /// Removes every subscription of `kind` and returns the names.
    pub fn remove_kind(&self, kind: SubscriptionKind) -> Vec<Bytes> {
        let names = self.names_of(kind);
        for name in &names {
            self.entries.remove(&(kind, name.clone()));
        }
        names
    }

    pub fn lookup(&self, kind: SubscriptionKind, name: &Bytes) -> Option<Subscription> {
        self.entries
            .get(&(kind, name.clone()))
            .map(|e| e.value().clone())
    }

    pub fn contains(&self, kind: SubscriptionKind, name: &Bytes) -> bool {
        self.entries.contains_key(&(kind, name.clone()))
    }

    pub fn names_of(&self, kind: SubscriptionKind) -> Vec<Bytes> {
        self.entries
            .iter()
            .filter(|e| e.key().0 == kind)
            .map(|e| e.key().1.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn acked_count(&self) -> usize {
        self.acked.load(Ordering::Acquire)
    }

    pub fn set_acked_count(&self, count: usize) {
        self.acked.store(count, Ordering::Release);
    }
}
