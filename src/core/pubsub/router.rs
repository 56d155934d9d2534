// src/core/pubsub/router.rs

//! Routes frames read on a subscription connection.
//!
//! Messages go to the dispatcher, acknowledgements update the registry,
//! invalidations go straight to the cache coordinator, and anything else
//! (a `pong`, a reply to a regular command) is handed back to the in-flight
//! slot.

use super::INVALIDATION_CHANNEL;
use super::dispatcher::Dispatcher;
use super::registry::{Payload, PubSubMessage, SubscriptionKind, SubscriptionRegistry};
use crate::core::cache::CacheCoordinator;
use crate::core::connection::PushHandler;
use crate::core::protocol::RespFrame;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct SubscriptionRouter {
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Dispatcher,
    coordinator: Option<Arc<CacheCoordinator>>,
}

impl SubscriptionRouter {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        dispatcher: Dispatcher,
        coordinator: Option<Arc<CacheCoordinator>>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            coordinator,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    fn deliver(&self, kind: SubscriptionKind, name: Bytes, channel: Bytes, pattern: Option<Bytes>, raw: &RespFrame) {
        let Some(sub) = self.registry.lookup(kind, &name) else {
            debug!(
                "No callback for {} '{}'; dropping message.",
                kind,
                String::from_utf8_lossy(&name)
            );
            return;
        };
        let payload = match raw {
            RespFrame::BulkString(b) => b.clone(),
            other => Bytes::from(other.to_text_lossy().into_owned()),
        };
        let message = PubSubMessage {
            kind,
            channel,
            pattern,
            payload: Payload::decode(payload, sub.format),
        };
        self.dispatcher.dispatch(sub.callback, message);
    }

    fn invalidate(&self, payload: &RespFrame) {
        match &self.coordinator {
            Some(coordinator) => coordinator.invalidate(payload),
            None => debug!("Invalidation received with caching disabled."),
        }
    }

    fn acknowledge(&self, kind: SubscriptionKind, subscribe: bool, items: &[RespFrame]) {
        if let Some(count) = items.get(2).and_then(RespFrame::as_u64) {
            self.registry.set_acked_count(count as usize);
        }
        if !subscribe
            && let Some(name) = items.get(1).and_then(RespFrame::as_bytes)
        {
            self.registry.remove(kind, &Bytes::copy_from_slice(name));
        }
    }
}

fn bytes_at(items: &[RespFrame], index: usize) -> Option<Bytes> {
    items
        .get(index)
        .and_then(RespFrame::as_bytes)
        .map(Bytes::copy_from_slice)
}

impl PushHandler for SubscriptionRouter {
    fn route(&self, frame: RespFrame) -> Option<RespFrame> {
        let items = match &frame {
            RespFrame::Array(items) | RespFrame::Push(items) => items,
            _ => return Some(frame),
        };
        let Some(tag) = items.first().and_then(RespFrame::as_str) else {
            return Some(frame);
        };

        match tag.to_ascii_lowercase().as_str() {
            "message" if items.len() >= 3 => {
                let channel = bytes_at(items, 1)?;
                if channel.as_ref() == INVALIDATION_CHANNEL.as_bytes() {
                    self.invalidate(&items[2]);
                } else {
                    self.deliver(SubscriptionKind::Channel, channel.clone(), channel, None, &items[2]);
                }
                None
            }
            "smessage" if items.len() >= 3 => {
                let channel = bytes_at(items, 1)?;
                self.deliver(SubscriptionKind::Shard, channel.clone(), channel, None, &items[2]);
                None
            }
            "pmessage" if items.len() >= 4 => {
                let pattern = bytes_at(items, 1)?;
                let channel = bytes_at(items, 2)?;
                self.deliver(
                    SubscriptionKind::Pattern,
                    pattern.clone(),
                    channel,
                    Some(pattern),
                    &items[3],
                );
                None
            }
            "invalidate" if items.len() >= 2 => {
                self.invalidate(&items[1]);
                None
            }
            "pong" => Some(frame),
            other => match SubscriptionKind::from_ack(other) {
                Some((kind, subscribe)) => {
                    self.acknowledge(kind, subscribe, items);
                    None
                }
                None => Some(frame),
            },
        }
    }

    fn on_disconnect(&self) {
        if let Some(coordinator) = &self.coordinator {
            warn!("Invalidation connection lost; client-side cache suspended.");
            coordinator.set_online(false);
        }
    }
}
