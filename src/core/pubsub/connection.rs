// src/core/pubsub/connection.rs

//! A connection dedicated to subscriptions.
//!
//! Its socket reader routes every push through a [`SubscriptionRouter`]; the
//! subscription registry lives outside the socket so a replacement connection
//! can replay it without losing any callback.

use super::dispatcher::Dispatcher;
use super::registry::{Subscription, SubscriptionKind, SubscriptionRegistry};
use super::router::SubscriptionRouter;
use crate::config::{ConnectionOptions, Endpoint};
use crate::core::ClientError;
use crate::core::cache::CacheCoordinator;
use crate::core::commands;
use crate::core::connection::{Connection, PushHandler};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct SubscriptionConnection {
    conn: Arc<Connection>,
    registry: Arc<SubscriptionRegistry>,
    /// One command at a time on the shared in-flight slot.
    op_lock: Mutex<()>,
}

impl std::fmt::Debug for SubscriptionConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionConnection")
            .field("conn", &self.conn)
            .field("subscriptions", &self.registry.len())
            .finish()
    }
}

impl SubscriptionConnection {
    /// Connects and installs a router over `registry`. Nothing is subscribed
    /// yet; call [`SubscriptionConnection::replay_async`] to restore a
    /// registry carried over from a previous connection.
    pub async fn open_async(
        id: u64,
        endpoint: &Endpoint,
        options: &ConnectionOptions,
        registry: Arc<SubscriptionRegistry>,
        dispatcher: Dispatcher,
        coordinator: Option<Arc<CacheCoordinator>>,
    ) -> Result<Self, ClientError> {
        let router: Arc<dyn PushHandler> = Arc::new(SubscriptionRouter::new(
            Arc::clone(&registry),
            dispatcher,
            coordinator,
        ));
        let conn = Connection::connect_async(id, endpoint, options, Some(router)).await?;
        Ok(Self {
            conn,
            registry,
            op_lock: Mutex::new(()),
        })
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn client_id(&self) -> u64 {
        self.conn.client_id()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Number of subscriptions registered on this connection.
    pub fn count(&self) -> usize {
        self.registry.len()
    }

    /// Registers callbacks first, so a message racing the ack is not lost,
    /// then sends the subscribe command. Registrations are rolled back if the
    /// send fails.
    pub async fn subscribe(
        &self,
        kind: SubscriptionKind,
        channels: Vec<Bytes>,
        sub: Subscription,
    ) -> Result<(), ClientError> {
        let _op = self.op_lock.lock().await;
        let added: Vec<Bytes> = channels
            .iter()
            .filter(|c| self.registry.register(kind, (*c).clone(), sub.clone()))
            .cloned()
            .collect();

        let cmd = commands::subscribe(kind, channels);
        if let Err(e) = self.conn.execute_async(&cmd, None).await {
            for name in &added {
                self.registry.remove(kind, name);
            }
            return Err(e);
        }
        debug!(
            "Subscribed {} new {} name(s) on connection {}.",
            added.len(),
            kind,
            self.conn.id()
        );
        Ok(())
    }

    /// Drops the callbacks at once and asks the server to unsubscribe. An
    /// empty list removes every subscription of `kind` held here. Returns the
    /// names that were removed.
    pub async fn unsubscribe(
        &self,
        kind: SubscriptionKind,
        channels: Vec<Bytes>,
    ) -> Result<Vec<Bytes>, ClientError> {
        let _op = self.op_lock.lock().await;
        let removed = if channels.is_empty() {
            self.registry.remove_kind(kind)
        } else {
            channels
                .into_iter()
                .filter(|c| self.registry.remove(kind, c).is_some())
                .collect()
        };
        if removed.is_empty() {
            return Ok(removed);
        }
        if self.conn.is_connected() {
            let cmd = commands::unsubscribe(kind, removed.clone());
            self.conn.execute_async(&cmd, None).await?;
        }
        Ok(removed)
    }

    /// Re-sends a subscribe command for every name in the registry. Returns
    /// how many names were replayed.
    pub async fn replay_async(&self) -> Result<usize, ClientError> {
        let _op = self.op_lock.lock().await;
        let mut replayed = 0;
        for kind in SubscriptionKind::ALL {
            let names = self.registry.names_of(kind);
            if names.is_empty() {
                continue;
            }
            replayed += names.len();
            self.conn
                .execute_async(&commands::subscribe(kind, names), None)
                .await?;
        }
        if replayed > 0 {
            info!(
                "Restored {} subscription(s) on connection {}.",
                replayed,
                self.conn.id()
            );
        }
        Ok(replayed)
    }

    /// Liveness check. The reply comes after any acks already queued, so a
    /// successful ping also means earlier subscribes were applied.
    pub async fn ping_async(&self) -> Result<(), ClientError> {
        let _op = self.op_lock.lock().await;
        self.conn.ping_async().await
    }

    pub fn close(&self) {
        self.conn.close();
    }
}
