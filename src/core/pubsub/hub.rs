// src/core/pubsub/hub.rs

//! Owns every subscription connection of a client.
//!
//! Subscriptions are packed onto a connection until it holds
//! `subscription_concurrency` names, then a new connection is opened. One
//! extra connection, opened only when client-side caching is enabled,
//! receives the redirected key invalidations.

use super::INVALIDATION_CHANNEL;
use super::connection::SubscriptionConnection;
use super::dispatcher::Dispatcher;
use super::registry::{Subscription, SubscriptionKind, SubscriptionRegistry};
use crate::config::{ConnectionOptions, Endpoint};
use crate::core::ClientError;
use crate::core::cache::{CacheCoordinator, TrackingPolicy};
use crate::core::runtime::IoRuntime;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct InvalidationLink {
    conn: Arc<SubscriptionConnection>,
    coordinator: Arc<CacheCoordinator>,
    policy: Arc<TrackingPolicy>,
}

pub struct SubscriptionHub {
    endpoint: Endpoint,
    options: ConnectionOptions,
    dispatcher: Dispatcher,
    slots: Mutex<Vec<Arc<SubscriptionConnection>>>,
    invalidation: Mutex<Option<InvalidationLink>>,
    next_id: AtomicU64,
    disposed: AtomicBool,
}

impl std::fmt::Debug for SubscriptionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHub")
            .field("endpoint", &self.endpoint)
            .field("disposed", &self.disposed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl SubscriptionHub {
    pub fn new(endpoint: Endpoint, options: ConnectionOptions, runtime: &IoRuntime) -> Self {
        Self {
            endpoint,
            options,
            dispatcher: Dispatcher::start(runtime.handle()),
            slots: Mutex::new(Vec::new()),
            invalidation: Mutex::new(None),
            next_id: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
        }
    }

    fn ensure_live(&self) -> Result<(), ClientError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(ClientError::Disposed("subscription hub"))
        } else {
            Ok(())
        }
    }

    async fn open(
        &self,
        registry: Arc<SubscriptionRegistry>,
        coordinator: Option<Arc<CacheCoordinator>>,
    ) -> Result<SubscriptionConnection, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        SubscriptionConnection::open_async(
            id,
            &self.endpoint,
            &self.options,
            registry,
            self.dispatcher.clone(),
            coordinator,
        )
        .await
    }

    /// Subscribes `channels` of `kind` to `sub`. A name already subscribed
    /// keeps its connection and gets the new callback; new names fill the
    /// spare capacity of open connections before new ones are opened.
    pub async fn subscribe(
        &self,
        kind: SubscriptionKind,
        channels: Vec<Bytes>,
        sub: Subscription,
    ) -> Result<(), ClientError> {
        self.ensure_live()?;
        if channels.is_empty() {
            return Err(ClientError::InvalidConfig(
                "subscribe needs at least one channel".to_string(),
            ));
        }
        let mut slots = self.slots.lock().await;
        self.ensure_live()?;
        let limit = self.options.subscription_concurrency;

        let mut plan: Vec<(Arc<SubscriptionConnection>, Vec<Bytes>)> = Vec::new();
        let mut unplaced: Vec<Bytes> = Vec::new();
        for channel in channels {
            match slots.iter().find(|s| s.registry().contains(kind, &channel)) {
                Some(slot) => assign(&mut plan, slot, channel),
                None if !unplaced.contains(&channel) => unplaced.push(channel),
                None => {}
            }
        }

        let mut unplaced = unplaced.into_iter().peekable();
        for slot in slots.iter().filter(|s| s.is_connected()) {
            if unplaced.peek().is_none() {
                break;
            }
            for channel in unplaced.by_ref().take(limit.saturating_sub(slot.count())) {
                assign(&mut plan, slot, channel);
            }
        }
        while unplaced.peek().is_some() {
            let fresh = Arc::new(
                self.open(Arc::new(SubscriptionRegistry::new()), None)
                    .await?,
            );
            debug!(
                "Opened subscription connection {} ({} in use).",
                fresh.connection().id(),
                slots.len() + 1
            );
            slots.push(Arc::clone(&fresh));
            plan.push((fresh, unplaced.by_ref().take(limit).collect()));
        }

        for (slot, names) in plan {
            slot.subscribe(kind, names, sub.clone()).await?;
        }
        if self.close_if_disposed(&mut slots) {
            return Err(ClientError::Disposed("subscription hub"));
        }
        Ok(())
    }

    /// `dispose` skips connections whose lock is held; the holder closes
    /// them once it sees the flag.
    fn close_if_disposed(&self, slots: &mut Vec<Arc<SubscriptionConnection>>) -> bool {
        if !self.disposed.load(Ordering::Acquire) {
            return false;
        }
        for slot in slots.drain(..) {
            slot.close();
        }
        true
    }

    /// Unsubscribes `channels` of `kind`; an empty list removes every
    /// subscription of that kind. Returns how many names were removed.
    pub async fn unsubscribe(
        &self,
        kind: SubscriptionKind,
        channels: Vec<Bytes>,
    ) -> Result<usize, ClientError> {
        self.ensure_live()?;
        let slots = self.slots.lock().await;
        let mut removed = 0;
        for slot in slots.iter() {
            let mine: Vec<Bytes> = if channels.is_empty() {
                Vec::new()
            } else {
                channels
                    .iter()
                    .filter(|c| slot.registry().contains(kind, c))
                    .cloned()
                    .collect()
            };
            if !channels.is_empty() && mine.is_empty() {
                continue;
            }
            removed += slot.unsubscribe(kind, mine).await?.len();
        }
        Ok(removed)
    }

    /// Total subscriptions across all connections.
    pub async fn subscription_count(&self) -> usize {
        self.slots.lock().await.iter().map(|s| s.count()).sum()
    }

    async fn open_invalidation(
        &self,
        coordinator: &Arc<CacheCoordinator>,
    ) -> Result<Arc<SubscriptionConnection>, ClientError> {
        let conn = self
            .open(
                Arc::new(SubscriptionRegistry::new()),
                Some(Arc::clone(coordinator)),
            )
            .await?;
        if conn.client_id() == 0 {
            conn.close();
            return Err(ClientError::Cache(
                "server did not report a client id; cannot redirect invalidations".to_string(),
            ));
        }
        let setup = async {
            conn.subscribe(
                SubscriptionKind::Channel,
                vec![Bytes::from_static(INVALIDATION_CHANNEL.as_bytes())],
                Subscription::noop(),
            )
            .await?;
            // Returns once the subscribe ack has been read.
            conn.ping_async().await
        };
        if let Err(e) = setup.await {
            conn.close();
            return Err(e);
        }
        Ok(Arc::new(conn))
    }

    /// Opens the invalidation connection and brings the coordinator online.
    /// Returns the tracking policy pooled connections must apply. Calling it
    /// again returns the existing policy.
    pub async fn enable_invalidation(
        &self,
        coordinator: Arc<CacheCoordinator>,
    ) -> Result<Arc<TrackingPolicy>, ClientError> {
        self.ensure_live()?;
        let mut link = self.invalidation.lock().await;
        if let Some(existing) = link.as_ref() {
            return Ok(Arc::clone(&existing.policy));
        }
        let conn = self.open_invalidation(&coordinator).await?;
        if self.disposed.load(Ordering::Acquire) {
            conn.close();
            return Err(ClientError::Disposed("subscription hub"));
        }
        let policy = Arc::new(TrackingPolicy::new(
            conn.client_id(),
            coordinator.mode(),
            coordinator.tracking_prefixes(),
        ));
        coordinator.set_online(true);
        info!(
            "Client-side caching enabled; invalidations redirected to client {}.",
            conn.client_id()
        );
        *link = Some(InvalidationLink {
            conn,
            coordinator,
            policy: Arc::clone(&policy),
        });
        Ok(policy)
    }

    async fn is_healthy(conn: &SubscriptionConnection) -> bool {
        conn.is_connected() && conn.ping_async().await.is_ok()
    }

    /// Pings every subscription connection and replaces the ones that fail,
    /// replaying their subscriptions onto the replacement. Returns how many
    /// connections were replaced.
    pub async fn revalidate(&self) -> usize {
        if self.disposed.load(Ordering::Acquire) {
            return 0;
        }
        let mut replaced = 0;

        {
            let mut slots = self.slots.lock().await;
            let mut kept = Vec::with_capacity(slots.len());
            for slot in slots.drain(..) {
                if Self::is_healthy(&slot).await {
                    kept.push(slot);
                    continue;
                }
                slot.close();
                if slot.count() == 0 {
                    debug!("Dropping idle dead subscription connection.");
                    continue;
                }
                match self.reopen(Arc::clone(slot.registry())).await {
                    Ok(fresh) => {
                        kept.push(fresh);
                        replaced += 1;
                    }
                    Err(e) => {
                        warn!("Failed to restore subscriptions: {}", e);
                        // Keep the registry so the next sweep retries.
                        kept.push(slot);
                    }
                }
            }
            *slots = kept;
            if self.close_if_disposed(&mut slots) {
                return replaced;
            }
        }

        let mut link = self.invalidation.lock().await;
        if let Some(current) = link.as_mut()
            && !Self::is_healthy(&current.conn).await
        {
            current.conn.close();
            current.coordinator.set_online(false);
            match self.open_invalidation(&current.coordinator).await {
                Ok(fresh) => {
                    current.policy.set_redirect_id(fresh.client_id());
                    current.conn = fresh;
                    // Anything read while the link was down may be stale.
                    current.coordinator.clear();
                    current.coordinator.set_online(true);
                    info!(
                        "Invalidation connection restored; redirecting to client {}.",
                        current.policy.redirect_id()
                    );
                    replaced += 1;
                }
                Err(e) => warn!("Failed to restore invalidation connection: {}", e),
            }
        }
        if self.disposed.load(Ordering::Acquire)
            && let Some(stale) = link.take()
        {
            stale.coordinator.set_online(false);
            stale.conn.close();
        }
        replaced
    }

    async fn reopen(
        &self,
        registry: Arc<SubscriptionRegistry>,
    ) -> Result<Arc<SubscriptionConnection>, ClientError> {
        let fresh = self.open(registry, None).await?;
        if let Err(e) = fresh.replay_async().await {
            fresh.close();
            return Err(e);
        }
        Ok(Arc::new(fresh))
    }

    /// Closes every subscription connection. Registered callbacks are dropped.
    /// Connections locked by an operation in progress are closed by that
    /// operation when it finishes.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut slots) = self.slots.try_lock() {
            for slot in slots.drain(..) {
                slot.close();
            }
        }
        if let Ok(mut guard) = self.invalidation.try_lock()
            && let Some(link) = guard.take()
        {
            link.coordinator.set_online(false);
            link.conn.close();
        }
        debug!("Subscription hub disposed.");
    }
}

fn assign(
    plan: &mut Vec<(Arc<SubscriptionConnection>, Vec<Bytes>)>,
    slot: &Arc<SubscriptionConnection>,
    channel: Bytes,
) {
    match plan.iter_mut().find(|(s, _)| Arc::ptr_eq(s, slot)) {
        Some((_, names)) => names.push(channel),
        None => plan.push((Arc::clone(slot), vec![channel])),
    }
}
