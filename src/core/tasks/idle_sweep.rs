// src/core/tasks/idle_sweep.rs

use crate::core::cache::CacheCoordinator;
use crate::core::pool::{ConnectionPool, ReplicaPools, SweepReport};
use crate::core::pubsub::SubscriptionHub;
use futures::FutureExt;
use once_cell::sync::OnceCell;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(120);

/// The wake interval for a given idle timeout, clamped to 30s..=120s.
pub fn sweep_interval(idle_timeout: Duration) -> Duration {
    idle_timeout.clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
}

/// What one pass of the sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub master: SweepReport,
    pub replicas: SweepReport,
    pub subscriptions_replaced: usize,
    pub stamps_pruned: usize,
}

/// A task that heartbeats idle pooled connections, trims the pools back
/// towards their minimum size, and repairs subscription connections.
pub struct IdleSweeper {
    master: ConnectionPool,
    replicas: Option<ReplicaPools>,
    hub: Arc<SubscriptionHub>,
    cache: Arc<OnceCell<Arc<CacheCoordinator>>>,
    interval: Duration,
}

impl IdleSweeper {
    pub fn new(
        master: ConnectionPool,
        replicas: Option<ReplicaPools>,
        hub: Arc<SubscriptionHub>,
        cache: Arc<OnceCell<Arc<CacheCoordinator>>>,
        interval: Duration,
    ) -> Self {
        Self {
            master,
            replicas,
            hub,
            cache,
            interval,
        }
    }

    /// Runs the main loop until a shutdown signal arrives.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Idle sweep started (interval {:?}).", self.interval);
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let summary = self.sweep_once().await;
                    debug!("Idle sweep finished: {:?}", summary);
                }
                _ = shutdown_rx.recv() => {
                    info!("Idle sweep shutting down.");
                    return;
                }
            }
        }
    }

    /// One pass over every phase. A failure in one phase is logged and never
    /// stops the others.
    pub async fn sweep_once(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();

        match AssertUnwindSafe(self.master.sweep()).catch_unwind().await {
            Ok(report) => summary.master = report,
            Err(_) => warn!("Master pool sweep panicked."),
        }

        if let Some(replicas) = &self.replicas {
            match AssertUnwindSafe(replicas.sweep()).catch_unwind().await {
                Ok(report) => summary.replicas = report,
                Err(_) => warn!("Replica pool sweep panicked."),
            }
        }

        match AssertUnwindSafe(self.hub.revalidate()).catch_unwind().await {
            Ok(replaced) => summary.subscriptions_replaced = replaced,
            Err(_) => warn!("Subscription sweep panicked."),
        }

        if let Some(coordinator) = self.cache.get() {
            summary.stamps_pruned = coordinator.prune_stamps();
        }
        summary
    }
}
