// src/core/pool/mod.rs

//! A bounded pool of connections to one endpoint.
//!
//! Acquisition pops an idle connection, creates one while under the limit,
//! or queues the caller. Returned connections go straight to the oldest
//! waiter (blocking callers before async ones) and only then back onto the
//! idle stack. The waiter queues are always locked before the idle stack, and
//! both the "enqueue" and the "return" paths run under the waiter lock, so a
//! connection can never be pushed idle while a waiter sits unnoticed.

pub mod replica;
pub mod waiters;

use crate::config::{ConnectionOptions, Endpoint};
use crate::core::cache::TrackingPolicy;
use crate::core::connection::Connection;
use crate::core::metrics;
use crate::core::runtime::IoRuntime;
use crate::core::ClientError;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use strum_macros::Display;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use waiters::{Handoff, SyncWaiter, WaitOutcome, Waiters};

pub use replica::ReplicaPools;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum PoolRole {
    Master,
    Replica,
}

impl PoolRole {
    pub fn label(self) -> &'static str {
        match self {
            PoolRole::Master => "master",
            PoolRole::Replica => "replica",
        }
    }

    fn timeout_message(self) -> &'static str {
        match self {
            PoolRole::Master => "get connection timeout",
            PoolRole::Replica => "get slave connection timeout",
        }
    }
}

/// A point-in-time view of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub live: usize,
    pub idle: usize,
    pub sync_waiters: usize,
    pub async_waiters: usize,
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub healthy: usize,
    pub evicted: usize,
    pub discarded: usize,
    pub created: usize,
}

struct PoolInner {
    role: PoolRole,
    endpoint: Endpoint,
    endpoint_label: String,
    options: ConnectionOptions,
    runtime: Arc<IoRuntime>,
    all: DashMap<u64, Arc<Connection>>,
    idle: Mutex<Vec<Arc<Connection>>>,
    live: AtomicUsize,
    next_id: AtomicU64,
    waiters: Mutex<Waiters>,
    disposed: AtomicBool,
    tracking: RwLock<Option<Arc<TrackingPolicy>>>,
}

/// The result of trying to get a connection without waiting.
enum Step {
    Idle(Arc<Connection>),
    Reserved,
    Queued,
}

enum Woke {
    Handoff(Handoff),
    Deadline,
    Cancelled,
}

/// A cheaply clonable handle to a pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("role", &self.inner.role)
            .field("endpoint", &self.inner.endpoint)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(
        role: PoolRole,
        endpoint: Endpoint,
        options: ConnectionOptions,
        runtime: Arc<IoRuntime>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                role,
                endpoint_label: endpoint.to_string(),
                endpoint,
                options,
                runtime,
                all: DashMap::new(),
                idle: Mutex::new(Vec::new()),
                live: AtomicUsize::new(0),
                next_id: AtomicU64::new(0),
                waiters: Mutex::new(Waiters::default()),
                disposed: AtomicBool::new(false),
                tracking: RwLock::new(None),
            }),
        }
    }

    pub fn role(&self) -> PoolRole {
        self.inner.role
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Installs (or removes) the tracking policy applied to connections
    /// before they are handed out.
    pub fn set_tracking(&self, policy: Option<Arc<TrackingPolicy>>) {
        *self.inner.tracking.write() = policy;
    }

    /// Acquires a connection, blocking the calling thread up to the command timeout.
    pub fn get_connection(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<PooledConnection, ClientError> {
        let deadline = Instant::now() + self.inner.options.command_timeout();
        self.get_connection_until(deadline, cancel)
    }

    /// Acquires a connection, blocking the calling thread until `deadline`.
    pub fn get_connection_until(
        &self,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> Result<PooledConnection, ClientError> {
        let inner = &self.inner;
        inner.ensure_live()?;

        loop {
            let waiter = Arc::new(SyncWaiter::new());
            match inner.try_acquire(|w| w.sync.push_back(Arc::clone(&waiter)))? {
                Step::Idle(conn) => {
                    if let Some(conn) = inner.prepare_blocking(conn) {
                        return Ok(self.guard(conn));
                    }
                    continue;
                }
                Step::Reserved => {
                    let conn = inner.create_blocking()?;
                    return Ok(self.guard(conn));
                }
                Step::Queued => {}
            }

            let watcher = cancel.map(|token| {
                let token = token.clone();
                let waiter = Arc::clone(&waiter);
                inner.runtime.spawn(async move {
                    token.cancelled().await;
                    waiter.interrupt();
                })
            });
            let outcome = waiter.wait_until(deadline);
            if let Some(watcher) = watcher {
                watcher.abort();
            }
            inner.update_waiter_gauges();

            match outcome {
                WaitOutcome::Handoff(Handoff::Connection(conn)) => {
                    if let Some(conn) = inner.prepare_blocking(conn) {
                        return Ok(self.guard(conn));
                    }
                }
                WaitOutcome::Handoff(Handoff::Capacity) => {}
                WaitOutcome::Handoff(Handoff::Disposed) => {
                    return Err(ClientError::Disposed("connection pool"));
                }
                WaitOutcome::TimedOut => return Err(inner.pool_timeout()),
                WaitOutcome::Interrupted => return Err(inner.acquire_cancelled()),
            }
        }
    }

    /// Acquires a connection, suspending up to the command timeout.
    pub async fn get_connection_async(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<PooledConnection, ClientError> {
        let deadline = Instant::now() + self.inner.options.command_timeout();
        self.get_connection_async_until(deadline, cancel).await
    }

    /// Acquires a connection, suspending until `deadline`.
    pub async fn get_connection_async_until(
        &self,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> Result<PooledConnection, ClientError> {
        let inner = &self.inner;
        inner.ensure_live()?;

        loop {
            let (tx, rx) = oneshot::channel();
            let mut tx = Some(tx);
            let step = inner.try_acquire(|w| {
                if let Some(tx) = tx.take() {
                    w.async_.push_back(tx);
                }
            })?;
            match step {
                Step::Idle(conn) => {
                    if let Some(conn) = inner.prepare_async(conn).await {
                        return Ok(self.guard(conn));
                    }
                    continue;
                }
                Step::Reserved => {
                    let conn = Arc::clone(inner).create_async().await?;
                    return Ok(self.guard(conn));
                }
                Step::Queued => {}
            }

            let mut wait = AsyncWait {
                rx: Some(rx),
                pool: Arc::clone(inner),
            };
            let woke = tokio::select! {
                handoff = wait.recv() => Woke::Handoff(handoff.unwrap_or(Handoff::Disposed)),
                _ = tokio::time::sleep_until(deadline.into()) => Woke::Deadline,
                _ = cancelled(cancel) => Woke::Cancelled,
            };
            let (handoff, was_cancelled) = match woke {
                Woke::Handoff(handoff) => (Some(handoff), false),
                Woke::Deadline => (wait.reclaim(), false),
                Woke::Cancelled => (wait.reclaim(), true),
            };
            drop(wait);
            inner.update_waiter_gauges();

            match handoff {
                Some(Handoff::Connection(conn)) => {
                    if let Some(conn) = inner.prepare_async(conn).await {
                        return Ok(self.guard(conn));
                    }
                }
                Some(Handoff::Capacity) => {}
                Some(Handoff::Disposed) => {
                    return Err(ClientError::Disposed("connection pool"));
                }
                None if was_cancelled => return Err(inner.acquire_cancelled()),
                None => return Err(inner.pool_timeout()),
            }
        }
    }

    /// Takes an idle connection or opens one in a free slot without queueing.
    /// `Ok(None)` means the pool is at its limit with nothing idle.
    pub fn try_get_connection(&self) -> Result<Option<PooledConnection>, ClientError> {
        let inner = &self.inner;
        inner.ensure_live()?;
        loop {
            let idle = inner.idle.lock().pop();
            if let Some(conn) = idle {
                if let Some(conn) = inner.prepare_blocking(conn) {
                    return Ok(Some(self.guard(conn)));
                }
                continue;
            }
            if !inner.try_reserve() {
                return Ok(None);
            }
            let conn = inner.create_blocking()?;
            return Ok(Some(self.guard(conn)));
        }
    }

    pub async fn try_get_connection_async(&self) -> Result<Option<PooledConnection>, ClientError> {
        let inner = &self.inner;
        inner.ensure_live()?;
        loop {
            let idle = inner.idle.lock().pop();
            if let Some(conn) = idle {
                if let Some(conn) = inner.prepare_async(conn).await {
                    return Ok(Some(self.guard(conn)));
                }
                continue;
            }
            if !inner.try_reserve() {
                return Ok(None);
            }
            let conn = Arc::clone(inner).create_async().await?;
            return Ok(Some(self.guard(conn)));
        }
    }

    /// Returns a connection taken out with [`PooledConnection::detach`] or
    /// created by [`ConnectionPool::create_connection_async`].
    pub fn return_connection(&self, conn: Arc<Connection>) {
        self.inner.return_connection(conn);
    }

    /// Reserves a slot and opens a connection, or returns `None` at the limit.
    pub async fn create_connection_async(&self) -> Result<Option<Arc<Connection>>, ClientError> {
        self.inner.ensure_live()?;
        if !self.inner.try_reserve() {
            return Ok(None);
        }
        Arc::clone(&self.inner).create_async().await.map(Some)
    }

    /// Pings every idle connection, evicts broken ones, discards connections
    /// idle past the timeout while above the minimum size, and refills the
    /// pool to its minimum if it emptied.
    pub async fn sweep(&self) -> SweepReport {
        let inner = &self.inner;
        let mut report = SweepReport::default();
        if inner.disposed.load(Ordering::Acquire) {
            return report;
        }

        let idle = std::mem::take(&mut *inner.idle.lock());
        let idle_timeout = inner.options.idle_timeout();
        for conn in idle {
            if !conn.is_connected() {
                inner.evict(&conn);
                report.evicted += 1;
                continue;
            }
            if inner.live.load(Ordering::Acquire) > inner.options.min_pool_size
                && conn.idle_for() >= idle_timeout
            {
                debug!(
                    "Discarding connection {} idle for {:?}.",
                    conn.id(),
                    conn.idle_for()
                );
                inner.evict(&conn);
                report.discarded += 1;
                continue;
            }
            match conn.ping_async().await {
                Ok(()) => {
                    inner.return_connection(conn);
                    report.healthy += 1;
                }
                Err(e) => {
                    debug!("Heartbeat failed on connection {}: {}", conn.id(), e);
                    inner.evict(&conn);
                    report.evicted += 1;
                }
            }
        }

        if inner.live.load(Ordering::Acquire) == 0 {
            for _ in 0..inner.options.min_pool_size {
                if !inner.try_reserve() {
                    break;
                }
                match Arc::clone(inner).create_async().await {
                    Ok(conn) => {
                        inner.return_connection(conn);
                        report.created += 1;
                    }
                    Err(e) => {
                        warn!(
                            "Could not replenish {} pool for {}: {}",
                            inner.role, inner.endpoint, e
                        );
                        break;
                    }
                }
            }
        }
        report
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let (sync_waiters, async_waiters) = {
            let mut waiters = inner.waiters.lock();
            waiters.prune();
            (waiters.sync.len(), waiters.async_.len())
        };
        PoolStats {
            live: inner.live.load(Ordering::Acquire),
            idle: inner.idle.lock().len(),
            sync_waiters,
            async_waiters,
        }
    }

    /// Releases every waiter with a disposed error and closes all connections.
    pub fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (sync, async_) = inner.waiters.lock().drain();
        for waiter in sync {
            let _ = waiter.offer(Handoff::Disposed);
        }
        for tx in async_ {
            let _ = tx.send(Handoff::Disposed);
        }
        inner.idle.lock().clear();
        let conns: Vec<Arc<Connection>> = inner.all.iter().map(|e| Arc::clone(e.value())).collect();
        inner.all.clear();
        for conn in &conns {
            conn.close();
        }
        inner.live.store(0, Ordering::Release);
        inner.update_gauges();
        info!(
            "Disposed {} pool for {} ({} connections closed).",
            inner.role,
            inner.endpoint,
            conns.len()
        );
    }

    fn guard(&self, conn: Arc<Connection>) -> PooledConnection {
        PooledConnection {
            conn,
            pool: Arc::clone(&self.inner),
            detached: false,
        }
    }
}

impl PoolInner {
    fn ensure_live(&self) -> Result<(), ClientError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(ClientError::Disposed("connection pool"))
        } else {
            Ok(())
        }
    }

    fn pool_timeout(&self) -> ClientError {
        metrics::POOL_TIMEOUTS_TOTAL
            .with_label_values(&[self.role.label()])
            .inc();
        ClientError::PoolTimeout(self.role.timeout_message())
    }

    fn acquire_cancelled(&self) -> ClientError {
        ClientError::Cancelled {
            command: format!("acquire {} connection", self.role.label()),
        }
    }

    /// Pops an idle connection or reserves a slot; failing both, registers
    /// the caller through `enqueue`. The fallback re-check runs under the
    /// waiter lock so it cannot miss a concurrent return or eviction.
    fn try_acquire(&self, enqueue: impl FnOnce(&mut Waiters)) -> Result<Step, ClientError> {
        if let Some(conn) = self.idle.lock().pop() {
            return Ok(Step::Idle(conn));
        }
        if self.try_reserve() {
            return Ok(Step::Reserved);
        }

        let mut waiters = self.waiters.lock();
        self.ensure_live()?;
        if let Some(conn) = self.idle.lock().pop() {
            return Ok(Step::Idle(conn));
        }
        if self.try_reserve() {
            return Ok(Step::Reserved);
        }
        enqueue(&mut waiters);
        drop(waiters);
        self.update_waiter_gauges();
        Ok(Step::Queued)
    }

    fn try_reserve(&self) -> bool {
        let max = self.options.max_pool_size;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    /// Gives a reserved slot back and lets the oldest waiter use it.
    fn release_slot(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        let _ = self.waiters.lock().offer(Handoff::Capacity);
        self.update_gauges();
    }

    /// Opens a connection for an already reserved slot.
    async fn create_async(self: Arc<Self>) -> Result<Arc<Connection>, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let policy = self.tracking.read().clone();
        let opened = async {
            let conn = Connection::connect_async(id, &self.endpoint, &self.options, None).await?;
            if let Some(policy) = policy.filter(|p| p.redirect_id() != 0) {
                conn.enable_tracking_async(
                    policy.redirect_id(),
                    policy.is_broadcast(),
                    policy.prefixes(),
                )
                .await?;
            }
            Ok::<_, ClientError>(conn)
        }
        .await;

        match opened {
            Ok(conn) => {
                if self.disposed.load(Ordering::Acquire) {
                    conn.close();
                    return Err(ClientError::Disposed("connection pool"));
                }
                self.all.insert(id, Arc::clone(&conn));
                self.update_gauges();
                debug!(
                    "{} pool for {} opened connection {}.",
                    self.role, self.endpoint, id
                );
                Ok(conn)
            }
            Err(e) => {
                if !self.disposed.load(Ordering::Acquire) {
                    self.release_slot();
                }
                warn!(
                    "{} pool failed to connect to {}: {}",
                    self.role, self.endpoint, e
                );
                Err(e)
            }
        }
    }

    fn create_blocking(self: &Arc<Self>) -> Result<Arc<Connection>, ClientError> {
        let inner = Arc::clone(self);
        self.runtime.run_blocking(inner.create_async())
    }

    /// Checks a connection before it is handed out; repairs its tracking
    /// redirect if the invalidation target changed. `None` means it was evicted.
    fn prepare_blocking(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        if !conn.is_connected() {
            self.evict(&conn);
            return None;
        }
        let policy = self.tracking.read().clone();
        if let Some(policy) = policy.filter(|p| p.redirect_id() != 0)
            && conn.redirect_id() != policy.redirect_id()
            && let Err(e) =
                conn.enable_tracking(policy.redirect_id(), policy.is_broadcast(), policy.prefixes())
        {
            debug!("Re-arming tracking on connection {} failed: {}", conn.id(), e);
            self.evict(&conn);
            return None;
        }
        Some(conn)
    }

    async fn prepare_async(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        if !conn.is_connected() {
            self.evict(&conn);
            return None;
        }
        let policy = self.tracking.read().clone();
        if let Some(policy) = policy.filter(|p| p.redirect_id() != 0)
            && conn.redirect_id() != policy.redirect_id()
            && let Err(e) = conn
                .enable_tracking_async(
                    policy.redirect_id(),
                    policy.is_broadcast(),
                    policy.prefixes(),
                )
                .await
        {
            debug!("Re-arming tracking on connection {} failed: {}", conn.id(), e);
            self.evict(&conn);
            return None;
        }
        Some(conn)
    }

    fn return_connection(&self, conn: Arc<Connection>) {
        if !self.all.contains_key(&conn.id()) {
            // Evicted or disposed while checked out.
            conn.close();
            return;
        }
        if self.disposed.load(Ordering::Acquire) || !conn.is_connected() {
            self.evict(&conn);
            return;
        }

        let mut waiters = self.waiters.lock();
        if let Some(Handoff::Connection(conn)) = waiters.offer(Handoff::Connection(conn)) {
            self.idle.lock().push(conn);
        }
        drop(waiters);
        self.update_waiter_gauges();
    }

    /// Removes a connection for good and frees its slot.
    fn evict(&self, conn: &Arc<Connection>) {
        conn.close();
        if self.all.remove(&conn.id()).is_some() {
            metrics::CONNECTIONS_EVICTED_TOTAL.inc();
            debug!(
                "{} pool for {} evicted connection {}.",
                self.role,
                self.endpoint,
                conn.id()
            );
            self.release_slot();
        }
    }

    /// Puts back a hand-off that reached an async waiter which had already left.
    fn redeliver(&self, handoff: Handoff) {
        match handoff {
            Handoff::Connection(conn) => self.return_connection(conn),
            Handoff::Capacity => {
                let _ = self.waiters.lock().offer(Handoff::Capacity);
            }
            Handoff::Disposed => {}
        }
    }

    fn update_gauges(&self) {
        metrics::POOL_CONNECTIONS
            .with_label_values(&[self.role.label(), self.endpoint_label.as_str()])
            .set(self.live.load(Ordering::Acquire) as f64);
    }

    fn update_waiter_gauges(&self) {
        let (sync, async_) = {
            let waiters = self.waiters.lock();
            (waiters.sync.len(), waiters.async_.len())
        };
        let role = self.role.label();
        let endpoint = self.endpoint_label.as_str();
        metrics::POOL_WAITERS
            .with_label_values(&[role, endpoint, "sync"])
            .set(sync as f64);
        metrics::POOL_WAITERS
            .with_label_values(&[role, endpoint, "async"])
            .set(async_ as f64);
    }
}

/// The receiving side of an async wait. Dropping it mid-wait returns any
/// hand-off that already arrived to the pool.
struct AsyncWait {
    rx: Option<oneshot::Receiver<Handoff>>,
    pool: Arc<PoolInner>,
}

impl AsyncWait {
    async fn recv(&mut self) -> Option<Handoff> {
        let rx = self.rx.as_mut()?;
        let handoff = rx.await.ok();
        self.rx = None;
        handoff
    }

    fn reclaim(&mut self) -> Option<Handoff> {
        let mut rx = self.rx.take()?;
        rx.close();
        rx.try_recv().ok()
    }
}

impl Drop for AsyncWait {
    fn drop(&mut self) {
        if let Some(handoff) = self.reclaim() {
            self.pool.redeliver(handoff);
        }
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Exclusive use of a pooled connection; returns it to the pool on drop.
pub struct PooledConnection {
    conn: Arc<Connection>,
    pool: Arc<PoolInner>,
    detached: bool,
}

impl PooledConnection {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Takes the connection out of the guard; the caller must hand it back
    /// with [`ConnectionPool::return_connection`].
    pub fn detach(mut self) -> Arc<Connection> {
        self.detached = true;
        Arc::clone(&self.conn)
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.conn.id())
            .field("role", &self.pool.role)
            .field("endpoint", &self.pool.endpoint)
            .field("detached", &self.detached)
            .finish()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.detached {
            self.pool.return_connection(Arc::clone(&self.conn));
        }
    }
}
