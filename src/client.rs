// src/client.rs

//! The call dispatcher: turns a command into a pool acquire, execute, and
//! release cycle, consulting the client-side cache first when one is attached.
//!
//! Every operation has a blocking and an async form. The blocking forms park
//! the calling thread and must not be used from inside an async task.

use crate::config::ConnectionOptions;
use crate::core::ClientError;
use crate::core::cache::{CacheCoordinator, ClientSideCache, FillTicket, Fingerprint};
use crate::core::commands;
use crate::core::pool::{ConnectionPool, PoolRole, PoolStats, PooledConnection, ReplicaPools};
use crate::core::protocol::{Command, CommandFlags, RespFrame};
use crate::core::pubsub::{
    PayloadFormat, PubSubMessage, Subscription, SubscriptionHub, SubscriptionKind,
};
use crate::core::runtime::IoRuntime;
use crate::core::tasks::{IdleSweeper, SweepSummary, sweep_interval};
use bytes::Bytes;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A handle to a client. Clones share the same pools and subscriptions; the
/// client shuts down when the last clone is dropped or on [`Client::close`].
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    options: ConnectionOptions,
    // Declared before `runtime` so connections close while it is still up.
    master: ConnectionPool,
    replicas: Option<ReplicaPools>,
    hub: Arc<SubscriptionHub>,
    cache: Arc<OnceCell<Arc<CacheCoordinator>>>,
    cache_init: tokio::sync::Mutex<()>,
    shutdown_tx: broadcast::Sender<()>,
    disposed: AtomicBool,
    runtime: Arc<IoRuntime>,
}

/// A cache fill waiting for its reply.
struct Fill {
    coordinator: Arc<CacheCoordinator>,
    ticket: FillTicket,
}

enum Plan {
    Hit(RespFrame),
    Fetch(Option<(Arc<CacheCoordinator>, Fingerprint)>),
}

impl Client {
    /// Validates `options`, builds the pools, and starts the idle sweep.
    /// No connection is opened until the first command.
    pub fn new(options: ConnectionOptions) -> Result<Self, ClientError> {
        options.validate()?;
        let runtime = Arc::new(IoRuntime::new()?);
        let endpoint = options.endpoint();

        let master = ConnectionPool::new(
            PoolRole::Master,
            endpoint.clone(),
            options.clone(),
            Arc::clone(&runtime),
        );
        let replica_endpoints = options.replica_endpoints()?;
        let replicas = (!replica_endpoints.is_empty())
            .then(|| ReplicaPools::new(replica_endpoints, &options, Arc::clone(&runtime)));
        let hub = Arc::new(SubscriptionHub::new(endpoint.clone(), options.clone(), &runtime));
        let cache = Arc::new(OnceCell::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let sweeper = IdleSweeper::new(
            master.clone(),
            replicas.clone(),
            Arc::clone(&hub),
            Arc::clone(&cache),
            sweep_interval(options.idle_timeout()),
        );
        runtime.spawn(sweeper.run(shutdown_rx));

        info!(
            "Client for {} created ({} replica pool(s), pool size {}..={}).",
            endpoint,
            replicas.as_ref().map_or(0, ReplicaPools::len),
            options.min_pool_size,
            options.max_pool_size
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                options,
                master,
                replicas,
                hub,
                cache,
                cache_init: tokio::sync::Mutex::new(()),
                shutdown_tx,
                disposed: AtomicBool::new(false),
                runtime,
            }),
        })
    }

    /// Parses a connection string such as `"127.0.0.1:6379,password=secret,maxpoolsize=10"`.
    pub fn from_connection_string(s: &str) -> Result<Self, ClientError> {
        Self::new(s.parse()?)
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    pub fn master_pool(&self) -> &ConnectionPool {
        &self.inner.master
    }

    pub fn replica_pools(&self) -> Option<&ReplicaPools> {
        self.inner.replicas.as_ref()
    }

    pub fn cache_coordinator(&self) -> Option<&Arc<CacheCoordinator>> {
        self.inner.cache.get()
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.master.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    // --- Command execution ---

    pub fn execute(&self, cmd: &Command) -> Result<RespFrame, ClientError> {
        self.execute_with(cmd, None)
    }

    /// Executes one command, racing the reply against `cancel` and the
    /// command timeout.
    pub fn execute_with(
        &self,
        cmd: &Command,
        cancel: Option<&CancellationToken>,
    ) -> Result<RespFrame, ClientError> {
        let inner = &self.inner;
        let cached = match inner.plan(cmd)? {
            Plan::Hit(value) => return Ok(value),
            Plan::Fetch(cached) => cached,
        };
        let conn = inner.acquire(cmd, cached.is_some(), cancel)?;
        let fill = cached.map(|(coordinator, fingerprint)| Fill {
            ticket: coordinator.begin_fill(fingerprint),
            coordinator,
        });
        let reply = conn.execute(cmd, cancel)?;
        Ok(finish_fill(fill, reply))
    }

    pub async fn execute_async(&self, cmd: &Command) -> Result<RespFrame, ClientError> {
        self.execute_async_with(cmd, None).await
    }

    pub async fn execute_async_with(
        &self,
        cmd: &Command,
        cancel: Option<&CancellationToken>,
    ) -> Result<RespFrame, ClientError> {
        let inner = &self.inner;
        let cached = match inner.plan(cmd)? {
            Plan::Hit(value) => return Ok(value),
            Plan::Fetch(cached) => cached,
        };
        let conn = inner.acquire_async(cmd, cached.is_some(), cancel).await?;
        let fill = cached.map(|(coordinator, fingerprint)| Fill {
            ticket: coordinator.begin_fill(fingerprint),
            coordinator,
        });
        let reply = conn.execute_async(cmd, cancel).await?;
        Ok(finish_fill(fill, reply))
    }

    /// Starts a pipeline. Its commands are written in one send on one master
    /// connection; the cache is bypassed.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline {
            client: self.clone(),
            commands: Vec::new(),
        }
    }

    // --- Client-side caching ---

    /// Attaches a cache. Returns false if one was already attached; the first
    /// cache stays for the lifetime of the client.
    pub async fn use_client_side_caching_async(
        &self,
        cache: Arc<dyn ClientSideCache>,
    ) -> Result<bool, ClientError> {
        let inner = &self.inner;
        inner.ensure_live()?;
        let _init = inner.cache_init.lock().await;
        if inner.cache.get().is_some() {
            debug!("Client-side caching already enabled; ignoring second cache.");
            return Ok(false);
        }
        let coordinator = Arc::new(CacheCoordinator::new(
            cache,
            inner.options.key_prefix(),
            inner.options.database,
            inner.options.command_timeout(),
        ));
        let policy = inner.hub.enable_invalidation(Arc::clone(&coordinator)).await?;
        // Replicas cannot redirect invalidations to a master connection, so
        // cacheable reads are pinned to the master pool.
        inner.master.set_tracking(Some(policy));
        if inner.cache.set(coordinator).is_err() {
            return Ok(false);
        }
        Ok(true)
    }

    pub fn use_client_side_caching(
        &self,
        cache: Arc<dyn ClientSideCache>,
    ) -> Result<bool, ClientError> {
        let client = self.clone();
        self.inner
            .runtime
            .run_blocking(async move { client.use_client_side_caching_async(cache).await })
    }

    // --- Pub/Sub ---

    /// Subscribes to channels of any kind with an explicit payload format.
    pub async fn subscribe_with_async(
        &self,
        kind: SubscriptionKind,
        channels: Vec<Bytes>,
        subscription: Subscription,
    ) -> Result<(), ClientError> {
        self.inner.ensure_live()?;
        self.inner.hub.subscribe(kind, channels, subscription).await
    }

    pub fn subscribe_with(
        &self,
        kind: SubscriptionKind,
        channels: Vec<Bytes>,
        subscription: Subscription,
    ) -> Result<(), ClientError> {
        self.inner.ensure_live()?;
        let hub = Arc::clone(&self.inner.hub);
        self.inner
            .runtime
            .run_blocking(async move { hub.subscribe(kind, channels, subscription).await })
    }

    pub fn subscribe<F>(&self, channels: &[&str], callback: F) -> Result<(), ClientError>
    where
        F: Fn(PubSubMessage) + Send + Sync + 'static,
    {
        self.subscribe_with(
            SubscriptionKind::Channel,
            to_names(channels),
            Subscription::new(Arc::new(callback), PayloadFormat::Text),
        )
    }

    pub fn psubscribe<F>(&self, patterns: &[&str], callback: F) -> Result<(), ClientError>
    where
        F: Fn(PubSubMessage) + Send + Sync + 'static,
    {
        self.subscribe_with(
            SubscriptionKind::Pattern,
            to_names(patterns),
            Subscription::new(Arc::new(callback), PayloadFormat::Text),
        )
    }

    pub fn ssubscribe<F>(&self, channels: &[&str], callback: F) -> Result<(), ClientError>
    where
        F: Fn(PubSubMessage) + Send + Sync + 'static,
    {
        self.subscribe_with(
            SubscriptionKind::Shard,
            to_names(channels),
            Subscription::new(Arc::new(callback), PayloadFormat::Text),
        )
    }

    /// Removes subscriptions of `kind`; an empty list removes all of them.
    pub async fn unsubscribe_with_async(
        &self,
        kind: SubscriptionKind,
        channels: Vec<Bytes>,
    ) -> Result<usize, ClientError> {
        self.inner.ensure_live()?;
        self.inner.hub.unsubscribe(kind, channels).await
    }

    pub fn unsubscribe_with(
        &self,
        kind: SubscriptionKind,
        channels: Vec<Bytes>,
    ) -> Result<usize, ClientError> {
        self.inner.ensure_live()?;
        let hub = Arc::clone(&self.inner.hub);
        self.inner
            .runtime
            .run_blocking(async move { hub.unsubscribe(kind, channels).await })
    }

    pub fn unsubscribe(&self, channels: &[&str]) -> Result<usize, ClientError> {
        self.unsubscribe_with(SubscriptionKind::Channel, to_names(channels))
    }

    pub fn punsubscribe(&self, patterns: &[&str]) -> Result<usize, ClientError> {
        self.unsubscribe_with(SubscriptionKind::Pattern, to_names(patterns))
    }

    pub fn sunsubscribe(&self, channels: &[&str]) -> Result<usize, ClientError> {
        self.unsubscribe_with(SubscriptionKind::Shard, to_names(channels))
    }

    /// Publishes a message and returns the number of receivers.
    pub fn publish(
        &self,
        channel: impl Into<Bytes>,
        message: impl Into<Bytes>,
    ) -> Result<i64, ClientError> {
        let reply = self.execute(&commands::publish(channel, message))?;
        expect_integer(reply)
    }

    pub async fn publish_async(
        &self,
        channel: impl Into<Bytes>,
        message: impl Into<Bytes>,
    ) -> Result<i64, ClientError> {
        let reply = self
            .execute_async(&commands::publish(channel, message))
            .await?;
        expect_integer(reply)
    }

    // --- Convenience commands ---

    pub fn ping(&self) -> Result<(), ClientError> {
        self.execute(&commands::ping()).map(|_| ())
    }

    pub async fn ping_async(&self) -> Result<(), ClientError> {
        self.execute_async(&commands::ping()).await.map(|_| ())
    }

    pub fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>, ClientError> {
        bulk_or_nil(self.execute(&commands::get(key))?)
    }

    pub async fn get_async(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>, ClientError> {
        bulk_or_nil(self.execute_async(&commands::get(key)).await?)
    }

    pub fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<(), ClientError> {
        expect_ok(self.execute(&commands::set(key, value))?)
    }

    pub async fn set_async(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<(), ClientError> {
        expect_ok(self.execute_async(&commands::set(key, value)).await?)
    }

    pub fn del<I, T>(&self, keys: I) -> Result<i64, ClientError>
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        expect_integer(self.execute(&commands::del(keys))?)
    }

    pub async fn del_async<I, T>(&self, keys: I) -> Result<i64, ClientError>
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        expect_integer(self.execute_async(&commands::del(keys)).await?)
    }

    // --- Lifecycle ---

    /// Runs one idle sweep now instead of waiting for the background timer.
    pub async fn run_idle_sweep(&self) -> SweepSummary {
        let inner = &self.inner;
        IdleSweeper::new(
            inner.master.clone(),
            inner.replicas.clone(),
            Arc::clone(&inner.hub),
            Arc::clone(&inner.cache),
            sweep_interval(inner.options.idle_timeout()),
        )
        .sweep_once()
        .await
    }

    /// Stops the sweep, fails every waiter, and closes all connections.
    /// Later calls fail with a disposed error. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl ClientInner {
    fn ensure_live(&self) -> Result<(), ClientError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(ClientError::Disposed("client"))
        } else {
            Ok(())
        }
    }

    /// Decides between a cache hit and a round trip, fingerprinting the
    /// command when its reply may be cached.
    fn plan(&self, cmd: &Command) -> Result<Plan, ClientError> {
        self.ensure_live()?;
        let Some(coordinator) = self.cache.get().filter(|c| c.is_cacheable(cmd)) else {
            return Ok(Plan::Fetch(None));
        };
        let fingerprint = coordinator.fingerprint(cmd)?;
        if let Some(value) = coordinator.lookup(&fingerprint) {
            debug!("Cache hit for '{}'.", cmd);
            return Ok(Plan::Hit(value));
        }
        Ok(Plan::Fetch(Some((Arc::clone(coordinator), fingerprint))))
    }

    fn routes_to_replica(&self, cmd: &Command, cacheable: bool) -> Option<&ReplicaPools> {
        self.replicas
            .as_ref()
            .filter(|r| !r.is_empty() && !cacheable && cmd.has_flag(CommandFlags::READONLY))
    }

    fn acquire(
        &self,
        cmd: &Command,
        cacheable: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<PooledConnection, ClientError> {
        let deadline = Instant::now() + self.options.command_timeout();
        if let Some(replicas) = self.routes_to_replica(cmd, cacheable) {
            match replicas.get_connection_until(deadline, cancel) {
                Err(e) if falls_back_to_master(&e) => {
                    warn!("No replica reachable ({}); reading from master.", e)
                }
                result => return result,
            }
        }
        self.master.get_connection_until(deadline, cancel)
    }

    async fn acquire_async(
        &self,
        cmd: &Command,
        cacheable: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<PooledConnection, ClientError> {
        let deadline = Instant::now() + self.options.command_timeout();
        if let Some(replicas) = self.routes_to_replica(cmd, cacheable) {
            match replicas.get_connection_async_until(deadline, cancel).await {
                Err(e) if falls_back_to_master(&e) => {
                    warn!("No replica reachable ({}); reading from master.", e)
                }
                result => return result,
            }
        }
        self.master.get_connection_async_until(deadline, cancel).await
    }

    fn close(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        self.master.dispose();
        if let Some(replicas) = &self.replicas {
            replicas.dispose();
        }
        self.hub.dispose();
        if let Some(coordinator) = self.cache.get() {
            coordinator.set_online(false);
        }
        info!("Client for {} closed.", self.master.endpoint());
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Only failures to reach any replica send a read to the master; an
/// exhausted replica pool reports its own timeout.
fn falls_back_to_master(err: &ClientError) -> bool {
    !matches!(
        err,
        ClientError::PoolTimeout(_) | ClientError::Cancelled { .. } | ClientError::Disposed(_)
    )
}

/// Stores a successful reply in the cache. Population is best-effort and
/// never changes what the caller receives.
fn finish_fill(fill: Option<Fill>, reply: RespFrame) -> RespFrame {
    if let Some(Fill {
        coordinator,
        ticket,
    }) = fill
        && !coordinator.set(ticket, reply.clone())
    {
        debug!("Reply not cached.");
    }
    reply
}

fn to_names(names: &[&str]) -> Vec<Bytes> {
    names
        .iter()
        .map(|n| Bytes::copy_from_slice(n.as_bytes()))
        .collect()
}

fn bulk_or_nil(reply: RespFrame) -> Result<Option<Bytes>, ClientError> {
    match reply {
        RespFrame::BulkString(b) => Ok(Some(b)),
        RespFrame::SimpleString(s) => Ok(Some(Bytes::from(s))),
        RespFrame::Null => Ok(None),
        other => Err(ClientError::UnexpectedResponse(format!(
            "expected a bulk string, got {}",
            other.to_text_lossy()
        ))),
    }
}

fn expect_ok(reply: RespFrame) -> Result<(), ClientError> {
    if reply.is_ok() {
        Ok(())
    } else {
        Err(ClientError::UnexpectedResponse(format!(
            "expected OK, got {}",
            reply.to_text_lossy()
        )))
    }
}

fn expect_integer(reply: RespFrame) -> Result<i64, ClientError> {
    match reply {
        RespFrame::Integer(n) => Ok(n),
        other => Err(ClientError::UnexpectedResponse(format!(
            "expected an integer, got {}",
            other.to_text_lossy()
        ))),
    }
}

/// Commands queued for one pipelined round trip.
#[derive(Debug)]
pub struct Pipeline {
    client: Client,
    commands: Vec<Command>,
}

impl Pipeline {
    pub fn add(&mut self, cmd: Command) -> &mut Self {
        self.commands.push(cmd);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Sends every queued command and returns the replies in order. Error
    /// replies are returned in place as `RespFrame::Error`.
    pub fn execute(&mut self) -> Result<Vec<RespFrame>, ClientError> {
        let inner = &self.client.inner;
        inner.ensure_live()?;
        if self.commands.is_empty() {
            return Ok(Vec::new());
        }
        let commands = std::mem::take(&mut self.commands);
        let conn = inner.master.get_connection(None)?;
        conn.execute_batch(&commands, None)
    }

    pub async fn execute_async(&mut self) -> Result<Vec<RespFrame>, ClientError> {
        let inner = &self.client.inner;
        inner.ensure_live()?;
        if self.commands.is_empty() {
            return Ok(Vec::new());
        }
        let commands = std::mem::take(&mut self.commands);
        let conn = inner.master.get_connection_async(None).await?;
        conn.execute_batch_async(&commands, None).await
    }
}
