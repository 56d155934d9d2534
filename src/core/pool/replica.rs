// src/core/pool/replica.rs

//! Independent pools for read replicas. Each acquisition tries the replicas
//! in random order; a replica that fails to produce a connection is skipped
//! in favor of the next candidate.

use super::{ConnectionPool, PoolRole, PooledConnection, SweepReport};
use crate::config::{ConnectionOptions, Endpoint};
use crate::core::ClientError;
use crate::core::runtime::IoRuntime;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const REPLICA_TIMEOUT: &str = "get slave connection timeout";

#[derive(Debug, Clone)]
pub struct ReplicaPools {
    pools: Vec<ConnectionPool>,
}

impl ReplicaPools {
    /// One sub-pool per endpoint, each sized by `options`.
    pub fn new(endpoints: Vec<Endpoint>, options: &ConnectionOptions, runtime: Arc<IoRuntime>) -> Self {
        let pools = endpoints
            .into_iter()
            .map(|endpoint| {
                let mut replica_options = options.clone();
                replica_options.host = endpoint.host.clone();
                replica_options.port = endpoint.port;
                ConnectionPool::new(PoolRole::Replica, endpoint, replica_options, Arc::clone(&runtime))
            })
            .collect();
        Self { pools }
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn pools(&self) -> &[ConnectionPool] {
        &self.pools
    }

    fn shuffled(&self) -> Vec<&ConnectionPool> {
        let mut order: Vec<&ConnectionPool> = self.pools.iter().collect();
        order.shuffle(&mut rand::thread_rng());
        order
    }

    /// Acquires a replica connection before `deadline`.
    ///
    /// Every replica is first asked for an idle connection or a free slot in
    /// random order. If all are at their limit the caller queues on one of
    /// them for the time left. Connection errors skip the replica; if every
    /// replica failed to connect, the last error is returned.
    pub fn get_connection_until(
        &self,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> Result<PooledConnection, ClientError> {
        let mut exhausted = None;
        let mut last_err = None;
        for pool in self.shuffled() {
            match pool.try_get_connection() {
                Ok(Some(conn)) => return Ok(conn),
                Ok(None) => {
                    exhausted.get_or_insert(pool);
                }
                Err(e @ ClientError::Disposed(_)) => return Err(e),
                Err(e) => {
                    debug!("Replica {} unavailable: {}", pool.endpoint(), e);
                    last_err = Some(e);
                }
            }
        }
        match exhausted {
            Some(pool) => pool.get_connection_until(deadline, cancel),
            None => Err(last_err.unwrap_or(ClientError::PoolTimeout(REPLICA_TIMEOUT))),
        }
    }

    pub async fn get_connection_async_until(
        &self,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> Result<PooledConnection, ClientError> {
        let mut exhausted = None;
        let mut last_err = None;
        for pool in self.shuffled() {
            match pool.try_get_connection_async().await {
                Ok(Some(conn)) => return Ok(conn),
                Ok(None) => {
                    exhausted.get_or_insert(pool);
                }
                Err(e @ ClientError::Disposed(_)) => return Err(e),
                Err(e) => {
                    debug!("Replica {} unavailable: {}", pool.endpoint(), e);
                    last_err = Some(e);
                }
            }
        }
        match exhausted {
            Some(pool) => pool.get_connection_async_until(deadline, cancel).await,
            None => Err(last_err.unwrap_or(ClientError::PoolTimeout(REPLICA_TIMEOUT))),
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        let mut total = SweepReport::default();
        for pool in &self.pools {
            let report = pool.sweep().await;
            total.healthy += report.healthy;
            total.evicted += report.evicted;
            total.discarded += report.discarded;
            total.created += report.created;
        }
        total
    }

    pub fn dispose(&self) {
        for pool in &self.pools {
            pool.dispose();
        }
    }
}
