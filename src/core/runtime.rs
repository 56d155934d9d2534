// src/core/runtime.rs

//! Holds the tokio runtime that drives socket I/O for a client.
//!
//! When a client is created inside a tokio runtime it reuses that runtime's
//! handle. Otherwise it owns a small multi-threaded runtime so the blocking API
//! works from plain threads. The blocking API must not be called from a
//! current-thread runtime's own thread, since the I/O tasks would never run.

use crate::core::ClientError;
use std::future::Future;
use std::sync::mpsc;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;

const OWNED_WORKER_THREADS: usize = 2;

#[derive(Debug)]
pub struct IoRuntime {
    handle: Handle,
    owned: Option<Runtime>,
}

impl IoRuntime {
    /// Uses the ambient runtime if there is one, otherwise starts a dedicated one.
    pub fn new() -> Result<Self, ClientError> {
        match Handle::try_current() {
            Ok(handle) => Ok(Self {
                handle,
                owned: None,
            }),
            Err(_) => {
                let runtime = Builder::new_multi_thread()
                    .worker_threads(OWNED_WORKER_THREADS)
                    .thread_name("spineldb-client-io")
                    .enable_all()
                    .build()?;
                debug!("Started dedicated client I/O runtime.");
                Ok(Self {
                    handle: runtime.handle().clone(),
                    owned: Some(runtime),
                })
            }
        }
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            owned: None,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Runs `future` on the I/O runtime and blocks the calling thread until it
    /// completes. This is the bridge used by the synchronous API.
    pub fn run_blocking<F, T>(&self, future: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        self.handle.spawn(async move {
            let _ = tx.send(future.await);
        });
        rx.recv().map_err(|_| ClientError::ConnectionClosed)?
    }
}

impl Drop for IoRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.owned.take() {
            runtime.shutdown_background();
        }
    }
}
