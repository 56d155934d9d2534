// src/core/pubsub/dispatcher.rs

//! Runs subscription callbacks away from the socket reader.
//!
//! The reader pushes jobs into a bounded FIFO queue; a single consumer task
//! hands each callback to the blocking pool, so callbacks for one client run
//! in arrival order and a slow callback never stalls a socket. Once the queue
//! is full, new messages are dropped and counted.

use crate::core::metrics;
use crate::core::pubsub::registry::{MessageCallback, PubSubMessage};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, warn};

pub const DISPATCH_QUEUE_CAPACITY: usize = 16 * 1024;

struct Job {
    callback: MessageCallback,
    message: PubSubMessage,
}

struct Queue {
    jobs: Mutex<VecDeque<Job>>,
    capacity: usize,
    notify: Arc<Notify>,
}

impl Drop for Queue {
    fn drop(&mut self) {
        // Wakes the consumer so it notices the queue is gone.
        self.notify.notify_one();
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<Queue>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queued", &self.len())
            .field("capacity", &self.queue.capacity)
            .finish()
    }
}

impl Dispatcher {
    /// Starts the consumer task on `handle`. It stops once every clone of the
    /// dispatcher has been dropped.
    pub fn start(handle: &Handle) -> Self {
        Self::with_capacity(handle, DISPATCH_QUEUE_CAPACITY)
    }

    pub fn with_capacity(handle: &Handle, capacity: usize) -> Self {
        let notify = Arc::new(Notify::new());
        let queue = Arc::new(Queue {
            jobs: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Arc::clone(&notify),
        });
        let weak = Arc::downgrade(&queue);
        handle.spawn(async move {
            debug!("Pub/Sub dispatcher started.");
            loop {
                let next = match weak.upgrade() {
                    Some(queue) => queue.jobs.lock().pop_front(),
                    None => break,
                };
                match next {
                    Some(job) => run(job).await,
                    None => notify.notified().await,
                }
            }
            debug!("Pub/Sub dispatcher stopped.");
        });
        Self { queue }
    }

    /// The number of callbacks waiting to run.
    pub fn len(&self) -> usize {
        self.queue.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues a callback invocation. Never blocks the caller; returns false
    /// when the queue is full and the message was dropped.
    pub fn dispatch(&self, callback: MessageCallback, message: PubSubMessage) -> bool {
        metrics::PUBSUB_MESSAGES_TOTAL
            .with_label_values(&[message.kind.to_string()])
            .inc();
        let mut jobs = self.queue.jobs.lock();
        if jobs.len() >= self.queue.capacity {
            drop(jobs);
            metrics::PUBSUB_DROPPED_TOTAL.inc();
            warn!(
                "Pub/Sub callback queue full; dropping message on channel '{}'.",
                String::from_utf8_lossy(&message.channel)
            );
            return false;
        }
        jobs.push_back(Job { callback, message });
        drop(jobs);
        self.queue.notify.notify_one();
        true
    }
}

async fn run(job: Job) {
    let channel = job.message.channel.clone();
    let result = tokio::task::spawn_blocking(move || (job.callback)(job.message)).await;
    if let Err(e) = result
        && e.is_panic()
    {
        warn!(
            "Subscription callback for channel '{}' panicked.",
            String::from_utf8_lossy(&channel)
        );
    }
}
