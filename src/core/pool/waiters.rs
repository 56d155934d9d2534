// src/core/pool/waiters.rs

//! FIFO wait queues for callers blocked on a pool.
//!
//! Blocking callers park on a [`SyncWaiter`]; async callers hold the receiving
//! end of a oneshot channel. A returned connection is offered to the oldest
//! waiter first; an offer to a waiter that already gave up is handed back so
//! the next waiter (or the idle stack) receives it instead.

use crate::core::connection::Connection;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

/// What a waiter can be woken with.
#[derive(Debug)]
pub enum Handoff {
    /// A ready connection, removed from the idle stack.
    Connection(Arc<Connection>),
    /// A slot was freed by an eviction; the waiter may create a connection.
    Capacity,
    /// The pool was disposed.
    Disposed,
}

#[derive(Debug)]
enum WaiterState {
    Waiting,
    Ready(Handoff),
    Interrupted,
    Abandoned,
}

/// How a blocking wait ended.
#[derive(Debug)]
pub enum WaitOutcome {
    Handoff(Handoff),
    TimedOut,
    Interrupted,
}

/// A blocking caller waiting for a hand-off.
#[derive(Debug)]
pub struct SyncWaiter {
    state: Mutex<WaiterState>,
    cond: Condvar,
}

impl Default for SyncWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncWaiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WaiterState::Waiting),
            cond: Condvar::new(),
        }
    }

    /// Delivers `handoff` if the waiter is still waiting, otherwise returns it.
    pub fn offer(&self, handoff: Handoff) -> Result<(), Handoff> {
        let mut state = self.state.lock();
        if !matches!(*state, WaiterState::Waiting) {
            return Err(handoff);
        }
        *state = WaiterState::Ready(handoff);
        self.cond.notify_one();
        Ok(())
    }

    /// Wakes the waiter without a hand-off (caller cancellation).
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        if matches!(*state, WaiterState::Waiting) {
            *state = WaiterState::Interrupted;
            self.cond.notify_one();
        }
    }

    pub fn is_waiting(&self) -> bool {
        matches!(*self.state.lock(), WaiterState::Waiting)
    }

    /// Parks until a hand-off arrives, the waiter is interrupted, or `deadline`
    /// passes. A timed-out waiter is marked abandoned under the same lock an
    /// offer takes, so no hand-off can be lost.
    pub fn wait_until(&self, deadline: Instant) -> WaitOutcome {
        let mut state = self.state.lock();
        loop {
            match std::mem::replace(&mut *state, WaiterState::Abandoned) {
                WaiterState::Ready(handoff) => return WaitOutcome::Handoff(handoff),
                WaiterState::Interrupted => return WaitOutcome::Interrupted,
                WaiterState::Abandoned => return WaitOutcome::TimedOut,
                WaiterState::Waiting => *state = WaiterState::Waiting,
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return match std::mem::replace(&mut *state, WaiterState::Abandoned) {
                    WaiterState::Ready(handoff) => WaitOutcome::Handoff(handoff),
                    WaiterState::Interrupted => WaitOutcome::Interrupted,
                    _ => WaitOutcome::TimedOut,
                };
            }
        }
    }
}

/// Both waiter queues. Always locked before the idle stack.
#[derive(Debug, Default)]
pub struct Waiters {
    pub sync: VecDeque<Arc<SyncWaiter>>,
    pub async_: VecDeque<oneshot::Sender<Handoff>>,
}

impl Waiters {
    /// Offers `handoff` to the oldest live waiter, sync waiters first.
    /// Returns the hand-off if nobody took it.
    pub fn offer(&mut self, mut handoff: Handoff) -> Option<Handoff> {
        while let Some(waiter) = self.sync.pop_front() {
            match waiter.offer(handoff) {
                Ok(()) => return None,
                Err(returned) => handoff = returned,
            }
        }
        while let Some(tx) = self.async_.pop_front() {
            match tx.send(handoff) {
                Ok(()) => return None,
                Err(returned) => handoff = returned,
            }
        }
        Some(handoff)
    }

    /// Drops waiters that have already given up.
    pub fn prune(&mut self) {
        self.sync.retain(|w| w.is_waiting());
        self.async_.retain(|tx| !tx.is_closed());
    }

    pub fn drain(&mut self) -> (Vec<Arc<SyncWaiter>>, Vec<oneshot::Sender<Handoff>>) {
        (self.sync.drain(..).collect(), self.async_.drain(..).collect())
    }
}
