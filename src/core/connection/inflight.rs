// src/core/connection/inflight.rs

//! The single in-flight slot of a connection.
//!
//! A connection carries at most one outstanding command or pipeline batch.
//! The slot is a tagged state guarded by a mutex; every transition checks the
//! sequence number it was started with, so a late cancellation, a late reply,
//! or a timed-out waiter can never complete someone else's request.

use crate::core::protocol::RespFrame;
use crate::core::ClientError;
use parking_lot::{Condvar, Mutex};
use std::time::Instant;
use tokio::sync::Notify;

#[derive(Debug)]
enum Slot {
    Idle,
    Pending {
        seq: u64,
        expected: usize,
        replies: Vec<RespFrame>,
    },
    Done {
        seq: u64,
        result: Result<Vec<RespFrame>, ClientError>,
    },
}

/// What happened to a frame handed to [`InFlight::push_reply`].
#[derive(Debug, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The frame was stored; more replies are expected.
    Stored,
    /// The frame completed the pending request.
    Completed,
    /// Nothing was waiting for this frame.
    Unsolicited,
}

#[derive(Debug)]
pub struct InFlight {
    slot: Mutex<Slot>,
    next_seq: Mutex<u64>,
    cond: Condvar,
    notify: Notify,
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlight {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Idle),
            next_seq: Mutex::new(0),
            cond: Condvar::new(),
            notify: Notify::new(),
        }
    }

    /// Starts a request that expects `expected` replies and returns its
    /// sequence number. A request expecting nothing completes immediately.
    pub fn begin(&self, expected: usize) -> u64 {
        let seq = {
            let mut next = self.next_seq.lock();
            *next += 1;
            *next
        };
        let mut slot = self.slot.lock();
        *slot = if expected == 0 {
            Slot::Done {
                seq,
                result: Ok(Vec::new()),
            }
        } else {
            Slot::Pending {
                seq,
                expected,
                replies: Vec::with_capacity(expected),
            }
        };
        seq
    }

    /// Returns true if a request is waiting for replies.
    pub fn is_pending(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Pending { .. })
    }

    /// Appends a decoded reply to the pending request.
    pub fn push_reply(&self, frame: RespFrame) -> ReplyOutcome {
        let mut slot = self.slot.lock();
        let Slot::Pending {
            seq,
            expected,
            replies,
        } = &mut *slot
        else {
            return ReplyOutcome::Unsolicited;
        };

        replies.push(frame);
        if replies.len() < *expected {
            return ReplyOutcome::Stored;
        }

        let seq = *seq;
        let replies = std::mem::take(replies);
        *slot = Slot::Done {
            seq,
            result: Ok(replies),
        };
        drop(slot);
        self.wake();
        ReplyOutcome::Completed
    }

    /// Completes request `seq` with `result` if it is still pending.
    /// Returns false if the request already finished or was abandoned.
    pub fn complete(&self, seq: u64, result: Result<Vec<RespFrame>, ClientError>) -> bool {
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Pending { seq: current, .. } if *current == seq => {
                *slot = Slot::Done { seq, result };
                drop(slot);
                self.wake();
                true
            }
            _ => false,
        }
    }

    /// Fails whatever request is pending. Used when the socket dies.
    pub fn fail(&self, err: ClientError) {
        let mut slot = self.slot.lock();
        if let Slot::Pending { seq, .. } = &*slot {
            let seq = *seq;
            *slot = Slot::Done {
                seq,
                result: Err(err),
            };
            drop(slot);
            self.wake();
        }
    }

    /// Takes the result of request `seq` if it has finished.
    pub fn take(&self, seq: u64) -> Option<Result<Vec<RespFrame>, ClientError>> {
        let mut slot = self.slot.lock();
        Self::take_locked(&mut slot, seq)
    }

    /// Gives up on request `seq`. If the result raced in, it is returned.
    pub fn abandon(&self, seq: u64) -> Option<Result<Vec<RespFrame>, ClientError>> {
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Pending { seq: current, .. } if *current == seq => {
                *slot = Slot::Idle;
                None
            }
            _ => Self::take_locked(&mut slot, seq),
        }
    }

    /// Blocks the calling thread until request `seq` finishes or `deadline` passes.
    pub fn wait_blocking(
        &self,
        seq: u64,
        deadline: Instant,
    ) -> Option<Result<Vec<RespFrame>, ClientError>> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = Self::take_locked(&mut slot, seq) {
                return Some(result);
            }
            if !matches!(&*slot, Slot::Pending { seq: current, .. } if *current == seq) {
                // Abandoned by another path; nothing will ever arrive.
                return None;
            }
            if self.cond.wait_until(&mut slot, deadline).timed_out() {
                return Self::take_locked(&mut slot, seq);
            }
        }
    }

    /// The notifier woken on every completion; async waiters select on it.
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    fn take_locked(
        slot: &mut Slot,
        seq: u64,
    ) -> Option<Result<Vec<RespFrame>, ClientError>> {
        match slot {
            Slot::Done { seq: current, .. } if *current == seq => {
                match std::mem::replace(slot, Slot::Idle) {
                    Slot::Done { result, .. } => Some(result),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn wake(&self) {
        self.cond.notify_all();
        self.notify.notify_one();
    }
}
