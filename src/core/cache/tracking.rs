// src/core/cache/tracking.rs

//! The tracking settings every pooled connection must carry while client-side
//! caching is enabled.

use crate::core::cache::CacheMode;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};

/// Describes how pooled connections enable `CLIENT TRACKING`. The redirect
/// target changes whenever the invalidation connection is replaced.
#[derive(Debug)]
pub struct TrackingPolicy {
    redirect_id: AtomicU64,
    mode: CacheMode,
    prefixes: Vec<Bytes>,
}

impl TrackingPolicy {
    pub fn new(redirect_id: u64, mode: CacheMode, prefixes: Vec<Bytes>) -> Self {
        Self {
            redirect_id: AtomicU64::new(redirect_id),
            mode,
            prefixes,
        }
    }

    pub fn redirect_id(&self) -> u64 {
        self.redirect_id.load(Ordering::Acquire)
    }

    pub fn set_redirect_id(&self, id: u64) {
        self.redirect_id.store(id, Ordering::Release);
    }

    pub fn is_broadcast(&self) -> bool {
        self.mode == CacheMode::Broadcasting
    }

    /// Key prefixes sent with `BCAST`; ignored in default mode.
    pub fn prefixes(&self) -> &[Bytes] {
        if self.is_broadcast() {
            &self.prefixes
        } else {
            &[]
        }
    }
}
