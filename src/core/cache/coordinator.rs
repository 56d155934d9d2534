// src/core/cache/coordinator.rs

//! Keeps the dependency index between cached replies and the server keys they
//! were read from, and applies server invalidations to it.
//!
//! Every fill is taken against a [`FillTicket`] issued before the command is
//! sent. Invalidations bump a global epoch and stamp each invalidated key with
//! it; a fill whose ticket is older than a stamp on any of its keys (or older
//! than the last clear) is dropped instead of stored.

use super::{CacheKey, CacheMode, ClientSideCache, Fingerprint};
use crate::core::ClientError;
use crate::core::metrics;
use crate::core::protocol::{Command, CommandFlags, RespFrame};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wildmatch::WildMatch;

/// Proof that a fill started at a given epoch.
#[derive(Debug)]
pub struct FillTicket {
    fingerprint: Fingerprint,
    epoch: u64,
    issued: Instant,
}

impl FillTicket {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

pub struct CacheCoordinator {
    cache: Arc<dyn ClientSideCache>,
    mode: CacheMode,
    include: Vec<WildMatch>,
    exclude: Vec<WildMatch>,
    prefixes: Vec<Bytes>,
    key_prefix: Option<Bytes>,
    database: u8,
    /// cache key -> wire keys it depends on
    entries: DashMap<CacheKey, Vec<Bytes>>,
    /// wire key -> cache keys that depend on it
    dependents: DashMap<Bytes, HashSet<CacheKey>>,
    /// wire key -> (epoch, time) of its last invalidation
    stamps: DashMap<Bytes, (u64, Instant)>,
    epoch: AtomicU64,
    cleared_epoch: AtomicU64,
    /// Serializes index mutation so an invalidation cannot interleave with a fill.
    index_lock: Mutex<()>,
    online: AtomicBool,
    stamp_ttl: Duration,
}

impl std::fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("mode", &self.mode)
            .field("entries", &self.entries.len())
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}

impl CacheCoordinator {
    /// Builds a coordinator around a plug-in. Stamps are kept for
    /// `2 * command_timeout + 1s`, which outlives any fill still in flight.
    pub fn new(
        cache: Arc<dyn ClientSideCache>,
        key_prefix: Option<Bytes>,
        database: u8,
        command_timeout: Duration,
    ) -> Self {
        let mode = cache.mode();
        let include = cache
            .include_patterns()
            .iter()
            .map(|p| WildMatch::new(p))
            .collect();
        let exclude = cache
            .exclude_patterns()
            .iter()
            .map(|p| WildMatch::new(p))
            .collect();
        let prefixes = cache.prefixes().into_iter().map(Bytes::from).collect();
        Self {
            cache,
            mode,
            include,
            exclude,
            prefixes,
            key_prefix,
            database,
            entries: DashMap::new(),
            dependents: DashMap::new(),
            stamps: DashMap::new(),
            epoch: AtomicU64::new(0),
            cleared_epoch: AtomicU64::new(0),
            index_lock: Mutex::new(()),
            online: AtomicBool::new(false),
            stamp_ttl: command_timeout * 2 + Duration::from_secs(1),
        }
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    /// The prefixes to register with `BCAST`, as the server sees them.
    pub fn tracking_prefixes(&self) -> Vec<Bytes> {
        if self.mode != CacheMode::Broadcasting {
            return Vec::new();
        }
        self.prefixes
            .iter()
            .map(|p| self.wire_key(p))
            .collect()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Toggles whether the invalidation link is live. Going offline drops
    /// everything, since invalidations may have been missed.
    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::AcqRel);
        if was && !online {
            debug!("Invalidation link lost; clearing client-side cache.");
            self.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn wire_key(&self, key: &[u8]) -> Bytes {
        match &self.key_prefix {
            Some(prefix) => {
                let mut out = Vec::with_capacity(prefix.len() + key.len());
                out.extend_from_slice(prefix);
                out.extend_from_slice(key);
                Bytes::from(out)
            }
            None => Bytes::copy_from_slice(key),
        }
    }

    fn key_allowed(&self, key: &[u8]) -> bool {
        match self.mode {
            CacheMode::Broadcasting => self.prefixes.iter().any(|p| key.starts_with(p)),
            CacheMode::Default => {
                let text = String::from_utf8_lossy(key);
                let included =
                    self.include.is_empty() || self.include.iter().any(|m| m.matches(&text));
                included && !self.exclude.iter().any(|m| m.matches(&text))
            }
        }
    }

    /// True for read-only commands with at least one key, every key passing
    /// the plug-in's filters, while the invalidation link is live.
    pub fn is_cacheable(&self, cmd: &Command) -> bool {
        self.is_online()
            && cmd.has_flag(CommandFlags::READONLY)
            && cmd.has_keys()
            && cmd.keys_iter().all(|k| self.key_allowed(k))
    }

    pub fn fingerprint(&self, cmd: &Command) -> Result<Fingerprint, ClientError> {
        let key = CacheKey::for_command(self.database, self.key_prefix.as_deref(), cmd)?;
        let redis_keys = cmd.prefixed_keys(self.key_prefix.as_deref());
        Ok(Fingerprint { key, redis_keys })
    }

    /// Returns a cached reply if the index and the plug-in both hold it.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<RespFrame> {
        if !self.is_online() || !self.entries.contains_key(&fingerprint.key) {
            metrics::CACHE_MISSES_TOTAL.inc();
            return None;
        }
        match self.cache.try_get(&fingerprint.key) {
            Some(value) => {
                metrics::CACHE_HITS_TOTAL.inc();
                Some(value)
            }
            None => {
                // The plug-in evicted it on its own.
                let _guard = self.index_lock.lock();
                self.unlink(&fingerprint.key);
                metrics::CACHE_MISSES_TOTAL.inc();
                None
            }
        }
    }

    /// Takes a ticket before the command is sent to the server.
    pub fn begin_fill(&self, fingerprint: Fingerprint) -> FillTicket {
        FillTicket {
            fingerprint,
            epoch: self.epoch.load(Ordering::Acquire),
            issued: Instant::now(),
        }
    }

    /// Stores a reply. Returns false when the fill was discarded: a duplicate,
    /// stale relative to an invalidation, or refused by the plug-in.
    pub fn set(&self, ticket: FillTicket, value: RespFrame) -> bool {
        let FillTicket {
            fingerprint,
            epoch,
            issued,
        } = ticket;
        let _guard = self.index_lock.lock();

        if !self.is_online()
            || self.cleared_epoch.load(Ordering::Acquire) > epoch
            || issued.elapsed() > self.stamp_ttl
        {
            return false;
        }
        let stale = fingerprint.redis_keys.iter().any(|k| {
            self.stamps
                .get(k)
                .is_some_and(|stamp| stamp.value().0 > epoch)
        });
        if stale {
            debug!("Discarding stale fill for cache key {}.", fingerprint.key);
            return false;
        }
        if self.entries.contains_key(&fingerprint.key) {
            return false;
        }

        self.entries
            .insert(fingerprint.key, fingerprint.redis_keys.clone());
        for k in &fingerprint.redis_keys {
            self.dependents
                .entry(k.clone())
                .or_default()
                .insert(fingerprint.key);
        }
        if self.cache.set(&fingerprint.key, value) {
            true
        } else {
            warn!(
                "Cache plug-in refused entry {}; rolling back index.",
                fingerprint.key
            );
            self.unlink(&fingerprint.key);
            false
        }
    }

    /// Removes a cache key from both indices. Caller holds `index_lock`.
    fn unlink(&self, key: &CacheKey) {
        if let Some((_, redis_keys)) = self.entries.remove(key) {
            for k in redis_keys {
                let now_empty = match self.dependents.get_mut(&k) {
                    Some(mut set) => {
                        set.remove(key);
                        set.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.dependents.remove_if(&k, |_, set| set.is_empty());
                }
            }
        }
    }

    /// Invalidates one server key (wire form). Returns how many entries went.
    pub fn delete(&self, redis_key: &[u8]) -> usize {
        let _guard = self.index_lock.lock();
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.stamps
            .insert(Bytes::copy_from_slice(redis_key), (epoch, Instant::now()));

        let Some((_, dependents)) = self.dependents.remove(redis_key) else {
            return 0;
        };
        let mut removed = 0;
        for cache_key in dependents {
            self.cache.delete(&cache_key);
            self.unlink(&cache_key);
            removed += 1;
        }
        metrics::CACHE_INVALIDATIONS_TOTAL.inc_by(removed as f64);
        removed
    }

    /// Drops every entry and every stamp; pending fills become stale.
    pub fn clear(&self) {
        let _guard = self.index_lock.lock();
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.cleared_epoch.store(epoch, Ordering::Release);
        let count = self.entries.len();
        self.entries.clear();
        self.dependents.clear();
        self.stamps.clear();
        if !self.cache.clear() {
            warn!("Cache plug-in failed to clear.");
        }
        metrics::CACHE_INVALIDATIONS_TOTAL.inc_by(count as f64);
    }

    /// Applies an invalidation payload: null clears everything, otherwise a
    /// single key or an array of keys.
    pub fn invalidate(&self, payload: &RespFrame) {
        match payload {
            RespFrame::Null | RespFrame::NullArray => self.clear(),
            RespFrame::Array(keys) | RespFrame::Push(keys) => {
                for key in keys {
                    if let Some(bytes) = key.as_bytes() {
                        self.delete(bytes);
                    }
                }
            }
            other => match other.as_bytes() {
                Some(bytes) => {
                    self.delete(bytes);
                }
                None => warn!("Ignoring malformed invalidation payload: {:?}", other),
            },
        }
    }

    /// Forgets stamps that no outstanding fill can still be checked against.
    pub fn prune_stamps(&self) -> usize {
        let before = self.stamps.len();
        let ttl = self.stamp_ttl;
        self.stamps.retain(|_, (_, at)| at.elapsed() <= ttl);
        before - self.stamps.len()
    }
}
