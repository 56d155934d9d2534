// src/core/cache/mod.rs

//! Server-assisted client-side caching.
//!
//! The storage itself is a user-supplied [`ClientSideCache`] plug-in. The
//! [`CacheCoordinator`] decides what may be cached, remembers which server
//! keys each entry depends on, and removes entries when the server reports
//! that one of those keys changed.

pub mod coordinator;
pub mod memory;
pub mod tracking;

use crate::core::ClientError;
use crate::core::protocol::{Command, RespFrame};
use bytes::Bytes;
use std::fmt;
use std::io::Cursor;

pub use coordinator::{CacheCoordinator, FillTicket};
pub use memory::MemoryCache;
pub use tracking::TrackingPolicy;

/// How the server decides which invalidations to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// The server remembers the keys this client read.
    #[default]
    Default,
    /// The server reports every change to keys under the registered prefixes.
    Broadcasting,
}

/// The contract a cache implementation offers to the coordinator.
///
/// The coordinator never assumes an eviction policy; it only promises to ask
/// for deletion when the server invalidates a key.
pub trait ClientSideCache: Send + Sync {
    fn clear(&self) -> bool;

    /// Stores a value. Returning false makes the coordinator forget the entry.
    fn set(&self, key: &CacheKey, value: RespFrame) -> bool;

    fn try_get(&self, key: &CacheKey) -> Option<RespFrame>;

    fn delete(&self, key: &CacheKey) -> bool;

    fn mode(&self) -> CacheMode {
        CacheMode::Default
    }

    /// Glob patterns a key must match to be cached (default mode). Empty means all keys.
    fn include_patterns(&self) -> Vec<String> {
        Vec::new()
    }

    /// Glob patterns that exclude a key from caching (default mode).
    fn exclude_patterns(&self) -> Vec<String> {
        Vec::new()
    }

    /// Key prefixes to subscribe to in broadcasting mode.
    fn prefixes(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A 128-bit content hash of a command as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(u128);

impl CacheKey {
    pub fn from_raw(value: u128) -> Self {
        Self(value)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    /// Hashes the database index and every argument (keys with the prefix
    /// applied), each length-delimited so argument boundaries matter.
    pub fn for_command(
        database: u8,
        prefix: Option<&[u8]>,
        cmd: &Command,
    ) -> Result<Self, ClientError> {
        let mut material = Vec::with_capacity(64);
        material.push(database);
        for arg in cmd.arguments() {
            let key_prefix = if arg.is_key { prefix.unwrap_or_default() } else { &[] };
            let len = (key_prefix.len() + arg.value.len()) as u64;
            material.extend_from_slice(&len.to_le_bytes());
            material.extend_from_slice(key_prefix);
            material.extend_from_slice(&arg.value);
        }
        murmur3::murmur3_x64_128(&mut Cursor::new(material), 0)
            .map(CacheKey)
            .map_err(|e| ClientError::Cache(format!("fingerprint failed: {e}")))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// A cache key together with the server keys (as sent on the wire) it depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub key: CacheKey,
    pub redis_keys: Vec<Bytes>,
}
