// src/core/cache/memory.rs

//! An unbounded in-process cache. Useful on its own for small working sets and
//! as the reference plug-in for tests.

use super::{CacheKey, CacheMode, ClientSideCache};
use crate::core::protocol::RespFrame;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<CacheKey, RespFrame>,
    mode: CacheMode,
    include: Vec<String>,
    exclude: Vec<String>,
    prefixes: Vec<String>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache used in broadcasting mode for keys under `prefixes`.
    pub fn broadcasting<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode: CacheMode::Broadcasting,
            prefixes: prefixes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_include<S: Into<String>>(mut self, pattern: S) -> Self {
        self.include.push(pattern.into());
        self
    }

    pub fn with_exclude<S: Into<String>>(mut self, pattern: S) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ClientSideCache for MemoryCache {
    fn clear(&self) -> bool {
        self.entries.clear();
        true
    }

    fn set(&self, key: &CacheKey, value: RespFrame) -> bool {
        self.entries.insert(*key, value);
        true
    }

    fn try_get(&self, key: &CacheKey) -> Option<RespFrame> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    fn delete(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    fn mode(&self) -> CacheMode {
        self.mode
    }

    fn include_patterns(&self) -> Vec<String> {
        self.include.clone()
    }

    fn exclude_patterns(&self) -> Vec<String> {
        self.exclude.clone()
    }

    fn prefixes(&self) -> Vec<String> {
        self.prefixes.clone()
    }
}
