// src/resources/cache.rs — Local, priority, and distributed cache tiers
//
// Values are stored as `serde_json::Value` so one cache can hold any
// serializable type; typed access goes through serde at the accessor.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::infra::config::CacheConfig;
use crate::infra::errors::{Result, WharfError};
use crate::session::Session;

struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
    group: Option<String>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Bounded in-process cache. When full, the oldest-inserted key goes first.
pub struct LocalCache {
    max_entries: usize,
    entries: Mutex<IndexMap<String, CacheEntry>>,
}

impl LocalCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: Mutex::new(IndexMap::new()),
        }
    }

    pub fn put_value(
        &self,
        key: &str,
        value: Value,
        lifetime: Option<Duration>,
        group: Option<String>,
    ) {
        let mut entries = self.entries.lock();
        // Re-inserting moves the key to the back.
        entries.shift_remove(key);
        while entries.len() >= self.max_entries {
            entries.shift_remove_index(0);
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: lifetime.map(|l| Instant::now() + l),
                group,
            },
        );
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock();
        let expired = entries.get(key)?.is_expired(Instant::now());
        if expired {
            entries.shift_remove(key);
            return None;
        }
        entries.get(key).map(|e| e.value.clone())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get_value(key).is_some()
    }

    pub fn invalidate_key(&self, key: &str) -> bool {
        self.entries.lock().shift_remove(key).is_some()
    }

    /// Remove every key stored in `group`. Returns how many were removed.
    pub fn invalidate_group(&self, group: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.group.as_deref() != Some(group));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Live entries, after dropping any that have expired.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| !e.is_expired(now));
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Cache shared by every server in a cluster.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn put(&self, key: &str, value: Value, lifetime: Option<Duration>) -> Result<()>;
    async fn invalidate(&self, key: &str) -> Result<bool>;
    async fn clear(&self) -> Result<()>;
}

/// In-process stand-in for a cluster cache.
pub struct MemoryDistributedCache {
    inner: LocalCache,
}

impl MemoryDistributedCache {
    pub fn new() -> Self {
        Self {
            inner: LocalCache::new(usize::MAX),
        }
    }
}

impl Default for MemoryDistributedCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedCache for MemoryDistributedCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.inner.get_value(key))
    }

    async fn put(&self, key: &str, value: Value, lifetime: Option<Duration>) -> Result<()> {
        self.inner.put_value(key, value, lifetime, None);
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<bool> {
        Ok(self.inner.invalidate_key(key))
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear();
        Ok(())
    }
}

/// The three tiers, created once per process.
pub struct CacheSet {
    local: LocalCache,
    local_prio: LocalCache,
    global: Option<Arc<dyn DistributedCache>>,
}

impl CacheSet {
    pub fn new(config: &CacheConfig, global: Option<Arc<dyn DistributedCache>>) -> Self {
        Self {
            local: LocalCache::new(config.local_max_entries),
            local_prio: LocalCache::new(config.local_prio_max_entries),
            global,
        }
    }

    pub fn has_global(&self) -> bool {
        self.global.is_some()
    }
}

/// What to do when a key is missing: load it, and how long to keep it.
pub struct CacheMissHandler<F> {
    loader: F,
    lifetime: Option<Duration>,
    group: Option<String>,
}

impl<F> CacheMissHandler<F> {
    pub fn new(loader: F) -> Self {
        Self {
            loader,
            lifetime: None,
            group: None,
        }
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Session-scoped view of the cache tiers.
pub struct Caches<'s> {
    session: &'s Session,
    set: &'s CacheSet,
}

impl<'s> Caches<'s> {
    pub(crate) fn new(session: &'s Session, set: &'s CacheSet) -> Self {
        Self { session, set }
    }

    pub fn local(&self) -> LocalTier<'s> {
        LocalTier {
            session: self.session,
            cache: &self.set.local,
        }
    }

    /// Same semantics as `local`, kept apart so bulk entries cannot evict
    /// these.
    pub fn local_prio(&self) -> LocalTier<'s> {
        LocalTier {
            session: self.session,
            cache: &self.set.local_prio,
        }
    }

    pub fn global(&self) -> GlobalTier<'s> {
        GlobalTier {
            session: self.session,
            backend: self.set.global.as_ref(),
        }
    }
}

pub struct LocalTier<'s> {
    session: &'s Session,
    cache: &'s LocalCache,
}

impl LocalTier<'_> {
    pub fn put<T: Serialize>(&self, key: &str, value: &T, lifetime: Option<Duration>) -> Result<()> {
        self.session.ensure_open()?;
        self.cache
            .put_value(key, serde_json::to_value(value)?, lifetime, None);
        Ok(())
    }

    pub fn put_in_group<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        lifetime: Option<Duration>,
        group: &str,
    ) -> Result<()> {
        self.session.ensure_open()?;
        self.cache.put_value(
            key,
            serde_json::to_value(value)?,
            lifetime,
            Some(group.to_string()),
        );
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.session.ensure_open()?;
        self.cache
            .get_value(key)
            .map(serde_json::from_value)
            .transpose()
            .map_err(WharfError::from)
    }

    /// Return the cached value, or run the miss handler's loader. A loaded
    /// `Some` is stored; `None` is returned without storing anything.
    pub async fn get_or_load<T, F, Fut>(&self, key: &str, miss: CacheMissHandler<F>) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        if let Some(hit) = self.get(key)? {
            return Ok(Some(hit));
        }
        let loaded = (miss.loader)().await?;
        if let Some(value) = &loaded {
            self.session.ensure_open()?;
            self.cache
                .put_value(key, serde_json::to_value(value)?, miss.lifetime, miss.group);
        }
        Ok(loaded)
    }

    pub fn contains_key(&self, key: &str) -> Result<bool> {
        self.session.ensure_open()?;
        Ok(self.cache.contains_key(key))
    }

    pub fn invalidate_key(&self, key: &str) -> Result<bool> {
        self.session.ensure_open()?;
        Ok(self.cache.invalidate_key(key))
    }

    pub fn invalidate_group(&self, group: &str) -> Result<usize> {
        self.session.ensure_open()?;
        Ok(self.cache.invalidate_group(group))
    }

    pub fn clear(&self) -> Result<()> {
        self.session.ensure_open()?;
        self.cache.clear();
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        self.session.ensure_open()?;
        Ok(self.cache.len())
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.session.ensure_open()?;
        Ok(self.cache.keys())
    }
}

pub struct GlobalTier<'s> {
    session: &'s Session,
    backend: Option<&'s Arc<dyn DistributedCache>>,
}

impl GlobalTier<'_> {
    fn backend(&self) -> Result<&Arc<dyn DistributedCache>> {
        self.session.ensure_open()?;
        self.backend
            .ok_or_else(|| WharfError::config("global cache requires a distributed cache backend"))
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T, lifetime: Option<Duration>) -> Result<()> {
        let backend = self.backend()?;
        backend.put(key, serde_json::to_value(value)?, lifetime).await
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let backend = self.backend()?;
        match backend.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn get_or_load<T, F, Fut>(&self, key: &str, miss: CacheMissHandler<F>) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        if let Some(hit) = self.get(key).await? {
            return Ok(Some(hit));
        }
        let loaded = (miss.loader)().await?;
        if let Some(value) = &loaded {
            self.put(key, value, miss.lifetime).await?;
        }
        Ok(loaded)
    }

    pub async fn invalidate_key(&self, key: &str) -> Result<bool> {
        self.backend()?.invalidate(key).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.backend()?.clear().await
    }
}
