//! Two-level result cache.
//!
//! Lookups consult a bounded in-process store (L1) first, then a shared
//! tier (L2) behind the [`SharedCache`] trait. Shared-tier hits are promoted
//! into L1; shared-tier failures are logged and treated as misses so a cache
//! outage never fails a request.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::types::QualityTier;

/// Errors from the shared cache tier.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend could not be reached or rejected the operation.
    #[error("Cache backend unavailable: {0}")]
    Backend(String),

    /// A stored value could not be encoded or decoded.
    #[error("Cache serialization failed: {0}")]
    Serialization(String),
}

/// One entry in the shared tier.
#[derive(Debug, Clone)]
pub struct SharedEntry {
    /// Cached value.
    pub value: String,
    /// Absolute expiry time.
    pub expires_at: SystemTime,
}

/// Shared (L2) cache tier.
///
/// Implementations may be process-local or backed by an external store; the
/// layer above treats every error as a miss.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Looks up an entry. Expired entries are reported as `None`.
    async fn get(&self, key: &str) -> Result<Option<SharedEntry>, CacheError>;

    /// Stores a value with the given time-to-live.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Removes an entry.
    ///
    /// # Returns
    /// Returns `true` if an entry was present.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Removes every entry whose key starts with the prefix.
    ///
    /// # Returns
    /// Returns the number of entries removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError>;
}

/// In-memory shared tier used when no external store is configured.
#[derive(Default)]
pub struct MemorySharedCache {
    entries: Arc<RwLock<HashMap<String, SharedEntry>>>,
}

impl MemorySharedCache {
    /// Creates an empty in-memory shared tier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for MemorySharedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySharedCache")
            .field("entry_count", &self.entries.try_read().map(|e| e.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SharedCache for MemorySharedCache {
    async fn get(&self, key: &str) -> Result<Option<SharedEntry>, CacheError> {
        let now = SystemTime::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: drop it now rather than waiting for the next write.
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if entry.expires_at <= now {
                entries.remove(key);
            }
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), SharedEntry { value, expires_at: SystemTime::now() + ttl });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut entries = self.entries.write().await;
        Ok(entries.remove(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.len())
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Lookups served from either tier.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Local entries displaced to make room.
    pub evictions: u64,
}

struct LocalEntry {
    value: String,
    expires_at: SystemTime,
    last_used: u64,
}

struct LocalState {
    entries: HashMap<String, LocalEntry>,
    /// Monotonic access counter used for least-recently-used ordering.
    tick: u64,
}

/// Two-level cache: bounded local store in front of a shared tier.
pub struct CacheLayer {
    local: Mutex<LocalState>,
    shared: Arc<dyn SharedCache>,
    capacity: usize,
    default_ttl: Duration,
    stats: Mutex<CacheStats>,
}

impl fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLayer")
            .field("capacity", &self.capacity)
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl CacheLayer {
    /// Creates a cache layer over the given shared tier.
    ///
    /// # Arguments
    /// * `capacity` - Maximum entries held locally
    /// * `default_ttl` - Time-to-live applied when `set` is given none
    /// * `shared` - The shared (L2) tier
    #[must_use]
    pub fn new(capacity: usize, default_ttl: Duration, shared: Arc<dyn SharedCache>) -> Self {
        Self {
            local: Mutex::new(LocalState { entries: HashMap::new(), tick: 0 }),
            shared,
            capacity,
            default_ttl,
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Creates a cache layer backed by an in-memory shared tier.
    #[must_use]
    pub fn in_memory(capacity: usize, default_ttl: Duration) -> Self {
        Self::new(capacity, default_ttl, Arc::new(MemorySharedCache::new()))
    }

    /// Builds the cache key for an agent invocation.
    ///
    /// The agent name and quality tier stay in plaintext so one agent's
    /// entries can be invalidated by prefix; the prompt is digested.
    #[must_use]
    pub fn invocation_key(agent_name: &str, quality: QualityTier, prompt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prompt.as_bytes());
        format!("{}:{}:{}", agent_name, quality, hex::encode(hasher.finalize()))
    }

    /// Prefix covering every cached entry for an agent.
    #[must_use]
    pub fn agent_prefix(agent_name: &str) -> String {
        format!("{agent_name}:")
    }

    /// Looks up a value, consulting the local tier first.
    ///
    /// # Returns
    /// Returns the cached value, or `None` on a miss in both tiers.
    pub async fn get(&self, key: &str) -> Option<String> {
        let now = SystemTime::now();
        {
            let mut local = self.local.lock().await;
            local.tick += 1;
            let tick = local.tick;
            match local.entries.get_mut(key) {
                Some(entry) if entry.expires_at > now => {
                    entry.last_used = tick;
                    let value = entry.value.clone();
                    drop(local);
                    self.record_hit().await;
                    return Some(value);
                }
                Some(_) => {
                    local.entries.remove(key);
                }
                None => {}
            }
        }

        match self.shared.get(key).await {
            Ok(Some(entry)) if entry.expires_at > now => {
                debug!(key = %key, "Promoting shared cache entry to local tier");
                self.insert_local(key.to_string(), entry.value.clone(), entry.expires_at).await;
                self.record_hit().await;
                Some(entry.value)
            }
            Ok(_) => {
                self.record_miss().await;
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Shared cache lookup failed, treating as miss");
                self.record_miss().await;
                None
            }
        }
    }

    /// Stores a value in both tiers.
    ///
    /// # Arguments
    /// * `key` - Cache key
    /// * `value` - Value to store
    /// * `ttl` - Time-to-live, or `None` for the default
    pub async fn set(&self, key: String, value: String, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at = SystemTime::now() + ttl;
        self.insert_local(key.clone(), value.clone(), expires_at).await;
        if let Err(e) = self.shared.set(&key, value, ttl).await {
            warn!(key = %key, error = %e, "Shared cache write failed");
        }
    }

    /// Looks up a value, running the factory on a miss.
    ///
    /// The factory's result is cached only when it produces a value; `None`
    /// results pass through uncached, and factory errors propagate to the
    /// caller. Concurrent misses for the same key may each run the factory.
    ///
    /// # Errors
    /// Returns the factory's error unchanged.
    pub async fn get_or_set<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        factory: F,
    ) -> Result<Option<String>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<String>, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(Some(value));
        }

        let produced = factory().await?;
        if let Some(value) = &produced {
            self.set(key.to_string(), value.clone(), ttl).await;
        }
        Ok(produced)
    }

    /// Removes an entry from both tiers.
    ///
    /// # Returns
    /// Returns `true` if either tier held the entry.
    pub async fn delete(&self, key: &str) -> bool {
        let removed_local = {
            let mut local = self.local.lock().await;
            local.entries.remove(key).is_some()
        };
        let removed_shared = match self.shared.delete(key).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(key = %key, error = %e, "Shared cache delete failed");
                false
            }
        };
        removed_local || removed_shared
    }

    /// Removes every entry whose key starts with the prefix, in both tiers.
    ///
    /// # Returns
    /// Returns the total entries removed across both tiers.
    pub async fn delete_prefix(&self, prefix: &str) -> usize {
        let removed_local = {
            let mut local = self.local.lock().await;
            let before = local.entries.len();
            local.entries.retain(|key, _| !key.starts_with(prefix));
            before - local.entries.len()
        };
        let removed_shared = match self.shared.delete_prefix(prefix).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(prefix = %prefix, error = %e, "Shared cache prefix delete failed");
                0
            }
        };
        debug!(prefix = %prefix, local = removed_local, shared = removed_shared, "Cache prefix invalidated");
        removed_local + removed_shared
    }

    /// Gets the current cache counters.
    pub async fn stats(&self) -> CacheStats {
        *self.stats.lock().await
    }

    async fn insert_local(&self, key: String, value: String, expires_at: SystemTime) {
        let mut evicted = false;
        {
            let mut local = self.local.lock().await;
            local.tick += 1;
            let tick = local.tick;

            if !local.entries.contains_key(&key) && local.entries.len() >= self.capacity {
                let now = SystemTime::now();
                local.entries.retain(|_, entry| entry.expires_at > now);
                if local.entries.len() >= self.capacity {
                    let victim = local
                        .entries
                        .iter()
                        .min_by_key(|(_, entry)| entry.last_used)
                        .map(|(k, _)| k.clone());
                    if let Some(victim) = victim {
                        local.entries.remove(&victim);
                        evicted = true;
                    }
                }
            }

            local.entries.insert(key, LocalEntry { value, expires_at, last_used: tick });
        }

        if evicted {
            let mut stats = self.stats.lock().await;
            stats.evictions += 1;
        }
    }

    async fn record_hit(&self) {
        let mut stats = self.stats.lock().await;
        stats.hits += 1;
    }

    async fn record_miss(&self) {
        let mut stats = self.stats.lock().await;
        stats.misses += 1;
    }
}
