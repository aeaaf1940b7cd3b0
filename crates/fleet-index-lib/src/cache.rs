//! Entity cache - TTL key-value store abstraction with change notifications
//!
//! The [`EntityCache`] trait is the contract every entity store fulfils: batch reads and
//! writes, per-write TTLs, and a subscription mechanism delivering batched
//! [`CacheEvent`]s. Listeners only see this generic event type, never a store-specific one.
//!
//! [`InMemoryCache`] is a `DashMap`-backed implementation. Expired entries are evicted
//! lazily when touched and in bulk by [`InMemoryCache::purge_expired`]. Reporting those
//! evictions as `Expired` events can be switched off to mimic stores that expire keys
//! passively without telling anyone.

use crate::Result;
use crate::utils::deadline_after;

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Handle returned by [`EntityCache::subscribe`]
pub type SubscriptionId = u64;

/// A change to one cache entry
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent<T> {
    Created { key: String, value: T },
    Updated { key: String, value: T, previous: T },
    /// Explicit removal, carrying the removed value
    Removed { key: String, value: T },
    /// TTL eviction, carrying the evicted value
    Expired { key: String, value: T },
}

impl<T> CacheEvent<T> {
    #[inline]
    pub fn key(&self) -> &str {
        match self {
            CacheEvent::Created { key, .. }
            | CacheEvent::Updated { key, .. }
            | CacheEvent::Removed { key, .. }
            | CacheEvent::Expired { key, .. } => key,
        }
    }

    /// The new value for writes, the evicted value for removals
    #[inline]
    pub fn value(&self) -> &T {
        match self {
            CacheEvent::Created { value, .. }
            | CacheEvent::Updated { value, .. }
            | CacheEvent::Removed { value, .. }
            | CacheEvent::Expired { value, .. } => value,
        }
    }

    #[inline]
    pub fn is_removal(&self) -> bool {
        matches!(self, CacheEvent::Removed { .. } | CacheEvent::Expired { .. })
    }
}

/// Receiver of batched cache events.
///
/// May be called concurrently from different writers; no ordering is guaranteed across
/// batches, not even for the same key.
pub trait CacheListener<T>: Send + Sync {
    fn on_events(&self, events: &[CacheEvent<T>]);
}

/// TTL key-value store for one entity type
pub trait EntityCache<T>: Send + Sync {
    /// Read one entry
    fn get(&self, key: &str) -> Result<Option<T>>;

    /// Read many entries; missing keys are absent from the returned map
    fn get_all(&self, keys: &[String]) -> Result<HashMap<String, T>>;

    /// Read every live entry
    fn values(&self) -> Result<Vec<T>>;

    /// Insert or replace entries, each living for `ttl`
    fn put_all(&self, entries: Vec<(String, T)>, ttl: Duration) -> Result<()>;

    /// Remove entries; unknown keys are ignored
    fn remove_all(&self, keys: &[String]) -> Result<()>;

    fn has_key(&self, key: &str) -> Result<bool>;

    /// Number of live entries
    fn count(&self) -> Result<usize>;

    /// Register a listener for change events
    fn subscribe(&self, listener: Arc<dyn CacheListener<T>>) -> SubscriptionId;

    /// Drop a listener. Returns false if the subscription was unknown.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    fn put(&self, key: String, value: T, ttl: Duration) -> Result<()> {
        self.put_all(vec![(key, value)], ttl)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.remove_all(&[key.to_string()])
    }

    /// Evict expired entries now. Stores that expire entries on their own return 0.
    fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Entry<T> {
    #[inline]
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

type ListenerList<T> = Vec<(SubscriptionId, Arc<dyn CacheListener<T>>)>;

/// In-process [`EntityCache`] implementation
pub struct InMemoryCache<T> {
    name: String,
    entries: DashMap<String, Entry<T>>,
    listeners: RwLock<ListenerList<T>>,
    next_subscription: AtomicU64,
    emit_expiry_events: bool,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<T: Clone + Send + Sync + 'static> InMemoryCache<T> {
    /// Create an empty cache; the name only shows up in logs
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            emit_expiry_events: true,
        }
    }

    /// Whether TTL evictions are reported as `Expired` events
    pub fn with_expiry_events(mut self, emit: bool) -> Self {
        self.emit_expiry_events = emit;
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evict every expired entry. Returns the number of evicted entries.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        // Collect first: removing while iterating would deadlock on the shard lock
        let expired_keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect();

        let mut events = Vec::with_capacity(expired_keys.len());
        for key in expired_keys {
            if let Some((key, entry)) = self.entries.remove_if(&key, |_, e| e.is_expired(now)) {
                events.push(CacheEvent::Expired {
                    key,
                    value: entry.value,
                });
            }
        }

        let evicted = events.len();
        if evicted > 0 {
            tracing::debug!("Evicted {} expired entries from {} cache", evicted, self.name);
            self.notify_expired(events);
        }
        evicted
    }

    /// Look up a live value, evicting it if its TTL has passed
    fn lookup(&self, key: &str, now: Instant, expired: &mut Vec<CacheEvent<T>>) -> Option<T> {
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }
        if let Some((key, entry)) = self.entries.remove_if(key, |_, e| e.is_expired(now)) {
            expired.push(CacheEvent::Expired {
                key,
                value: entry.value,
            });
        }
        None
    }

    fn notify_expired(&self, events: Vec<CacheEvent<T>>) {
        if self.emit_expiry_events {
            self.notify(&events);
        }
    }

    fn notify(&self, events: &[CacheEvent<T>]) {
        if events.is_empty() {
            return;
        }
        // Snapshot the listener list so callbacks run without holding the lock
        let listeners: Vec<Arc<dyn CacheListener<T>>> = match self.listeners.read() {
            Ok(guard) => guard.iter().map(|(_, l)| l.clone()).collect(),
            Err(poisoned) => {
                tracing::warn!("Listener list of {} cache poisoned; recovering", self.name);
                poisoned.into_inner().iter().map(|(_, l)| l.clone()).collect()
            }
        };
        for listener in listeners {
            listener.on_events(events);
        }
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<T: Clone + Send + Sync + 'static> EntityCache<T> for InMemoryCache<T> {
    fn get(&self, key: &str) -> Result<Option<T>> {
        let mut expired = Vec::new();
        let value = self.lookup(key, Instant::now(), &mut expired);
        self.notify_expired(expired);
        Ok(value)
    }

    fn get_all(&self, keys: &[String]) -> Result<HashMap<String, T>> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.lookup(key, now, &mut expired) {
                found.insert(key.clone(), value);
            }
        }
        self.notify_expired(expired);
        Ok(found)
    }

    fn values(&self) -> Result<Vec<T>> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .map(|e| e.value().value.clone())
            .collect())
    }

    fn put_all(&self, entries: Vec<(String, T)>, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let expires_at = deadline_after(now, ttl);
        let mut events = Vec::with_capacity(entries.len());
        let mut expired = Vec::new();

        for (key, value) in entries {
            let previous = self.entries.insert(
                key.clone(),
                Entry {
                    value: value.clone(),
                    expires_at,
                },
            );
            match previous {
                Some(previous) if !previous.is_expired(now) => events.push(CacheEvent::Updated {
                    key,
                    value,
                    previous: previous.value,
                }),
                Some(previous) => {
                    expired.push(CacheEvent::Expired {
                        key: key.clone(),
                        value: previous.value,
                    });
                    events.push(CacheEvent::Created { key, value });
                }
                None => events.push(CacheEvent::Created { key, value }),
            }
        }

        self.notify_expired(expired);
        self.notify(&events);
        Ok(())
    }

    fn remove_all(&self, keys: &[String]) -> Result<()> {
        let now = Instant::now();
        let mut events = Vec::with_capacity(keys.len());
        let mut expired = Vec::new();

        for key in keys {
            if let Some((key, entry)) = self.entries.remove(key) {
                if entry.is_expired(now) {
                    expired.push(CacheEvent::Expired {
                        key,
                        value: entry.value,
                    });
                } else {
                    events.push(CacheEvent::Removed {
                        key,
                        value: entry.value,
                    });
                }
            }
        }

        self.notify_expired(expired);
        self.notify(&events);
        Ok(())
    }

    fn has_key(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn count(&self) -> Result<usize> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .count())
    }

    fn subscribe(&self, listener: Arc<dyn CacheListener<T>>) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        match self.listeners.write() {
            Ok(mut guard) => guard.push((id, listener)),
            Err(poisoned) => poisoned.into_inner().push((id, listener)),
        }
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = guard.len();
        guard.retain(|(sub, _)| *sub != id);
        guard.len() != before
    }

    fn purge_expired(&self) -> Result<usize> {
        Ok(InMemoryCache::purge_expired(self))
    }
}
