// Key/value store with a per-entry TTL and an eviction listener.
//
// Backs the pending-publish table (5 s window) and the learned-denial cache
// (20 s window). Every entry owns its own timer task, so expiries are
// independent; `put` must therefore run inside a tokio runtime.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

pub type EvictionListener<K, V> = Arc<dyn Fn(&K, V) + Send + Sync>;

/// Concurrent map whose entries expire individually.
///
/// The eviction listener fires exactly once per expired entry, never while
/// the map lock is held. `remove` wins races against expiry: a removed entry
/// never reaches the listener. Re-`put` of a live key replaces the value and
/// restarts the countdown; the superseded timer is a no-op.
pub struct TimedMap<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for TimedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    listener: Option<EvictionListener<K, V>>,
    generation: AtomicU64,
}

struct Entry<V> {
    value: V,
    generation: u64,
    expires_at: Instant,
}

impl<K, V> TimedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_listener(listener: EvictionListener<K, V>) -> Self {
        Self::build(Some(listener))
    }

    fn build(listener: Option<EvictionListener<K, V>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                listener,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Inserts or replaces `key` and (re)starts its countdown.
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let expires_at = Instant::now() + ttl;
        {
            let mut entries = self.inner.entries.lock();
            entries.insert(
                key.clone(),
                Entry {
                    value,
                    generation,
                    expires_at,
                },
            );
        }
        // Weak so outstanding timers do not keep a dropped map alive.
        let weak: Weak<Inner<K, V>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            if let Some(inner) = weak.upgrade() {
                inner.evict(&key, generation);
            }
        });
    }

    /// Non-blocking read. An expired-but-unswept entry counts as absent and
    /// is evicted on the spot (its timer then finds nothing).
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let expired = {
            let mut entries = self.inner.entries.lock();
            match entries.get(key) {
                Some(entry) if Instant::now() >= entry.expires_at => entries.remove(key),
                Some(entry) => return Some(entry.value.clone()),
                None => return None,
            }
        };
        if let Some(entry) = expired {
            self.inner.notify(key, entry.value);
        }
        None
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let expired = {
            let mut entries = self.inner.entries.lock();
            match entries.get(key) {
                Some(entry) if Instant::now() >= entry.expires_at => entries.remove(key),
                Some(_) => return true,
                None => return false,
            }
        };
        if let Some(entry) = expired {
            self.inner.notify(key, entry.value);
        }
        false
    }

    /// Removes `key` and suppresses its eviction callback.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner
            .entries
            .lock()
            .remove(key)
            .map(|entry| entry.value)
    }

    /// Atomically drains every live entry matching `predicate`, suppressing
    /// their eviction callbacks. Expired-but-unswept entries are left for
    /// their timers.
    pub fn remove_where(&self, predicate: impl Fn(&K) -> bool) -> Vec<(K, V)> {
        let now = Instant::now();
        let mut entries = self.inner.entries.lock();
        let matched: Vec<K> = entries
            .iter()
            .filter(|(key, entry)| now < entry.expires_at && predicate(key))
            .map(|(key, _)| key.clone())
            .collect();
        matched
            .into_iter()
            .filter_map(|key| entries.remove(&key).map(|entry| (key, entry.value)))
            .collect()
    }

    /// Entry count, including entries awaiting their eviction sweep.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }
}

impl<K, V> Default for TimedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash,
{
    fn evict(&self, key: &K, generation: u64) {
        let removed = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(entry) if entry.generation == generation => entries.remove(key),
                _ => None,
            }
        };
        if let Some(entry) = removed {
            self.notify(key, entry.value);
        }
    }

    fn notify(&self, key: &K, value: V) {
        if let Some(listener) = &self.listener {
            // A panicking listener must not take down other entries' timers.
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| listener(key, value)));
            if outcome.is_err() {
                tracing::warn!("timed map eviction listener panicked");
            }
        }
    }
}
