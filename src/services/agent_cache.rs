use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Builds the cache key for an agent instance: the customer id, suffixed with
/// the project when the conversation is project-scoped.
pub fn agent_key(customer_id: &str, project_id: Option<&str>) -> String {
    match project_id {
        Some(project_id) => format!("{}::proj::{}", customer_id, project_id),
        None => customer_id.to_string(),
    }
}

struct Entry<T: ?Sized> {
    value: Arc<T>,
    last_used: Instant,
}

struct Inner<T: ?Sized> {
    entries: HashMap<String, Entry<T>>,
    /// Keys ordered least- to most-recently used.
    order: Vec<String>,
}

type EvictFn<T> = Box<dyn Fn(String, Arc<T>) + Send + Sync>;

/// Size-bounded LRU of live handles. On overflow the least-recently-used
/// entry is removed and handed to the eviction hook, which runs its
/// best-effort shutdown off the caller's path. A periodic sweep removes
/// entries idle past the configured threshold.
pub struct LruAgentCache<T: ?Sized> {
    inner: Mutex<Inner<T>>,
    max_entries: usize,
    idle_timeout: Duration,
    on_evict: EvictFn<T>,
}

impl<T: ?Sized + Send + Sync + 'static> LruAgentCache<T> {
    pub fn new(
        max_entries: usize,
        idle_timeout: Duration,
        on_evict: impl Fn(String, Arc<T>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
            max_entries: max_entries.max(1),
            idle_timeout,
            on_evict: Box::new(on_evict),
        }
    }

    fn touch(inner: &mut Inner<T>, key: &str) {
        if let Some(pos) = inner.order.iter().position(|k| k == key) {
            let key = inner.order.remove(pos);
            inner.order.push(key);
        }
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.last_used = Instant::now();
        }
    }

    /// Looks a handle up, marking it most-recently used.
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let value = inner.entries.get(key).map(|e| e.value.clone())?;
        Self::touch(&mut inner, key);
        Some(value)
    }

    /// Returns the cached handle or builds one, evicting the LRU entry when
    /// the cache is full. Eviction hooks run after the lock is released.
    pub fn get_or_insert_with(&self, key: &str, build: impl FnOnce() -> Arc<T>) -> Arc<T> {
        let mut evicted: Option<(String, Arc<T>)> = None;
        let value = {
            let mut inner = self.inner.lock().expect("cache lock poisoned");
            if let Some(entry) = inner.entries.get(key) {
                let value = entry.value.clone();
                Self::touch(&mut inner, key);
                value
            } else {
                if inner.entries.len() >= self.max_entries {
                    if !inner.order.is_empty() {
                        let lru = inner.order.remove(0);
                        if let Some(entry) = inner.entries.remove(&lru) {
                            evicted = Some((lru, entry.value));
                        }
                    }
                }
                let value = build();
                inner.entries.insert(
                    key.to_string(),
                    Entry {
                        value: value.clone(),
                        last_used: Instant::now(),
                    },
                );
                inner.order.push(key.to_string());
                value
            }
        };

        if let Some((key, handle)) = evicted {
            tracing::info!(key = %key, "evicting LRU agent instance");
            (self.on_evict)(key, handle);
        }
        value
    }

    /// Removes entries idle longer than the configured threshold, running the
    /// eviction hook for each. Returns how many were removed.
    pub fn sweep_idle(&self) -> usize {
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock().expect("cache lock poisoned");
            let now = Instant::now();
            let stale: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_used) > self.idle_timeout)
                .map(|(k, _)| k.clone())
                .collect();
            for key in stale {
                inner.order.retain(|k| *k != key);
                if let Some(entry) = inner.entries.remove(&key) {
                    evicted.push((key, entry.value));
                }
            }
        }

        let count = evicted.len();
        for (key, handle) in evicted {
            tracing::info!(key = %key, "removing idle agent instance");
            (self.on_evict)(key, handle);
        }
        count
    }

    /// Snapshot of the cached keys, LRU first.
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().expect("cache lock poisoned").order.clone()
    }

    /// Removes one entry without running the eviction hook.
    pub fn remove(&self, key: &str) -> Option<Arc<T>> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.order.retain(|k| k != key);
        inner.entries.remove(key).map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn key_includes_project_scope() {
        assert_eq!(agent_key("c-1", None), "c-1");
        assert_eq!(agent_key("c-1", Some("p-9")), "c-1::proj::p-9");
    }

    #[test]
    fn full_cache_evicts_least_recently_used() {
        let evicted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let log = evicted.clone();
        let cache = LruAgentCache::new(2, Duration::from_secs(3600), move |key, _v: Arc<String>| {
            log.lock().unwrap().push(key);
        });

        cache.get_or_insert_with("a", || Arc::new("a".to_string()));
        cache.get_or_insert_with("b", || Arc::new("b".to_string()));
        // touch "a" so "b" is now least-recently used
        assert!(cache.get("a").is_some());
        cache.get_or_insert_with("c", || Arc::new("c".to_string()));

        assert_eq!(*evicted.lock().unwrap(), vec!["b".to_string()]);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn reinsert_does_not_duplicate() {
        let cache = LruAgentCache::new(3, Duration::from_secs(3600), |_, _: Arc<String>| {});
        let first = cache.get_or_insert_with("a", || Arc::new("one".to_string()));
        let second = cache.get_or_insert_with("a", || Arc::new("two".to_string()));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sweep_removes_only_idle_entries() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let counter = evictions.clone();
        let cache = LruAgentCache::new(10, Duration::from_millis(0), move |_, _: Arc<String>| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cache.get_or_insert_with("a", || Arc::new("a".to_string()));
        cache.get_or_insert_with("b", || Arc::new("b".to_string()));
        std::thread::sleep(Duration::from_millis(5));

        let removed = cache.sweep_idle();
        assert_eq!(removed, 2);
        assert_eq!(evictions.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn eviction_count_is_exact_under_pressure() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let counter = evictions.clone();
        let cache = LruAgentCache::new(5, Duration::from_secs(3600), move |_, _: Arc<u32>| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for i in 0..20u32 {
            cache.get_or_insert_with(&format!("k{}", i), || Arc::new(i));
        }
        assert_eq!(cache.len(), 5);
        assert_eq!(evictions.load(Ordering::SeqCst), 15);
    }
}
