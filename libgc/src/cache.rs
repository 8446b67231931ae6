use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::Mutex;

use crate::models::Uid;

/// Uids the store has confirmed do not exist.
///
/// Uids are never reused, so an entry can only go stale by being evicted.
pub struct AbsentOwnerCache {
    cache: Mutex<LruCache<Uid, ()>>,
}

impl AbsentOwnerCache {
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        AbsentOwnerCache {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn add(&self, uid: Uid) {
        self.cache.lock().await.put(uid, ());
    }

    /// Counts as a use for eviction order.
    pub async fn has(&self, uid: &Uid) -> bool {
        self.cache.lock().await.get(uid).is_some()
    }

    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_evicts_least_recently_used() {
        let cache = AbsentOwnerCache::new(2);
        cache.add(Uid::from("a")).await;
        cache.add(Uid::from("b")).await;
        assert!(cache.has(&Uid::from("a")).await);

        cache.add(Uid::from("c")).await;
        assert!(cache.has(&Uid::from("a")).await);
        assert!(!cache.has(&Uid::from("b")).await);
        assert!(cache.has(&Uid::from("c")).await);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_zero_capacity() {
        let cache = AbsentOwnerCache::new(0);
        assert!(cache.is_empty().await);
        cache.add(Uid::from("a")).await;
        assert!(cache.has(&Uid::from("a")).await);
    }
}
