//! Sharded, time-indexed store of correlation groups.
//!
//! Each shard owns its groups plus an ordered expiry index keyed by
//! `(deadline, seq)`. Every operation on a key runs under that key's shard
//! lock only, so unrelated keys in other shards never contend.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::group::CorrelationGroup;

const DEFAULT_SHARDS: usize = 16;

/// What to do with the group after an update closure ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAction {
    Keep,
    Remove,
}

/// Result of [`PartialCache::update`].
#[derive(Debug)]
pub struct CacheUpdate<R> {
    pub result: R,
    /// A group for the same key that had outlived its TTL and was taken out
    /// before the update ran. The caller owns its eviction.
    pub expired: Option<CorrelationGroup>,
}

#[derive(Debug, Default)]
struct Shard {
    groups: HashMap<String, CorrelationGroup>,
    expiry: BTreeMap<(Instant, u64), String>,
}

impl Shard {
    fn remove(&mut self, key: &str) -> Option<CorrelationGroup> {
        let group = self.groups.remove(key)?;
        self.expiry.remove(&group.index_key());
        Some(group)
    }
}

#[derive(Debug)]
pub struct PartialCache {
    shards: Vec<Mutex<Shard>>,
    ttl: Duration,
    seq: AtomicU64,
}

impl PartialCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_shards(ttl, DEFAULT_SHARDS)
    }

    pub fn with_shards(ttl: Duration, shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(Shard::default())).collect(),
            ttl,
            seq: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn shard(&self, key: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() % self.shards.len() as u64) as usize]
    }

    /// Runs `f` on the live group for `key`, creating it first if needed,
    /// and removes the group afterwards when `f` asks for it. Get-or-create,
    /// mutate and remove-on-complete happen under one lock.
    pub fn update<R, F>(&self, key: &str, f: F) -> CacheUpdate<R>
    where
        F: FnOnce(&mut CorrelationGroup) -> (R, GroupAction),
    {
        let now = Instant::now();
        let mut guard = self.shard(key).lock();

        let stale = guard.groups.get(key).is_some_and(|g| g.is_expired(now));
        let expired = if stale { guard.remove(key) } else { None };

        let Shard { groups, expiry } = &mut *guard;
        let group = groups.entry(key.to_string()).or_insert_with(|| {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let group = CorrelationGroup::new(key, now, self.ttl, seq);
            expiry.insert(group.index_key(), key.to_string());
            group
        });

        let (result, action) = f(group);
        if action == GroupAction::Remove {
            guard.remove(key);
        }
        CacheUpdate { result, expired }
    }

    /// Removes and returns every group whose deadline is at or before `now`.
    pub fn take_expired(&self, now: Instant) -> Vec<CorrelationGroup> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let mut guard = shard.lock();
            let Shard { groups, expiry } = &mut *guard;
            while let Some(entry) = expiry.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                let key = entry.remove();
                if let Some(group) = groups.remove(&key) {
                    out.push(group);
                }
            }
        }
        out
    }

    pub fn remove(&self, key: &str) -> Option<CorrelationGroup> {
        self.shard(key).lock().remove(key)
    }

    /// Empties the cache, returning every group regardless of age.
    pub fn drain(&self) -> Vec<CorrelationGroup> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let mut guard = shard.lock();
            guard.expiry.clear();
            out.extend(guard.groups.drain().map(|(_, group)| group));
        }
        out
    }

    pub fn contains(&self, key: &str) -> bool {
        self.shard(key).lock().groups.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().groups.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::CanonicalEvent;

    fn push(cache: &PartialCache, key: &str, id: &str) -> Option<CorrelationGroup> {
        cache
            .update(key, |group| {
                group.push(CanonicalEvent::new("t", id));
                ((), GroupAction::Keep)
            })
            .expired
    }

    #[tokio::test(start_paused = true)]
    async fn groups_expire_from_creation() {
        let cache = PartialCache::new(Duration::from_secs(10));
        push(&cache, "k1", "a");
        tokio::time::advance(Duration::from_secs(6)).await;
        push(&cache, "k1", "b");
        push(&cache, "k2", "c");

        tokio::time::advance(Duration::from_secs(5)).await;
        let expired = cache.take_expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key(), "k1");
        assert_eq!(expired[0].len(), 2);
        assert!(cache.contains("k2"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_group_is_handed_back_before_reuse() {
        let cache = PartialCache::new(Duration::from_secs(1));
        push(&cache, "k1", "old");
        tokio::time::advance(Duration::from_secs(2)).await;

        let expired = push(&cache, "k1", "new").expect("stale group returned");
        assert_eq!(expired.fragments()[0].event.id, "old");

        let live = cache.remove("k1").expect("fresh group");
        assert_eq!(live.len(), 1);
        assert_eq!(live.fragments()[0].event.id, "new");
        assert!(cache.take_expired(Instant::now() + Duration::from_secs(5)).is_empty());
    }

    #[tokio::test]
    async fn remove_action_drops_the_group_and_its_index() {
        let cache = PartialCache::new(Duration::from_secs(1));
        let update = cache.update("k1", |group| {
            group.push(CanonicalEvent::new("t", "a"));
            (group.len(), GroupAction::Remove)
        });
        assert_eq!(update.result, 1);
        assert!(cache.is_empty());
        assert!(cache.take_expired(Instant::now() + Duration::from_secs(5)).is_empty());
    }
}
