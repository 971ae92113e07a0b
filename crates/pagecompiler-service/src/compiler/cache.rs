use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// An artifact saved in the [`ResultCache`].
struct CachedItem<A> {
    /// The compiled artifact, shared read-only with callers.
    artifact: Arc<A>,
    /// The memory footprint of the artifact in bytes.
    cost: u64,
    /// Logical time of the last insertion or lookup.
    stamp: u64,
}

/// A cost-bounded in-memory cache evicting least recently used artifacts.
///
/// Every entry has a cost in bytes, and the sum of all costs is kept below the configured
/// limit after every insertion. An artifact that is more expensive than the whole limit is
/// still accepted, but it will be the first one evicted once anything else is inserted.
///
/// Recency is tracked with a logical clock. Entries inserted together as a group share the
/// same stamp, in which case eviction proceeds in ascending key order.
pub struct ResultCache<K, A> {
    entries: HashMap<K, CachedItem<A>>,
    /// Eviction order: ascending `(stamp, key)`.
    recency: BTreeSet<(u64, K)>,
    clock: u64,
    total_cost: u64,
    limit: u64,
}

impl<K, A> fmt::Debug for ResultCache<K, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("entries", &self.entries.len())
            .field("total_cost", &self.total_cost)
            .field("limit", &self.limit)
            .finish()
    }
}

impl<K, A> ResultCache<K, A>
where
    K: Ord + Hash + Clone + fmt::Debug,
{
    pub fn new(limit: u64) -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeSet::new(),
            clock: 0,
            total_cost: 0,
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_cost(&self) -> u64 {
        self.total_cost
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns the artifact for `key` without marking it as recently used.
    pub fn peek(&self, key: &K) -> Option<&Arc<A>> {
        self.entries.get(key).map(|item| &item.artifact)
    }

    /// Returns the artifact for `key` and marks it as the most recently used entry.
    pub fn lookup(&mut self, key: &K) -> Option<Arc<A>> {
        let stamp = self.tick();
        let item = self.entries.get_mut(key)?;

        self.recency.remove(&(item.stamp, key.clone()));
        item.stamp = stamp;
        self.recency.insert((stamp, key.clone()));

        Some(Arc::clone(&item.artifact))
    }

    /// Inserts or replaces the artifact for `key`.
    ///
    /// Returns the keys that were evicted to make room for it.
    pub fn insert(&mut self, key: K, artifact: Arc<A>, cost: u64) -> Vec<K> {
        self.insert_group(vec![(key, artifact, cost)])
    }

    /// Inserts a group of artifacts that were produced together.
    ///
    /// All entries share one recency stamp. The first entry of the group is never evicted by
    /// this insertion, even if it does not fit within the limit on its own.
    pub fn insert_group(&mut self, group: Vec<(K, Arc<A>, u64)>) -> Vec<K> {
        let Some(pinned) = group.first().map(|(key, _, _)| key.clone()) else {
            return Vec::new();
        };

        let stamp = self.tick();
        for (key, artifact, cost) in group {
            self.remove(&key);
            self.recency.insert((stamp, key.clone()));
            self.total_cost += cost;
            self.entries.insert(
                key,
                CachedItem {
                    artifact,
                    cost,
                    stamp,
                },
            );
        }

        self.evict(Some(&pinned))
    }

    /// Changes the cost limit, evicting entries right away if the cache no longer fits.
    pub fn set_limit(&mut self, limit: u64) -> Vec<K> {
        self.limit = limit;
        self.evict(None)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
        self.total_cost = 0;
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &K) -> Option<CachedItem<A>> {
        let item = self.entries.remove(key)?;
        self.recency.remove(&(item.stamp, key.clone()));
        self.total_cost -= item.cost;
        Some(item)
    }

    /// Evicts entries until the total cost fits the limit again.
    ///
    /// Entries that exceed the limit on their own go first, then the least recently used ones.
    /// `pinned` is never evicted.
    fn evict(&mut self, pinned: Option<&K>) -> Vec<K> {
        let mut evicted = Vec::new();
        if self.total_cost <= self.limit {
            return evicted;
        }

        // Evicting never changes the limit, so the oversized entries are found in one pass.
        let oversized: Vec<K> = self
            .recency
            .iter()
            .map(|(_, key)| key)
            .filter(|key| Some(*key) != pinned && self.entries[*key].cost > self.limit)
            .cloned()
            .collect();
        let mut oversized = oversized.into_iter();

        while self.total_cost > self.limit {
            let victim = match oversized.next() {
                Some(key) => key,
                None => {
                    // at most the pinned entry is skipped here
                    let lru = self
                        .recency
                        .iter()
                        .map(|(_, key)| key)
                        .find(|key| Some(*key) != pinned);
                    match lru {
                        Some(key) => key.clone(),
                        None => break,
                    }
                }
            };
            self.remove(&victim);
            evicted.push(victim);
        }

        if !evicted.is_empty() {
            tracing::debug!(
                evicted = ?evicted,
                total_cost = self.total_cost,
                limit = self.limit,
                "evicted compiled pages"
            );
        }
        evicted
    }
}
