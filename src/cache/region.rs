use super::{Cache, CachedEntity};
use crate::core::EntityId;
use lru::LruCache;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Named LRU regions of one kind. A region exists from its first put until it
/// is evicted.
struct RegionMap<K, V> {
    capacity: NonZeroUsize,
    regions: Mutex<HashMap<String, LruCache<K, V>>>,
}

impl<K: Hash + Eq, V: Clone> RegionMap<K, V> {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            regions: Mutex::new(HashMap::new()),
        }
    }

    fn with_regions<T>(&self, f: impl FnOnce(&mut HashMap<String, LruCache<K, V>>) -> T) -> T {
        let mut regions = self.regions.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut regions)
    }

    fn get(&self, region: &str, key: &K) -> Option<V> {
        self.with_regions(|regions| regions.get_mut(region)?.get(key).cloned())
    }

    fn peek(&self, region: &str, key: &K) -> Option<V> {
        self.with_regions(|regions| regions.get(region)?.peek(key).cloned())
    }

    fn contains(&self, region: &str, key: &K) -> bool {
        self.with_regions(|regions| {
            regions
                .get(region)
                .is_some_and(|entries| entries.contains(key))
        })
    }

    fn put(&self, region: &str, key: K, value: V) {
        let capacity = self.capacity;
        self.with_regions(|regions| {
            regions
                .entry(region.to_string())
                .or_insert_with(|| LruCache::new(capacity))
                .put(key, value);
        });
    }

    fn remove(&self, region: &str, key: &K) {
        self.with_regions(|regions| {
            if let Some(entries) = regions.get_mut(region) {
                entries.pop(key);
            }
        });
    }

    fn has_region(&self, region: &str) -> bool {
        self.with_regions(|regions| regions.get(region).is_some_and(|entries| !entries.is_empty()))
    }

    fn evict_region(&self, region: &str) {
        self.with_regions(|regions| {
            regions.remove(region);
        });
    }

    fn clear(&self) {
        self.with_regions(|regions| regions.clear());
    }

    fn len(&self) -> usize {
        self.with_regions(|regions| regions.values().map(|entries| entries.len()).sum())
    }
}

/// Snapshot of [`RegionCache`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub entity_entries: usize,
    pub query_entries: usize,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cache Stats: {} hits, {} misses, {} puts, {} entities, {} query results",
            self.hits, self.misses, self.puts, self.entity_entries, self.query_entries
        )
    }
}

/// Default in-memory [`Cache`]: every region is an LRU bounded to the
/// configured capacity.
pub struct RegionCache {
    entities: RegionMap<EntityId, CachedEntity>,
    natural_ids: RegionMap<String, EntityId>,
    collections: RegionMap<EntityId, Vec<EntityId>>,
    queries: RegionMap<String, Vec<EntityId>>,
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
}

impl RegionCache {
    pub fn new(region_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(region_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entities: RegionMap::new(capacity),
            natural_ids: RegionMap::new(capacity),
            collections: RegionMap::new(capacity),
            queries: RegionMap::new(capacity),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            puts: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            entity_entries: self.entities.len(),
            query_entries: self.queries.len(),
        }
    }

    fn record<T>(&self, found: Option<T>) -> Option<T> {
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }
}

impl Default for RegionCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Cache for RegionCache {
    fn contains_entity(&self, entity_name: &str, id: &EntityId) -> bool {
        self.entities.contains(entity_name, id)
    }

    fn evict_entity(&self, entity_name: &str, id: &EntityId) {
        self.entities.remove(entity_name, id);
    }

    fn evict_entity_region(&self, entity_name: &str) {
        self.entities.evict_region(entity_name);
    }

    fn evict_all_entity_regions(&self) {
        self.entities.clear();
    }

    fn evict_natural_id_region(&self, entity_name: &str) {
        self.natural_ids.evict_region(entity_name);
    }

    fn evict_all_natural_id_regions(&self) {
        self.natural_ids.clear();
    }

    fn contains_collection(&self, role: &str, owner_id: &EntityId) -> bool {
        self.collections.contains(role, owner_id)
    }

    fn evict_collection(&self, role: &str, owner_id: &EntityId) {
        self.collections.remove(role, owner_id);
    }

    fn evict_collection_region(&self, role: &str) {
        self.collections.evict_region(role);
    }

    fn evict_all_collection_regions(&self) {
        self.collections.clear();
    }

    fn contains_query_region(&self, region: &str) -> bool {
        self.queries.has_region(region)
    }

    fn evict_query_region(&self, region: &str) {
        self.queries.evict_region(region);
    }

    fn evict_all_query_regions(&self) {
        self.queries.clear();
    }

    fn get_entity(&self, entity_name: &str, id: &EntityId) -> Option<CachedEntity> {
        self.record(self.entities.get(entity_name, id))
    }

    fn put_entity(
        &self,
        entity_name: &str,
        id: &EntityId,
        entry: CachedEntity,
        minimal_put: bool,
    ) -> bool {
        if minimal_put
            && self
                .entities
                .peek(entity_name, id)
                .is_some_and(|cached| cached.version == entry.version)
        {
            return false;
        }
        self.entities.put(entity_name, id.clone(), entry);
        self.puts.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn resolve_natural_id(&self, entity_name: &str, natural_id: &str) -> Option<EntityId> {
        self.record(self.natural_ids.get(entity_name, &natural_id.to_string()))
    }

    fn put_natural_id(&self, entity_name: &str, natural_id: &str, id: &EntityId) {
        self.natural_ids.put(entity_name, natural_id.to_string(), id.clone());
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    fn put_collection(&self, role: &str, owner_id: &EntityId, elements: Vec<EntityId>) {
        self.collections.put(role, owner_id.clone(), elements);
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    fn get_query(&self, region: &str, query_key: &str) -> Option<Vec<EntityId>> {
        self.record(self.queries.get(region, &query_key.to_string()))
    }

    fn put_query(&self, region: &str, query_key: &str, ids: Vec<EntityId>) {
        self.queries.put(region, query_key.to_string(), ids);
        self.puts.fetch_add(1, Ordering::Relaxed);
    }
}
