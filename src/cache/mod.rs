//! Second-level cache shared by every session of a factory.
//!
//! [`Cache`] is both the administrative region controller handed out by
//! `SessionFactory::cache()` and the data path sessions read and populate,
//! gated by their `CacheMode`. Regions are named by entity name (entity and
//! natural-id regions), by collection role (`"<Owner>.<property>"`) or by
//! query region name. Evicting an unknown region or key is a no-op.

mod region;

pub use region::{CacheStats, RegionCache};

use crate::core::{Entity, EntityId};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

/// Region used by cacheable queries that do not name one.
pub const DEFAULT_QUERY_REGION: &str = "default-query-results-region";

/// Builds a collection role from its owner type and property.
pub fn collection_role(owner: &str, property: &str) -> String {
    format!("{}.{}", owner, property)
}

/// Entity snapshot held in an entity region.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntity {
    pub state: JsonValue,
    pub version: i64,
    pub cached_at: DateTime<Utc>,
}

impl CachedEntity {
    pub fn new(state: JsonValue, version: i64) -> Self {
        Self {
            state,
            version,
            cached_at: Utc::now(),
        }
    }
}

pub trait Cache: Send + Sync {
    fn contains_entity(&self, entity_name: &str, id: &EntityId) -> bool;

    fn evict_entity(&self, entity_name: &str, id: &EntityId);

    fn evict_entity_region(&self, entity_name: &str);

    fn evict_all_entity_regions(&self);

    fn evict_natural_id_region(&self, entity_name: &str);

    fn evict_all_natural_id_regions(&self);

    fn contains_collection(&self, role: &str, owner_id: &EntityId) -> bool;

    fn evict_collection(&self, role: &str, owner_id: &EntityId);

    fn evict_collection_region(&self, role: &str);

    fn evict_all_collection_regions(&self);

    /// Whether the named query region currently holds results.
    fn contains_query_region(&self, region: &str) -> bool;

    fn evict_default_query_region(&self) {
        self.evict_query_region(DEFAULT_QUERY_REGION);
    }

    fn evict_query_region(&self, region: &str);

    fn evict_all_query_regions(&self);

    // ---- data path ----

    fn get_entity(&self, entity_name: &str, id: &EntityId) -> Option<CachedEntity>;

    /// Stores an entity snapshot. With `minimal_put`, an entry already holding
    /// the same version is left alone. Returns whether the cache was written.
    fn put_entity(
        &self,
        entity_name: &str,
        id: &EntityId,
        entry: CachedEntity,
        minimal_put: bool,
    ) -> bool;

    fn resolve_natural_id(&self, entity_name: &str, natural_id: &str) -> Option<EntityId>;

    fn put_natural_id(&self, entity_name: &str, natural_id: &str, id: &EntityId);

    fn put_collection(&self, role: &str, owner_id: &EntityId, elements: Vec<EntityId>);

    fn get_query(&self, region: &str, query_key: &str) -> Option<Vec<EntityId>>;

    fn put_query(&self, region: &str, query_key: &str, ids: Vec<EntityId>);
}

impl dyn Cache {
    pub fn contains<E: Entity>(&self, id: &EntityId) -> bool {
        self.contains_entity(E::ENTITY_NAME, id)
    }

    pub fn evict<E: Entity>(&self, id: &EntityId) {
        self.evict_entity(E::ENTITY_NAME, id);
    }

    pub fn evict_region_of<E: Entity>(&self) {
        self.evict_entity_region(E::ENTITY_NAME);
    }

    pub fn evict_natural_id_region_of<E: Entity>(&self) {
        self.evict_natural_id_region(E::ENTITY_NAME);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_role_format() {
        assert_eq!(collection_role("Invoice", "lines"), "Invoice.lines");
    }
}
