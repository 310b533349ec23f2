#![allow(dead_code)]

use persistkit::cache::{Cache, CachedEntity, RegionCache};
use persistkit::{
    CascadeAction, Entity, EntityHandle, EntityId, EntityKey, IdStrategy, SessionFactory,
    SessionFactoryConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Option<EntityId>,
    pub version: i64,
    pub number: String,
    pub amount: i64,
    pub status: Option<String>,
}

impl Entity for Invoice {
    const ENTITY_NAME: &'static str = "Invoice";
    const ID_STRATEGY: IdStrategy = IdStrategy::Sequence;

    fn id(&self) -> Option<EntityId> {
        self.id.clone()
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn version(&self) -> Option<i64> {
        Some(self.version)
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn natural_id(&self) -> Option<String> {
        Some(self.number.clone())
    }
}

/// Unversioned owner of invoices; every cascade reaches its invoices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Option<EntityId>,
    pub name: String,
    pub invoices: Vec<EntityId>,
}

impl Entity for Customer {
    const ENTITY_NAME: &'static str = "Customer";

    fn id(&self) -> Option<EntityId> {
        self.id.clone()
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn collections(&self) -> Vec<(&'static str, Vec<EntityId>)> {
        vec![("invoices", self.invoices.clone())]
    }

    fn cascade_targets(&self, _action: CascadeAction) -> Vec<EntityKey> {
        self.invoices
            .iter()
            .map(|id| EntityKey::new(Invoice::ENTITY_NAME, id.clone()))
            .collect()
    }
}

/// Catalog item keyed by a caller-assigned code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sku {
    pub id: Option<EntityId>,
    pub version: i64,
    pub title: String,
}

impl Entity for Sku {
    const ENTITY_NAME: &'static str = "Sku";
    const ID_STRATEGY: IdStrategy = IdStrategy::Assigned;

    fn id(&self) -> Option<EntityId> {
        self.id.clone()
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn version(&self) -> Option<i64> {
        Some(self.version)
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }
}

pub fn invoice(number: &str, amount: i64) -> EntityHandle<Invoice> {
    EntityHandle::new(Invoice {
        id: None,
        version: 0,
        number: number.to_string(),
        amount,
        status: None,
    })
}

pub fn customer(name: &str, invoices: Vec<EntityId>) -> EntityHandle<Customer> {
    EntityHandle::new(Customer {
        id: None,
        name: name.to_string(),
        invoices,
    })
}

pub fn sku(code: &str, title: &str) -> EntityHandle<Sku> {
    EntityHandle::new(Sku {
        id: Some(EntityId::from(code)),
        version: 0,
        title: title.to_string(),
    })
}

pub async fn factory() -> SessionFactory {
    SessionFactory::new(SessionFactoryConfig::default())
        .await
        .unwrap()
}

pub async fn factory_with(config: SessionFactoryConfig) -> SessionFactory {
    SessionFactory::new(config).await.unwrap()
}

/// Saves and flushes invoices in one session, returning their identifiers.
pub async fn seed_invoices(factory: &SessionFactory, invoices: &[(&str, i64)]) -> Vec<EntityId> {
    let mut session = factory.open_session().unwrap();
    let mut ids = Vec::with_capacity(invoices.len());
    for (number, amount) in invoices {
        ids.push(session.save(&invoice(number, *amount)).await.unwrap());
    }
    session.flush().await.unwrap();
    session.close().await.unwrap();
    ids
}

/// Region cache that counts data-path calls.
#[derive(Default)]
pub struct CountingCache {
    inner: RegionCache,
    pub entity_reads: AtomicU64,
    pub entity_writes: AtomicU64,
    pub query_reads: AtomicU64,
    pub query_writes: AtomicU64,
}

impl CountingCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entity_reads(&self) -> u64 {
        self.entity_reads.load(Ordering::SeqCst)
    }

    pub fn entity_writes(&self) -> u64 {
        self.entity_writes.load(Ordering::SeqCst)
    }

    pub fn query_reads(&self) -> u64 {
        self.query_reads.load(Ordering::SeqCst)
    }

    pub fn query_writes(&self) -> u64 {
        self.query_writes.load(Ordering::SeqCst)
    }
}

impl Cache for CountingCache {
    fn contains_entity(&self, entity_name: &str, id: &EntityId) -> bool {
        self.inner.contains_entity(entity_name, id)
    }

    fn evict_entity(&self, entity_name: &str, id: &EntityId) {
        self.inner.evict_entity(entity_name, id)
    }

    fn evict_entity_region(&self, entity_name: &str) {
        self.inner.evict_entity_region(entity_name)
    }

    fn evict_all_entity_regions(&self) {
        self.inner.evict_all_entity_regions()
    }

    fn evict_natural_id_region(&self, entity_name: &str) {
        self.inner.evict_natural_id_region(entity_name)
    }

    fn evict_all_natural_id_regions(&self) {
        self.inner.evict_all_natural_id_regions()
    }

    fn contains_collection(&self, role: &str, owner_id: &EntityId) -> bool {
        self.inner.contains_collection(role, owner_id)
    }

    fn evict_collection(&self, role: &str, owner_id: &EntityId) {
        self.inner.evict_collection(role, owner_id)
    }

    fn evict_collection_region(&self, role: &str) {
        self.inner.evict_collection_region(role)
    }

    fn evict_all_collection_regions(&self) {
        self.inner.evict_all_collection_regions()
    }

    fn contains_query_region(&self, region: &str) -> bool {
        self.inner.contains_query_region(region)
    }

    fn evict_query_region(&self, region: &str) {
        self.inner.evict_query_region(region)
    }

    fn evict_all_query_regions(&self) {
        self.inner.evict_all_query_regions()
    }

    fn get_entity(&self, entity_name: &str, id: &EntityId) -> Option<CachedEntity> {
        self.entity_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_entity(entity_name, id)
    }

    fn put_entity(
        &self,
        entity_name: &str,
        id: &EntityId,
        entry: CachedEntity,
        minimal_put: bool,
    ) -> bool {
        self.entity_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.put_entity(entity_name, id, entry, minimal_put)
    }

    fn resolve_natural_id(&self, entity_name: &str, natural_id: &str) -> Option<EntityId> {
        self.inner.resolve_natural_id(entity_name, natural_id)
    }

    fn put_natural_id(&self, entity_name: &str, natural_id: &str, id: &EntityId) {
        self.inner.put_natural_id(entity_name, natural_id, id)
    }

    fn put_collection(&self, role: &str, owner_id: &EntityId, elements: Vec<EntityId>) {
        self.inner.put_collection(role, owner_id, elements)
    }

    fn get_query(&self, region: &str, query_key: &str) -> Option<Vec<EntityId>> {
        self.query_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_query(region, query_key)
    }

    fn put_query(&self, region: &str, query_key: &str, ids: Vec<EntityId>) {
        self.query_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.put_query(region, query_key, ids)
    }
}
