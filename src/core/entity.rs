use super::error::Result;
use super::types::{EntityId, EntityKey, IdStrategy};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Operations that may cascade from an entity to its associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeAction {
    Evict,
    Lock,
    Refresh,
    Delete,
}

/// A persistent type.
///
/// State is captured through serde: the serialized JSON value is what the
/// session snapshots for dirty checking and what the store keeps per row.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Entity type name. Also the name of the entity's cache region.
    const ENTITY_NAME: &'static str;

    const ID_STRATEGY: IdStrategy = IdStrategy::Uuid;

    fn id(&self) -> Option<EntityId>;

    fn set_id(&mut self, id: EntityId);

    /// Optimistic version, when the type carries one.
    fn version(&self) -> Option<i64> {
        None
    }

    fn set_version(&mut self, _version: i64) {}

    /// Business key resolved through the natural-id cache region.
    fn natural_id(&self) -> Option<String> {
        None
    }

    /// Owned collections as `(property, element ids)`.
    fn collections(&self) -> Vec<(&'static str, Vec<EntityId>)> {
        Vec::new()
    }

    /// Associated entities that `action` should reach. The session follows
    /// these keys only to instances it already tracks.
    fn cascade_targets(&self, _action: CascadeAction) -> Vec<EntityKey> {
        Vec::new()
    }
}

/// Shared handle to one in-memory entity instance.
///
/// Identity is pointer identity: two handles are the same instance iff
/// [`EntityHandle::same_instance`] holds. A session's identity map hands out
/// clones of the handle it tracks.
pub struct EntityHandle<E> {
    inner: Arc<RwLock<E>>,
}

impl<E> Clone for EntityHandle<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Entity> EntityHandle<E> {
    pub fn new(entity: E) -> Self {
        Self {
            inner: Arc::new(RwLock::new(entity)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, E> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, E> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Option<EntityId> {
        self.read().id()
    }

    pub fn key(&self) -> Option<EntityKey> {
        self.id().map(|id| EntityKey::new(E::ENTITY_NAME, id))
    }

    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn ptr(&self) -> *const () {
        Arc::as_ptr(&self.inner) as *const ()
    }

    /// Builds a fresh, untracked instance from serialized state.
    pub(crate) fn from_state(id: &EntityId, state: JsonValue) -> Result<Self> {
        let mut entity: E = serde_json::from_value(state)?;
        entity.set_id(id.clone());
        Ok(Self::new(entity))
    }
}

impl<E: Entity + fmt::Debug> fmt::Debug for EntityHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EntityHandle").field(&*self.read()).finish()
    }
}

/// Type-erased view of a tracked instance, used by the identity map.
pub(crate) trait ManagedState: Send + Sync {
    fn entity_name(&self) -> &'static str;

    fn state(&self) -> Result<JsonValue>;

    /// Replaces the instance's state in place, keeping the instance itself.
    fn overwrite(&self, id: &EntityId, state: JsonValue) -> Result<()>;

    fn version(&self) -> Option<i64>;

    fn set_version(&self, version: i64);

    /// `state` with its version field set to `version`.
    fn state_with_version(&self, state: &JsonValue, version: i64) -> Result<JsonValue>;

    fn natural_id(&self) -> Option<String>;

    fn collections(&self) -> Vec<(&'static str, Vec<EntityId>)>;

    fn cascade_targets(&self, action: CascadeAction) -> Vec<EntityKey>;

    fn instance_ptr(&self) -> *const ();

    fn as_any(&self) -> &dyn Any;
}

impl<E: Entity> ManagedState for EntityHandle<E> {
    fn entity_name(&self) -> &'static str {
        E::ENTITY_NAME
    }

    fn state(&self) -> Result<JsonValue> {
        Ok(serde_json::to_value(&*self.read())?)
    }

    fn overwrite(&self, id: &EntityId, state: JsonValue) -> Result<()> {
        let mut entity: E = serde_json::from_value(state)?;
        entity.set_id(id.clone());
        *self.write() = entity;
        Ok(())
    }

    fn version(&self) -> Option<i64> {
        self.read().version()
    }

    fn set_version(&self, version: i64) {
        self.write().set_version(version);
    }

    fn state_with_version(&self, state: &JsonValue, version: i64) -> Result<JsonValue> {
        let mut entity: E = serde_json::from_value(state.clone())?;
        entity.set_version(version);
        Ok(serde_json::to_value(&entity)?)
    }

    fn natural_id(&self) -> Option<String> {
        self.read().natural_id()
    }

    fn collections(&self) -> Vec<(&'static str, Vec<EntityId>)> {
        self.read().collections()
    }

    fn cascade_targets(&self, action: CascadeAction) -> Vec<EntityKey> {
        self.read().cascade_targets(action)
    }

    fn instance_ptr(&self) -> *const () {
        self.ptr()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Note {
        id: Option<EntityId>,
        text: String,
    }

    impl Entity for Note {
        const ENTITY_NAME: &'static str = "Note";

        fn id(&self) -> Option<EntityId> {
            self.id.clone()
        }

        fn set_id(&mut self, id: EntityId) {
            self.id = Some(id);
        }
    }

    #[test]
    fn test_handle_identity() {
        let a = EntityHandle::new(Note { id: None, text: "a".into() });
        let b = a.clone();
        let c = EntityHandle::new(Note { id: None, text: "a".into() });

        assert!(a.same_instance(&b));
        assert!(!a.same_instance(&c));
    }

    #[test]
    fn test_overwrite_keeps_instance_and_id() {
        let handle = EntityHandle::new(Note {
            id: Some(EntityId::Int(7)),
            text: "old".into(),
        });
        let alias = handle.clone();

        ManagedState::overwrite(
            &handle,
            &EntityId::Int(7),
            serde_json::json!({ "id": null, "text": "new" }),
        )
        .unwrap();

        assert_eq!(alias.read().text, "new");
        assert_eq!(alias.id(), Some(EntityId::Int(7)));
    }
}
