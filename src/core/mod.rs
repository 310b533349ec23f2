pub mod entity;
pub mod error;
pub mod types;

pub use entity::{CascadeAction, Entity, EntityHandle};
pub(crate) use entity::ManagedState;
pub use error::{PersistError, Result};
pub use types::{EntityId, EntityKey, IdStrategy};
