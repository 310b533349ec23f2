pub mod change;
pub mod locks;
pub mod memory;

pub use change::Change;
pub use locks::{LockTable, RowLockKind};
pub use memory::{BatchOutcome, EntityStore, StoredRow};
