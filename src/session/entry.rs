use crate::core::{Entity, EntityHandle, ManagedState, PersistError, Result};
use crate::mode::LockMode;
use serde_json::Value as JsonValue;

/// Lifecycle of a tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryStatus {
    /// Saved in memory, inserted at the next flush with `version`.
    Saving { version: i64 },
    /// Synchronized with (or reattached to) a stored row.
    Managed,
    /// Scheduled for deletion at the next flush.
    Deleted,
}

/// A write the next flush must issue even if the state looks clean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingWrite {
    /// `update` reattached a detached instance.
    Reattached,
    /// `replicate` overwrites the row, pinning its version when one is given.
    Replicated { version: Option<i64> },
}

/// Per-instance bookkeeping of the identity map.
pub(crate) struct EntityEntry {
    /// Insertion order; flush applies entries in this order.
    pub seq: u64,
    pub instance: Box<dyn ManagedState>,
    pub status: EntryStatus,
    /// State as last synchronized with the store.
    pub snapshot: Option<JsonValue>,
    /// Version of the stored row, when known.
    pub version: Option<i64>,
    pub read_only: bool,
    pub lock_mode: LockMode,
    pub pending: Option<PendingWrite>,
    /// Verify the row version at the next flush.
    pub verify_version: bool,
    /// Increment the row version at the next flush.
    pub force_increment: bool,
}

impl EntityEntry {
    pub fn new(seq: u64, instance: Box<dyn ManagedState>, status: EntryStatus) -> Self {
        Self {
            seq,
            instance,
            status,
            snapshot: None,
            version: None,
            read_only: false,
            lock_mode: LockMode::None,
            pending: None,
            verify_version: false,
            force_increment: false,
        }
    }

    /// Whether a non-read-only entry's state differs from its snapshot.
    pub fn is_modified(&self) -> Result<bool> {
        match &self.snapshot {
            Some(snapshot) => Ok(self.instance.state()? != *snapshot),
            None => Ok(true),
        }
    }

    /// Whether the next flush has work to do for this entry.
    pub fn needs_flush(&self) -> Result<bool> {
        if self.verify_version || self.force_increment {
            return Ok(true);
        }
        match self.status {
            EntryStatus::Saving { .. } | EntryStatus::Deleted => Ok(true),
            EntryStatus::Managed if self.read_only => Ok(false),
            EntryStatus::Managed => Ok(self.pending.is_some() || self.is_modified()?),
        }
    }

    pub fn handle<E: Entity>(&self) -> Result<EntityHandle<E>> {
        self.instance
            .as_any()
            .downcast_ref::<EntityHandle<E>>()
            .cloned()
            .ok_or_else(|| {
                PersistError::InternalInvariant(format!(
                    "tracked instance is not a {}",
                    E::ENTITY_NAME
                ))
            })
    }

    pub fn is_instance<E: Entity>(&self, handle: &EntityHandle<E>) -> bool {
        self.instance.instance_ptr() == handle.ptr()
    }

    /// Records a synchronized state and version.
    pub fn synchronized(&mut self, version: i64) -> Result<()> {
        self.instance.set_version(version);
        self.version = Some(version);
        self.snapshot = Some(self.instance.state()?);
        self.status = EntryStatus::Managed;
        self.pending = None;
        self.verify_version = false;
        self.force_increment = false;
        Ok(())
    }

    /// Moves to `version` without treating pending edits as synchronized.
    pub fn bump_version(&mut self, version: i64) -> Result<()> {
        self.instance.set_version(version);
        self.version = Some(version);
        if let Some(snapshot) = &self.snapshot {
            self.snapshot = Some(self.instance.state_with_version(snapshot, version)?);
        }
        Ok(())
    }
}
