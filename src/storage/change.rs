// ============================================================================
// Store Change Batches
// ============================================================================
//
// A flush is expressed as an ordered list of Changes applied by the store as
// one atomic batch. Every change is validated against the rows as they would
// look after the changes before it; nothing is written unless all pass.
//
// ============================================================================

use crate::core::EntityKey;
use serde_json::Value as JsonValue;

/// A single row operation in a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Insert a new row; fails if the key already exists.
    Insert {
        key: EntityKey,
        state: JsonValue,
        version: i64,
    },

    /// Replace a row's state.
    ///
    /// `expected_version` enables the optimistic check; `new_version`
    /// overrides the default increment (used by replication).
    Update {
        key: EntityKey,
        state: JsonValue,
        expected_version: Option<i64>,
        new_version: Option<i64>,
    },

    /// Delete an existing row.
    Delete {
        key: EntityKey,
        expected_version: Option<i64>,
    },

    /// Bump the version without touching state.
    IncrementVersion {
        key: EntityKey,
        expected_version: Option<i64>,
    },

    /// Assert the row still carries `expected_version`.
    VerifyVersion { key: EntityKey, expected_version: i64 },
}

impl Change {
    pub fn key(&self) -> &EntityKey {
        match self {
            Change::Insert { key, .. } => key,
            Change::Update { key, .. } => key,
            Change::Delete { key, .. } => key,
            Change::IncrementVersion { key, .. } => key,
            Change::VerifyVersion { key, .. } => key,
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.key().entity_name
    }

    /// Whether applying the change modifies stored data.
    pub fn is_write(&self) -> bool {
        !matches!(self, Change::VerifyVersion { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_key_and_entity_name() {
        let change = Change::Delete {
            key: EntityKey::new("Invoice", 3),
            expected_version: Some(1),
        };
        assert_eq!(change.entity_name(), "Invoice");
        assert_eq!(change.key(), &EntityKey::new("Invoice", 3));
    }

    #[test]
    fn test_change_classification() {
        let verify = Change::VerifyVersion {
            key: EntityKey::new("Invoice", 3),
            expected_version: 0,
        };
        assert!(!verify.is_write());

        let insert = Change::Insert {
            key: EntityKey::new("Invoice", 3),
            state: serde_json::json!({}),
            version: 0,
        };
        assert!(insert.is_write());
    }
}
