use super::change::Change;
use super::locks::LockTable;
use crate::core::{EntityId, EntityKey, PersistError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

/// A persisted record: serialized state plus its optimistic version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub state: JsonValue,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Rows of one entity type, ordered by identifier.
type EntityTable = BTreeMap<EntityId, StoredRow>;

/// Result of an applied batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Version each change left its row at, in batch order.
    pub versions: Vec<i64>,
    /// Changes that restore every touched row to its state before the batch,
    /// each expecting the version the batch left the row at.
    pub undo: Vec<Change>,
}

/// The shared in-memory database behind every connection of a provider.
///
/// Reads go through a read lock; a change batch takes the write lock once and
/// either applies completely or not at all. No lock is held across an await,
/// so every operation is synchronous and safe to call from `Drop`.
#[derive(Debug)]
pub struct EntityStore {
    name: String,
    tables: RwLock<HashMap<String, EntityTable>>,
    sequences: Mutex<HashMap<String, i64>>,
    locks: LockTable,
    batches_applied: AtomicU64,
}

impl EntityStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: RwLock::new(HashMap::new()),
            sequences: Mutex::new(HashMap::new()),
            locks: LockTable::new(),
            batches_applied: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn batches_applied(&self) -> u64 {
        self.batches_applied.load(Ordering::Relaxed)
    }

    pub fn fetch(&self, key: &EntityKey) -> Option<StoredRow> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .get(&key.entity_name)
            .and_then(|table| table.get(&key.id))
            .cloned()
    }

    pub fn exists(&self, key: &EntityKey) -> bool {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .get(&key.entity_name)
            .is_some_and(|table| table.contains_key(&key.id))
    }

    /// All rows of one entity type in identifier order.
    pub fn scan(&self, entity_name: &str) -> Vec<(EntityId, StoredRow)> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .get(entity_name)
            .map(|table| {
                table
                    .iter()
                    .map(|(id, row)| (id.clone(), row.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count(&self, entity_name: &str) -> usize {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.get(entity_name).map(|table| table.len()).unwrap_or(0)
    }

    /// Next value of the per-type identifier sequence, starting at 1.
    pub fn next_sequence(&self, entity_name: &str) -> i64 {
        let mut sequences = self.sequences.lock().unwrap_or_else(PoisonError::into_inner);
        let next = sequences.entry(entity_name.to_string()).or_insert(0);
        *next += 1;
        *next
    }

    /// Applies a batch atomically on behalf of `owner`. On error the store is
    /// untouched.
    ///
    /// Rows locked by another owner are not written (`LockUnavailable`). With
    /// `hold_write_locks`, `owner` keeps an exclusive lock on every row the
    /// batch wrote until it releases its locks.
    pub fn apply(
        &self,
        changes: &[Change],
        owner: u64,
        hold_write_locks: bool,
    ) -> Result<BatchOutcome> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let mut staged: HashMap<EntityKey, Option<StoredRow>> = HashMap::new();
        let mut originals: Vec<(EntityKey, Option<StoredRow>)> = Vec::new();
        let mut versions = Vec::with_capacity(changes.len());
        let now = Utc::now();

        for change in changes {
            let key = change.key();
            let current = match staged.get(key) {
                Some(row) => row.clone(),
                None => {
                    let row = tables
                        .get(&key.entity_name)
                        .and_then(|table| table.get(&key.id))
                        .cloned();
                    if !originals.iter().any(|(seen, _)| seen == key) {
                        originals.push((key.clone(), row.clone()));
                    }
                    row
                }
            };

            match change {
                Change::Insert { state, version, .. } => {
                    if current.is_some() {
                        return Err(PersistError::ConstraintViolation(format!(
                            "a row with identifier {} already exists",
                            key
                        )));
                    }
                    staged.insert(
                        key.clone(),
                        Some(StoredRow {
                            state: state.clone(),
                            version: *version,
                            updated_at: now,
                        }),
                    );
                    versions.push(*version);
                }
                Change::Update {
                    state,
                    expected_version,
                    new_version,
                    ..
                } => {
                    let row = existing(key, current)?;
                    check_version(key, &row, *expected_version)?;
                    let version = new_version.unwrap_or(row.version + 1);
                    staged.insert(
                        key.clone(),
                        Some(StoredRow {
                            state: state.clone(),
                            version,
                            updated_at: now,
                        }),
                    );
                    versions.push(version);
                }
                Change::Delete {
                    expected_version, ..
                } => {
                    let row = existing(key, current)?;
                    check_version(key, &row, *expected_version)?;
                    staged.insert(key.clone(), None);
                    versions.push(row.version);
                }
                Change::IncrementVersion {
                    expected_version, ..
                } => {
                    let mut row = existing(key, current)?;
                    check_version(key, &row, *expected_version)?;
                    row.version += 1;
                    row.updated_at = now;
                    versions.push(row.version);
                    staged.insert(key.clone(), Some(row));
                }
                Change::VerifyVersion {
                    expected_version, ..
                } => {
                    let row = existing(key, current)?;
                    check_version(key, &row, Some(*expected_version))?;
                    versions.push(row.version);
                }
            }
        }

        let written: Vec<&EntityKey> = staged.keys().collect();
        self.locks.claim_writes(&written, owner, hold_write_locks)?;

        let undo = originals
            .into_iter()
            .filter_map(|(key, original)| {
                // Verified-only rows were never written.
                let after = staged.get(&key)?.clone();
                match (original, after) {
                    (None, None) => None,
                    (None, Some(after)) => Some(Change::Delete {
                        key,
                        expected_version: Some(after.version),
                    }),
                    (Some(row), Some(after)) => Some(Change::Update {
                        key,
                        state: row.state,
                        expected_version: Some(after.version),
                        new_version: Some(row.version),
                    }),
                    (Some(row), None) => Some(Change::Insert {
                        key,
                        state: row.state,
                        version: row.version,
                    }),
                }
            })
            .collect();

        for (key, row) in staged {
            match row {
                Some(row) => {
                    tables.entry(key.entity_name).or_default().insert(key.id, row);
                }
                None => {
                    if let Some(table) = tables.get_mut(&key.entity_name) {
                        table.remove(&key.id);
                    }
                }
            }
        }

        self.batches_applied.fetch_add(1, Ordering::Relaxed);
        Ok(BatchOutcome { versions, undo })
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new("default")
    }
}

fn existing(key: &EntityKey, row: Option<StoredRow>) -> Result<StoredRow> {
    row.ok_or_else(|| PersistError::StaleState(format!("{} no longer exists", key)))
}

fn check_version(key: &EntityKey, row: &StoredRow, expected: Option<i64>) -> Result<()> {
    match expected {
        Some(expected) if expected != row.version => Err(PersistError::StaleState(format!(
            "{} is at version {}, expected {}",
            key, row.version, expected
        ))),
        _ => Ok(()),
    }
}
