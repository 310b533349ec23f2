use super::Session;
use super::entry::{EntryStatus, PendingWrite};
use crate::core::{EntityKey, PersistError, Result};
use crate::factory::StatisticsCounters;
use crate::mode::FlushMode;
use crate::storage::Change;
use tracing::{Instrument, Level, event, info_span};

/// What a flushed change does to its entry once the batch succeeded.
enum Applied {
    Inserted,
    Updated,
    Deleted,
    Incremented,
    Verified,
}

impl Session {
    /// Whether a flush would have work to do: pending inserts, deletes or
    /// reattachments, or state that differs from its snapshot. Read-only
    /// instances never count.
    pub fn is_dirty(&self) -> Result<bool> {
        self.ensure_open()?;
        for entry in self.entries.values() {
            let dirty = match entry.status {
                EntryStatus::Saving { .. } | EntryStatus::Deleted => true,
                EntryStatus::Managed if entry.read_only => false,
                EntryStatus::Managed => entry.pending.is_some() || entry.is_modified()?,
            };
            if dirty {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Synchronizes every pending change with the store as one atomic batch,
    /// in the order the instances started being tracked. When the batch fails
    /// nothing in the session changes.
    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        let span = info_span!("flush", session_id = self.id, entities = self.entries.len());
        self.flush_entries().instrument(span).await
    }

    async fn flush_entries(&mut self) -> Result<()> {
        let (changes, applied) = self.collect_changes()?;
        if changes.is_empty() {
            event!(Level::TRACE, "nothing to flush");
            return Ok(());
        }

        let mut connection = self.lease().await?;
        let result = connection.execute(&changes).await;
        self.give_back(connection).await?;

        let versions = match result {
            Ok(versions) => versions,
            Err(err) => {
                if matches!(err, PersistError::StaleState(_)) {
                    StatisticsCounters::bump(&self.counters().optimistic_failures);
                }
                event!(Level::ERROR, error = %err, changes = changes.len(), "flush failed");
                return Err(err);
            }
        };

        let mut wrote = false;
        for ((change, applied), version) in changes.iter().zip(applied).zip(versions) {
            let key = change.key();
            let counters = self.counters();
            match applied {
                Applied::Inserted | Applied::Updated => {
                    let counter = if matches!(applied, Applied::Inserted) {
                        &counters.entity_inserts
                    } else {
                        &counters.entity_updates
                    };
                    StatisticsCounters::bump(counter);
                    wrote = true;
                    if let Some(entry) = self.entries.get_mut(key) {
                        entry.synchronized(version)?;
                    }
                    self.cache_or_evict(key)?;
                }
                Applied::Deleted => {
                    StatisticsCounters::bump(&counters.entity_deletes);
                    wrote = true;
                    if let Some(entry) = self.entries.remove(key) {
                        self.evict_cached(key, &entry);
                    }
                }
                Applied::Incremented => {
                    wrote = true;
                    if let Some(entry) = self.entries.get_mut(key) {
                        entry.force_increment = false;
                        entry.verify_version = false;
                        entry.bump_version(version)?;
                    }
                    self.cache_or_evict(key)?;
                }
                Applied::Verified => {
                    if let Some(entry) = self.entries.get_mut(key) {
                        entry.verify_version = false;
                    }
                }
            }
        }

        if wrote && self.factory.config().query_cache {
            self.factory.inner().cache.evict_all_query_regions();
        }
        StatisticsCounters::bump(&self.counters().flushes);
        event!(Level::DEBUG, changes = changes.len(), "flushed");
        Ok(())
    }

    /// Builds the batch for every entry that needs flushing, in tracking order.
    fn collect_changes(&self) -> Result<(Vec<Change>, Vec<Applied>)> {
        let mut pending: Vec<(&EntityKey, &super::entry::EntityEntry)> = Vec::new();
        for (key, entry) in &self.entries {
            if entry.needs_flush()? {
                pending.push((key, entry));
            }
        }
        pending.sort_by_key(|(_, entry)| entry.seq);

        let mut changes = Vec::with_capacity(pending.len());
        let mut applied = Vec::with_capacity(pending.len());
        for (key, entry) in pending {
            let key = key.clone();
            let writes_state = !entry.read_only
                && (entry.pending.is_some() || entry.is_modified()?);

            let (change, outcome) = match entry.status {
                EntryStatus::Saving { version } => (
                    Change::Insert {
                        key,
                        state: entry.instance.state()?,
                        version,
                    },
                    Applied::Inserted,
                ),
                EntryStatus::Deleted => (
                    Change::Delete {
                        key,
                        expected_version: entry.instance.version().and(entry.version),
                    },
                    Applied::Deleted,
                ),
                EntryStatus::Managed if writes_state => {
                    let checked = entry.verify_version || entry.force_increment;
                    let (expected_version, new_version) = match entry.pending {
                        Some(PendingWrite::Replicated { version }) => (None, version),
                        _ if checked => (entry.version, None),
                        Some(PendingWrite::Reattached) => (None, None),
                        None => (entry.instance.version().and(entry.version), None),
                    };
                    (
                        Change::Update {
                            key,
                            state: entry.instance.state()?,
                            expected_version,
                            new_version,
                        },
                        Applied::Updated,
                    )
                }
                EntryStatus::Managed if entry.force_increment => (
                    Change::IncrementVersion {
                        key,
                        expected_version: entry.version,
                    },
                    Applied::Incremented,
                ),
                EntryStatus::Managed => match entry.version {
                    Some(expected_version) if entry.verify_version => (
                        Change::VerifyVersion {
                            key,
                            expected_version,
                        },
                        Applied::Verified,
                    ),
                    _ => continue,
                },
            };
            changes.push(change);
            applied.push(outcome);
        }
        Ok((changes, applied))
    }

    fn cache_or_evict(&self, key: &EntityKey) -> Result<()> {
        if self.cache_writable() {
            return self.cache_entry(key, self.minimal_puts());
        }
        if let Some(entry) = self.entries.get(key) {
            self.evict_cached(key, entry);
        }
        Ok(())
    }

    /// Flushes before a query on `entity_name` when the flush mode asks for it.
    pub(super) async fn auto_flush_for(&mut self, entity_name: &str) -> Result<()> {
        let flush = match self.flush_mode {
            FlushMode::Always => true,
            FlushMode::Auto => {
                let mut touched = false;
                for (key, entry) in &self.entries {
                    if key.entity_name == entity_name && entry.needs_flush()? {
                        touched = true;
                        break;
                    }
                }
                touched
            }
            FlushMode::Commit | FlushMode::Manual | FlushMode::Never => false,
        };
        if flush {
            self.flush().await?;
        }
        Ok(())
    }

    // ---- transactions ----

    /// Pins a connection and starts a transaction on it. Changes flushed
    /// until `commit` or `rollback` belong to the transaction.
    pub async fn begin_transaction(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.in_transaction {
            return Err(PersistError::IllegalState("Transaction already active".into()));
        }

        let mut connection = self.lease().await?;
        if let Err(err) = connection.begin() {
            self.give_back(connection).await?;
            return Err(err);
        }
        self.connection = Some(connection);
        self.in_transaction = true;
        event!(Level::DEBUG, session_id = self.id, "transaction started");
        Ok(())
    }

    /// Flushes (unless the flush mode is manual), commits and releases row locks.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.in_transaction {
            return Err(PersistError::IllegalState("No active transaction".into()));
        }

        if !FlushMode::is_manual(self.flush_mode) {
            self.flush().await?;
        }

        let mut connection = self.connection.take().ok_or_else(|| {
            PersistError::IllegalState("Session is disconnected".into())
        })?;
        let committed = connection.commit();
        self.in_transaction = false;
        self.give_back(connection).await?;
        committed?;

        self.release_locks();
        StatisticsCounters::bump(&self.counters().transactions_committed);
        event!(Level::DEBUG, session_id = self.id, "transaction committed");
        Ok(())
    }

    /// Undoes the transaction's flushed changes and clears the persistence
    /// context, since tracked state may no longer match the store.
    pub async fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.in_transaction {
            return Err(PersistError::IllegalState("No active transaction".into()));
        }

        let mut connection = self.connection.take().ok_or_else(|| {
            PersistError::IllegalState("Session is disconnected".into())
        })?;
        let rolled_back = connection.rollback().await;
        self.in_transaction = false;
        self.give_back(connection).await?;

        self.discard_rolled_back();
        self.release_locks();
        StatisticsCounters::bump(&self.counters().transactions_rolled_back);
        event!(Level::DEBUG, session_id = self.id, "transaction rolled back");
        rolled_back
    }
}
