use super::Session;
use super::entry::EntryStatus;
use crate::core::{Entity, EntityHandle, EntityKey, PersistError, Result};
use crate::factory::StatisticsCounters;
use crate::query::{Filter, Query};
use tracing::{Instrument, Level, event, info_span};

impl Session {
    /// Builds a query over the elements of `collection`, narrowed and ordered
    /// by `fragment` (for example `where this.amount > 10 order by this.amount`).
    pub fn create_filter<E: Entity>(
        &self,
        collection: &[EntityHandle<E>],
        fragment: &str,
    ) -> Result<Query<E>> {
        self.ensure_open()?;
        let elements = collection
            .iter()
            .map(|element| {
                element.id().ok_or_else(|| {
                    PersistError::InvalidState(format!(
                        "collection holds a transient {}",
                        E::ENTITY_NAME
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let filter = Filter::parse(fragment)?;
        Ok(Query::new(elements, filter, self.default_read_only))
    }

    pub(crate) async fn run_query<E: Entity>(&mut self, query: &Query<E>) -> Result<Vec<EntityHandle<E>>> {
        self.ensure_open()?;
        self.auto_flush_for(E::ENTITY_NAME).await?;

        let span = info_span!(
            "query",
            session_id = self.id,
            entity = E::ENTITY_NAME,
            filter = query.filter().source()
        );
        self.query_ids(query).instrument(span).await
    }

    async fn query_ids<E: Entity>(&mut self, query: &Query<E>) -> Result<Vec<EntityHandle<E>>> {
        StatisticsCounters::bump(&self.counters().queries_executed);
        let query_cache = query.is_cacheable() && self.factory.config().query_cache;
        let cache_key = query.cache_key();

        let cached = if query_cache && self.cache_readable() {
            self.factory
                .inner()
                .cache
                .get_query(query.cache_region(), &cache_key)
        } else {
            None
        };

        let ids = match cached {
            Some(ids) => {
                StatisticsCounters::bump(&self.counters().query_cache_hits);
                event!(Level::DEBUG, results = ids.len(), "query served from cache");
                ids
            }
            None => {
                let connection = self.lease().await?;
                let mut rows = Vec::with_capacity(query.elements().len());
                let mut failure = None;
                for id in query.elements() {
                    match connection.fetch(&EntityKey::new(E::ENTITY_NAME, id)).await {
                        Ok(Some(row)) => rows.push((id.clone(), row.state)),
                        Ok(None) => {}
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
                self.give_back(connection).await?;
                if let Some(err) = failure {
                    return Err(err);
                }

                let mut ids = query.filter().apply(rows)?;
                if let Some(max_results) = query.max_results() {
                    ids.truncate(max_results);
                }
                if query_cache && self.cache_writable() {
                    self.factory
                        .inner()
                        .cache
                        .put_query(query.cache_region(), &cache_key, ids.clone());
                }
                ids
            }
        };

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let key = EntityKey::new(E::ENTITY_NAME, id);
            if let Some(entry) = self.entries.get(&key) {
                if entry.status != EntryStatus::Deleted {
                    results.push(entry.handle::<E>()?);
                }
                continue;
            }
            if let Some(handle) = self.get::<E>(key.id.clone()).await? {
                if let Some(entry) = self.entries.get_mut(&key) {
                    entry.read_only = query.is_read_only();
                }
                results.push(handle);
            }
        }
        event!(Level::DEBUG, results = results.len(), "query listed");
        Ok(results)
    }
}
