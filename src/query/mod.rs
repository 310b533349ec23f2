//! Collection filters.
//!
//! A [`Query`] selects among the elements of a collection with a filter
//! fragment evaluated against their stored state. It is created by
//! `Session::create_filter` and executed against a session, which flushes
//! first when its flush mode asks for it and hands back tracked instances.

pub mod filter;
mod pattern;

pub use filter::Filter;

use crate::cache::DEFAULT_QUERY_REGION;
use crate::core::{Entity, EntityHandle, EntityId, PersistError, Result};
use crate::session::Session;
use std::fmt;
use std::marker::PhantomData;

pub struct Query<E> {
    elements: Vec<EntityId>,
    filter: Filter,
    read_only: bool,
    cacheable: bool,
    cache_region: Option<String>,
    max_results: Option<usize>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Query<E> {
    pub(crate) fn new(elements: Vec<EntityId>, filter: Filter, read_only: bool) -> Self {
        Self {
            elements,
            filter,
            read_only,
            cacheable: false,
            cache_region: None,
            max_results: None,
            _entity: PhantomData,
        }
    }

    /// Whether instances this query loads start read-only. Defaults to the
    /// session's setting when the query was created. Instances the session
    /// already tracks keep their own flag.
    pub fn set_read_only(&mut self, read_only: bool) -> &mut Self {
        self.read_only = read_only;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_cacheable(&mut self, cacheable: bool) -> &mut Self {
        self.cacheable = cacheable;
        self
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn set_cache_region(&mut self, region: impl Into<String>) -> &mut Self {
        self.cache_region = Some(region.into());
        self
    }

    pub fn cache_region(&self) -> &str {
        self.cache_region.as_deref().unwrap_or(DEFAULT_QUERY_REGION)
    }

    pub fn set_max_results(&mut self, max_results: usize) -> &mut Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn max_results(&self) -> Option<usize> {
        self.max_results
    }

    pub(crate) fn elements(&self) -> &[EntityId] {
        &self.elements
    }

    pub(crate) fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Key of this query's results in its query cache region.
    pub(crate) fn cache_key(&self) -> String {
        let elements: Vec<String> = self.elements.iter().map(ToString::to_string).collect();
        format!(
            "{}[{}]|{}|{:?}",
            E::ENTITY_NAME,
            elements.join(","),
            self.filter.source(),
            self.max_results
        )
    }

    pub async fn list(&self, session: &mut Session) -> Result<Vec<EntityHandle<E>>> {
        session.run_query(self).await
    }

    /// The single result, `None` when nothing matched.
    pub async fn unique_result(&self, session: &mut Session) -> Result<Option<EntityHandle<E>>> {
        let mut results = self.list(session).await?;
        match results.len() {
            0 => Ok(None),
            1 => Ok(results.pop()),
            n => Err(PersistError::Query(format!(
                "query did not return a unique result: {}",
                n
            ))),
        }
    }
}

impl<E: Entity> fmt::Debug for Query<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("entity", &E::ENTITY_NAME)
            .field("elements", &self.elements.len())
            .field("filter", &self.filter.source())
            .field("read_only", &self.read_only)
            .field("cacheable", &self.cacheable)
            .field("cache_region", &self.cache_region())
            .field("max_results", &self.max_results)
            .finish()
    }
}
