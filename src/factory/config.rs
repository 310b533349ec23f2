use crate::connection::ConnectionConfig;
use crate::mode::{CacheMode, FlushMode};

/// Factory-wide defaults applied to every session it opens.
#[derive(Debug, Clone)]
pub struct SessionFactoryConfig {
    /// Flush mode of new sessions
    pub flush_mode: FlushMode,

    /// Cache mode of new sessions
    pub cache_mode: CacheMode,

    /// Whether entities loaded by new sessions start read-only
    pub default_read_only: bool,

    /// Consult and populate the entity, natural-id and collection regions
    pub second_level_cache: bool,

    /// Allow cacheable queries to use the query regions
    pub query_cache: bool,

    /// Skip cache puts that would not change a cached entry
    pub use_minimal_puts: bool,

    /// Entries per cache region before LRU eviction
    pub cache_region_capacity: usize,

    /// Pool settings of the default connection provider
    pub connection: ConnectionConfig,
}

impl SessionFactoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    pub fn default_read_only(mut self, read_only: bool) -> Self {
        self.default_read_only = read_only;
        self
    }

    pub fn second_level_cache(mut self, enabled: bool) -> Self {
        self.second_level_cache = enabled;
        self
    }

    pub fn query_cache(mut self, enabled: bool) -> Self {
        self.query_cache = enabled;
        self
    }

    pub fn use_minimal_puts(mut self, enabled: bool) -> Self {
        self.use_minimal_puts = enabled;
        self
    }

    pub fn cache_region_capacity(mut self, capacity: usize) -> Self {
        self.cache_region_capacity = capacity;
        self
    }

    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.cache_region_capacity == 0 {
            return Err("cache_region_capacity must be > 0".to_string());
        }

        if self.query_cache && !self.second_level_cache {
            return Err("query_cache requires second_level_cache".to_string());
        }

        self.connection.validate()
    }
}

impl Default for SessionFactoryConfig {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::Auto,
            cache_mode: CacheMode::Normal,
            default_read_only: false,
            second_level_cache: true,
            query_cache: true,
            use_minimal_puts: false,
            cache_region_capacity: 1024,
            connection: ConnectionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionFactoryConfig::default();
        assert_eq!(config.flush_mode, FlushMode::Auto);
        assert_eq!(config.cache_mode, CacheMode::Normal);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inconsistent_settings() {
        assert!(
            SessionFactoryConfig::new()
                .cache_region_capacity(0)
                .validate()
                .is_err()
        );
        assert!(
            SessionFactoryConfig::new()
                .second_level_cache(false)
                .validate()
                .is_err()
        );
        assert!(
            SessionFactoryConfig::new()
                .second_level_cache(false)
                .query_cache(false)
                .validate()
                .is_ok()
        );
        assert!(
            SessionFactoryConfig::new()
                .connection(ConnectionConfig::new("db").max_connections(0))
                .validate()
                .is_err()
        );
    }
}
