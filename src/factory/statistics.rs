use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by a factory and its sessions.
#[derive(Debug, Default)]
pub(crate) struct StatisticsCounters {
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub flushes: AtomicU64,
    pub entity_loads: AtomicU64,
    pub entity_fetches: AtomicU64,
    pub entity_inserts: AtomicU64,
    pub entity_updates: AtomicU64,
    pub entity_deletes: AtomicU64,
    pub optimistic_failures: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_puts: AtomicU64,
    pub queries_executed: AtomicU64,
    pub query_cache_hits: AtomicU64,
    pub transactions_committed: AtomicU64,
    pub transactions_rolled_back: AtomicU64,
}

impl StatisticsCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Statistics {
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        Statistics {
            sessions_opened: get(&self.sessions_opened),
            sessions_closed: get(&self.sessions_closed),
            flushes: get(&self.flushes),
            entity_loads: get(&self.entity_loads),
            entity_fetches: get(&self.entity_fetches),
            entity_inserts: get(&self.entity_inserts),
            entity_updates: get(&self.entity_updates),
            entity_deletes: get(&self.entity_deletes),
            optimistic_failures: get(&self.optimistic_failures),
            cache_hits: get(&self.cache_hits),
            cache_misses: get(&self.cache_misses),
            cache_puts: get(&self.cache_puts),
            queries_executed: get(&self.queries_executed),
            query_cache_hits: get(&self.query_cache_hits),
            transactions_committed: get(&self.transactions_committed),
            transactions_rolled_back: get(&self.transactions_rolled_back),
        }
    }
}

/// Point-in-time factory statistics.
///
/// `entity_loads` counts instances that entered a persistence context from
/// the cache or the store; `entity_fetches` counts the store reads among them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub flushes: u64,
    pub entity_loads: u64,
    pub entity_fetches: u64,
    pub entity_inserts: u64,
    pub entity_updates: u64,
    pub entity_deletes: u64,
    pub optimistic_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_puts: u64,
    pub queries_executed: u64,
    pub query_cache_hits: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "sessions: {} opened, {} closed",
            self.sessions_opened, self.sessions_closed
        )?;
        writeln!(
            f,
            "entities: {} loaded ({} from store), {} inserted, {} updated, {} deleted",
            self.entity_loads,
            self.entity_fetches,
            self.entity_inserts,
            self.entity_updates,
            self.entity_deletes
        )?;
        writeln!(
            f,
            "cache: {} hits, {} misses, {} puts",
            self.cache_hits, self.cache_misses, self.cache_puts
        )?;
        writeln!(
            f,
            "queries: {} executed, {} served from cache",
            self.queries_executed, self.query_cache_hits
        )?;
        write!(
            f,
            "flushes: {}, transactions: {} committed, {} rolled back, optimistic failures: {}",
            self.flushes,
            self.transactions_committed,
            self.transactions_rolled_back,
            self.optimistic_failures
        )
    }
}
