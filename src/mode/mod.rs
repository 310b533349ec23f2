//! Policy enumerations consulted by sessions: lock strictness, flush timing,
//! cache interaction and replication conflict handling.

pub mod cache_mode;
pub mod flush;
pub mod lock;
pub mod replication;

pub use cache_mode::CacheMode;
pub use flush::FlushMode;
pub use lock::{LockMode, LockOptions, LockTimeout};
pub use replication::ReplicationMode;
