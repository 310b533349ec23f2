use crate::core::PersistError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a session interacts with the second-level cache.
///
/// | mode    | read  | write |
/// |---------|-------|-------|
/// | Normal  | yes   | yes   |
/// | Ignore  | no    | no    |
/// | Get     | no    | yes   |
/// | Put     | yes   | no    |
/// | Refresh | yes   | no    |
///
/// Note that `Get` only writes and `Put` only reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CacheMode {
    #[default]
    Normal,
    Ignore,
    Get,
    Put,
    /// As `Put`, but ignores the minimal-puts optimization.
    Refresh,
}

impl CacheMode {
    const fn flags(self) -> (bool, bool) {
        match self {
            CacheMode::Normal => (true, true),
            CacheMode::Ignore => (false, false),
            CacheMode::Get => (false, true),
            CacheMode::Put => (true, false),
            CacheMode::Refresh => (true, false),
        }
    }

    /// Whether lookups may be answered from the cache.
    pub fn is_read_enabled(self) -> bool {
        self.flags().0
    }

    /// Whether loaded or flushed state may be written into the cache.
    pub fn is_write_enabled(self) -> bool {
        self.flags().1
    }

    /// Whether a put overwrites an entry the cache already holds.
    pub fn ignores_minimal_puts(self) -> bool {
        self == CacheMode::Refresh
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheMode::Normal => "NORMAL",
            CacheMode::Ignore => "IGNORE",
            CacheMode::Get => "GET",
            CacheMode::Put => "PUT",
            CacheMode::Refresh => "REFRESH",
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheMode {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => Ok(CacheMode::Normal),
            "IGNORE" => Ok(CacheMode::Ignore),
            "GET" => Ok(CacheMode::Get),
            "PUT" => Ok(CacheMode::Put),
            "REFRESH" => Ok(CacheMode::Refresh),
            other => Err(PersistError::Config(format!("Unknown cache mode '{}'", other))),
        }
    }
}
