use crate::core::PersistError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// When pending in-memory changes are synchronized with the store.
///
/// ```text
/// Never = Manual (0) < Commit (5) < Auto (10) < Always (20)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FlushMode {
    /// Legacy spelling of `Manual`; shares its rank.
    Never,
    /// Only an explicit `flush()` synchronizes.
    Manual,
    /// Synchronize when the transaction commits.
    Commit,
    /// Synchronize on commit and before queries that could see pending changes.
    #[default]
    Auto,
    /// Synchronize on commit and before every query.
    Always,
}

impl FlushMode {
    pub const fn level(self) -> u8 {
        match self {
            FlushMode::Never | FlushMode::Manual => 0,
            FlushMode::Commit => 5,
            FlushMode::Auto => 10,
            FlushMode::Always => 20,
        }
    }

    pub fn less_than(self, other: FlushMode) -> bool {
        self.level() < other.level()
    }

    pub fn greater_than(self, other: FlushMode) -> bool {
        self.level() > other.level()
    }

    pub fn is_manual(mode: FlushMode) -> bool {
        mode.level() == FlushMode::Manual.level()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlushMode::Never => "NEVER",
            FlushMode::Manual => "MANUAL",
            FlushMode::Commit => "COMMIT",
            FlushMode::Auto => "AUTO",
            FlushMode::Always => "ALWAYS",
        }
    }
}

impl fmt::Display for FlushMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlushMode {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEVER" => Ok(FlushMode::Never),
            "MANUAL" => Ok(FlushMode::Manual),
            "COMMIT" => Ok(FlushMode::Commit),
            "AUTO" => Ok(FlushMode::Auto),
            "ALWAYS" => Ok(FlushMode::Always),
            other => Err(PersistError::Config(format!("Unknown flush mode '{}'", other))),
        }
    }
}
