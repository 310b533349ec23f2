use crate::core::PersistError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Lock strictness, ordered by rank rather than declaration order.
///
/// `UpgradeNowait` and `Write` share a rank, so neither is greater than the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LockMode {
    #[default]
    None,
    Read,
    UpgradeNowait,
    /// Taken implicitly when a row is inserted or updated; not requestable.
    Write,
    Optimistic,
    OptimisticForceIncrement,
    PessimisticRead,
    PessimisticWrite,
    PessimisticForceIncrement,
}

impl LockMode {
    pub const fn level(self) -> u8 {
        match self {
            LockMode::None => 0,
            LockMode::Read => 5,
            LockMode::Optimistic => 6,
            LockMode::OptimisticForceIncrement => 7,
            LockMode::UpgradeNowait => 10,
            LockMode::Write => 10,
            LockMode::PessimisticRead => 12,
            LockMode::PessimisticWrite => 13,
            LockMode::PessimisticForceIncrement => 17,
        }
    }

    pub fn greater_than(self, other: LockMode) -> bool {
        self.level() > other.level()
    }

    pub fn less_than(self, other: LockMode) -> bool {
        self.level() < other.level()
    }

    /// Modes that take a row lock in the backing store.
    pub fn is_pessimistic(self) -> bool {
        matches!(
            self,
            LockMode::UpgradeNowait
                | LockMode::PessimisticRead
                | LockMode::PessimisticWrite
                | LockMode::PessimisticForceIncrement
        )
    }

    pub fn is_optimistic(self) -> bool {
        matches!(
            self,
            LockMode::Optimistic | LockMode::OptimisticForceIncrement
        )
    }

    /// Whether the row lock excludes other holders entirely.
    pub fn is_exclusive(self) -> bool {
        self.is_pessimistic() && self != LockMode::PessimisticRead
    }

    /// The stricter of the two; on equal rank `self` is kept.
    pub fn max(self, other: LockMode) -> LockMode {
        if other.greater_than(self) { other } else { self }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::None => "NONE",
            LockMode::Read => "READ",
            LockMode::UpgradeNowait => "UPGRADE_NOWAIT",
            LockMode::Write => "WRITE",
            LockMode::Optimistic => "OPTIMISTIC",
            LockMode::OptimisticForceIncrement => "OPTIMISTIC_FORCE_INCREMENT",
            LockMode::PessimisticRead => "PESSIMISTIC_READ",
            LockMode::PessimisticWrite => "PESSIMISTIC_WRITE",
            LockMode::PessimisticForceIncrement => "PESSIMISTIC_FORCE_INCREMENT",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockMode {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mode = match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => LockMode::None,
            "READ" => LockMode::Read,
            "UPGRADE_NOWAIT" => LockMode::UpgradeNowait,
            "WRITE" => LockMode::Write,
            "OPTIMISTIC" => LockMode::Optimistic,
            "OPTIMISTIC_FORCE_INCREMENT" => LockMode::OptimisticForceIncrement,
            "PESSIMISTIC_READ" => LockMode::PessimisticRead,
            "PESSIMISTIC_WRITE" => LockMode::PessimisticWrite,
            "PESSIMISTIC_FORCE_INCREMENT" => LockMode::PessimisticForceIncrement,
            other => {
                return Err(PersistError::Config(format!("Unknown lock mode '{}'", other)));
            }
        };
        Ok(mode)
    }
}

/// How long a pessimistic lock request may wait for the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockTimeout {
    #[default]
    WaitForever,
    NoWait,
    Millis(u64),
}

impl LockTimeout {
    pub const PESSIMISTIC_NO_WAIT: i64 = 0;
    pub const PESSIMISTIC_WAIT_FOREVER: i64 = -1;

    /// `-1` (or any negative) waits forever, `0` never waits, `n > 0` waits `n` ms.
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            m if m < 0 => LockTimeout::WaitForever,
            0 => LockTimeout::NoWait,
            m => LockTimeout::Millis(m as u64),
        }
    }

    pub fn as_millis(self) -> i64 {
        match self {
            LockTimeout::WaitForever => Self::PESSIMISTIC_WAIT_FOREVER,
            LockTimeout::NoWait => Self::PESSIMISTIC_NO_WAIT,
            LockTimeout::Millis(m) => m as i64,
        }
    }

    pub fn as_duration(self) -> Option<Duration> {
        match self {
            LockTimeout::WaitForever => None,
            LockTimeout::NoWait => Some(Duration::ZERO),
            LockTimeout::Millis(m) => Some(Duration::from_millis(m)),
        }
    }
}

/// Lock mode plus acquisition parameters for load, refresh and lock requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockOptions {
    pub mode: LockMode,
    pub timeout: LockTimeout,
    /// Extend the lock to tracked cascade targets.
    pub scope: bool,
}

impl LockOptions {
    pub const NONE: LockOptions = LockOptions::of(LockMode::None);
    pub const READ: LockOptions = LockOptions::of(LockMode::Read);
    pub const UPGRADE: LockOptions = LockOptions::of(LockMode::PessimisticWrite);

    pub const fn of(mode: LockMode) -> Self {
        Self {
            mode,
            timeout: LockTimeout::WaitForever,
            scope: false,
        }
    }

    pub fn timeout(mut self, timeout: LockTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout_millis(mut self, millis: i64) -> Self {
        self.timeout = LockTimeout::from_millis(millis);
        self
    }

    pub fn scope(mut self, scope: bool) -> Self {
        self.scope = scope;
        self
    }

    /// `UpgradeNowait` never waits whatever timeout was asked for.
    pub fn effective_timeout(&self) -> LockTimeout {
        if self.mode == LockMode::UpgradeNowait {
            LockTimeout::NoWait
        } else {
            self.timeout
        }
    }
}

impl From<LockMode> for LockOptions {
    fn from(mode: LockMode) -> Self {
        LockOptions::of(mode)
    }
}
