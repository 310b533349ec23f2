use crate::core::{PersistError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Conflict strategy for `Session::replicate` when the row already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicationMode {
    /// Always insert; an existing row fails the flush.
    Exception,
    /// Keep the existing row.
    Ignore,
    /// Replace the existing row.
    Overwrite,
    /// Replace the existing row unless its version is newer.
    LatestVersion,
}

impl ReplicationMode {
    /// Decides whether replicated state replaces the current row.
    ///
    /// `Exception` never consults this: replication in that mode inserts
    /// unconditionally. Reaching it is a bug in the caller and yields
    /// [`PersistError::InternalInvariant`], which must not be retried.
    pub fn should_overwrite_current_version<V, F>(
        self,
        current_version: &V,
        new_version: &V,
        comparator: F,
    ) -> Result<bool>
    where
        V: ?Sized,
        F: FnOnce(&V, &V) -> Ordering,
    {
        match self {
            ReplicationMode::Exception => Err(PersistError::InternalInvariant(
                "ReplicationMode::Exception must not be asked to compare versions".into(),
            )),
            ReplicationMode::Ignore => Ok(false),
            ReplicationMode::Overwrite => Ok(true),
            ReplicationMode::LatestVersion => {
                Ok(comparator(current_version, new_version) != Ordering::Greater)
            }
        }
    }
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicationMode::Exception => "EXCEPTION",
            ReplicationMode::Ignore => "IGNORE",
            ReplicationMode::Overwrite => "OVERWRITE",
            ReplicationMode::LatestVersion => "LATEST_VERSION",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_is_an_invariant_violation() {
        let result = ReplicationMode::Exception.should_overwrite_current_version(&1, &2, i64::cmp);
        assert!(matches!(result, Err(PersistError::InternalInvariant(_))));
    }

    #[test]
    fn test_fixed_answers() {
        for (current, new) in [(1, 2), (2, 1), (3, 3)] {
            assert!(
                !ReplicationMode::Ignore
                    .should_overwrite_current_version(&current, &new, i64::cmp)
                    .unwrap()
            );
            assert!(
                ReplicationMode::Overwrite
                    .should_overwrite_current_version(&current, &new, i64::cmp)
                    .unwrap()
            );
        }
    }

    #[test]
    fn test_latest_version_follows_comparator() {
        for (current, new) in [(1i64, 2i64), (2, 1), (3, 3)] {
            let expected = current.cmp(&new) != Ordering::Greater;
            let actual = ReplicationMode::LatestVersion
                .should_overwrite_current_version(&current, &new, i64::cmp)
                .unwrap();
            assert_eq!(actual, expected, "current={current} new={new}");
        }
    }

    #[test]
    fn test_latest_version_with_reversed_comparator() {
        let newer_wins = ReplicationMode::LatestVersion
            .should_overwrite_current_version("b", "a", |a: &str, b: &str| b.cmp(a))
            .unwrap();
        assert!(newer_wins);
    }
}
