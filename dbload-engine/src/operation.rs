//! The closed set of operations a worker can issue against the backend.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Base date for all synthetic `created_at` values, expressed in days relative to it.
pub const BASE_DATE: &str = "2020-01-01";

/// The kind of an operation, used for selection and for grouping metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Point read by primary key.
    PointReadPrimary,
    /// Point read by a secondary, indexed column.
    PointReadSecondary,
    /// Bounded range read over the creation date.
    RangeRead,
    /// Insert of a new row.
    Insert,
    /// Update of an existing row by primary key.
    Update,
}

impl OperationKind {
    /// All operation kinds in their canonical order.
    pub const ALL: [OperationKind; 5] = [
        OperationKind::PointReadPrimary,
        OperationKind::PointReadSecondary,
        OperationKind::RangeRead,
        OperationKind::Insert,
        OperationKind::Update,
    ];

    /// The stable `snake_case` name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::PointReadPrimary => "point_read_primary",
            OperationKind::PointReadSecondary => "point_read_secondary",
            OperationKind::RangeRead => "range_read",
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
        }
    }

    /// Position of this kind within [`OperationKind::ALL`].
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully parameterized operation, ready to be executed by a
/// [`BackendClient`](crate::client::BackendClient).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Read the user with the given primary key.
    PointReadPrimary {
        /// Primary key of the user.
        user_id: u64,
    },
    /// Read the user through its email address.
    PointReadSecondary {
        /// Primary key of the user whose email is looked up.
        user_id: u64,
    },
    /// Read up to `limit` users created within `[start_day, end_day]`.
    RangeRead {
        /// First day of the range, relative to [`BASE_DATE`].
        start_day: u32,
        /// Last day of the range (inclusive), relative to [`BASE_DATE`].
        end_day: u32,
    },
    /// Insert a new synthetic user.
    Insert {
        /// Index of the worker issuing the insert.
        worker: usize,
        /// Per-worker sequence number, unique within a run.
        seq: u64,
        /// Creation date of the user, relative to [`BASE_DATE`].
        created_day: u32,
        /// Value stored in the user's metadata.
        score: u32,
    },
    /// Update the metadata of an existing user.
    Update {
        /// Primary key of the user.
        user_id: u64,
        /// New value stored in the user's metadata.
        score: u32,
    },
}

impl Operation {
    /// The kind of this operation.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::PointReadPrimary { .. } => OperationKind::PointReadPrimary,
            Operation::PointReadSecondary { .. } => OperationKind::PointReadSecondary,
            Operation::RangeRead { .. } => OperationKind::RangeRead,
            Operation::Insert { .. } => OperationKind::Insert,
            Operation::Update { .. } => OperationKind::Update,
        }
    }

    /// The deterministic cache key for read operations.
    ///
    /// Writes are never served from the cache and return `None`.
    pub fn cache_key(&self) -> Option<String> {
        match self {
            Operation::PointReadPrimary { user_id } => Some(format!("user:id:{user_id}")),
            Operation::PointReadSecondary { user_id } => {
                Some(format!("user:email:{}", user_email(*user_id)))
            }
            Operation::RangeRead { start_day, end_day } => {
                Some(format!("users:range:{start_day}:{end_day}"))
            }
            Operation::Insert { .. } | Operation::Update { .. } => None,
        }
    }

    /// Cache keys that hold a copy of the row modified by this operation.
    ///
    /// Range entries are not tracked and only expire through their TTL.
    pub fn affected_cache_keys(&self) -> Vec<String> {
        match self {
            Operation::Update { user_id, .. } => vec![
                format!("user:id:{user_id}"),
                format!("user:email:{}", user_email(*user_id)),
            ],
            _ => Vec::new(),
        }
    }
}

/// The email address of a pre-loaded user.
pub fn user_email(user_id: u64) -> String {
    format!("user{user_id}@example.com")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_keys_follow_entity_format() {
        assert_eq!(
            Operation::PointReadPrimary { user_id: 7 }.cache_key().as_deref(),
            Some("user:id:7")
        );
        assert_eq!(
            Operation::PointReadSecondary { user_id: 7 }
                .cache_key()
                .as_deref(),
            Some("user:email:user7@example.com")
        );
        assert_eq!(
            Operation::RangeRead {
                start_day: 10,
                end_day: 12
            }
            .cache_key()
            .as_deref(),
            Some("users:range:10:12")
        );
        assert_eq!(Operation::Update { user_id: 7, score: 1 }.cache_key(), None);
    }

    #[test]
    fn updates_invalidate_both_point_keys() {
        let keys = Operation::Update { user_id: 3, score: 9 }.affected_cache_keys();
        assert_eq!(keys, ["user:id:3", "user:email:user3@example.com"]);

        let insert = Operation::Insert {
            worker: 0,
            seq: 0,
            created_day: 0,
            score: 0,
        };
        assert!(insert.affected_cache_keys().is_empty());
    }

    #[test]
    fn kind_indices_match_canonical_order() {
        for (index, kind) in OperationKind::ALL.into_iter().enumerate() {
            assert_eq!(kind.index(), index);
        }
    }
}
