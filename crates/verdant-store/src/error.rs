//! Persistence errors.

use uuid::Uuid;

/// Anything that can go wrong inside a backing store.
///
/// The [`ResultStore`](crate::ResultStore) gateway logs and swallows these;
/// they only surface to callers that use a [`BackingStore`](crate::BackingStore)
/// directly.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// SQLite reported an error.
    #[cfg(not(target_arch = "wasm32"))]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A schema migration did not apply.
    #[error("migration failed at version {version}: {reason}")]
    MigrationFailed {
        /// Migration that failed.
        version: i64,
        /// Underlying error text.
        reason: String,
    },

    /// The store cannot be reached right now.
    #[error("backing store is unreachable")]
    Unreachable,

    /// Feedback was attached to a diagnosis the store does not hold.
    #[error("no diagnosis with id {0}")]
    NotFound(Uuid),

    /// A stored value could not be turned back into a record.
    #[error("corrupt stored value in {field}: {reason}")]
    Corrupt {
        /// Column or field holding the bad value.
        field: &'static str,
        /// Why it could not be read.
        reason: String,
    },
}

impl StoreError {
    pub(crate) fn corrupt(field: &'static str, reason: impl ToString) -> Self {
        Self::Corrupt {
            field,
            reason: reason.to_string(),
        }
    }
}
