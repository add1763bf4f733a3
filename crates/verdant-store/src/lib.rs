//! verdant-store: Diagnosis history persistence.
//!
//! The [`ResultStore`] gateway applies the save threshold and keeps
//! persistence failures away from the user-visible flow. Storage itself is
//! behind the [`BackingStore`] trait, with an in-memory implementation and,
//! on native targets, a SQLite one.

pub mod error;
pub mod gateway;
pub mod memory;
#[cfg(not(target_arch = "wasm32"))]
pub mod sqlite;

pub use error::StoreError;
pub use gateway::{
    BackingStore, DEFAULT_MIN_CONFIDENCE, ImageLocation, ResultStore, SaveOutcome, StoreConfig,
    StoreStatus, WriteOutcome,
};
pub use memory::{MEMORY_BLOB_PREFIX, MemoryStore};
#[cfg(not(target_arch = "wasm32"))]
pub use sqlite::{SQLITE_BLOB_PREFIX, SqliteStore};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod testing {
    use chrono::{Duration, Utc};
    use uuid::Uuid;
    use verdant_diagnosis::{DiagnosisRecord, StaticCatalog, assemble_with};
    use verdant_pipeline::ClassificationResult;

    /// A catalog-backed record created `minutes_ago`.
    pub fn record(identifier: &str, confidence: u8, image_url: &str, minutes_ago: i64) -> DiagnosisRecord {
        assemble_with(
            &ClassificationResult::new(identifier, confidence),
            image_url,
            &StaticCatalog::embedded().unwrap(),
            Uuid::new_v4(),
            Utc::now() - Duration::minutes(minutes_ago),
        )
    }
}
