//! Result store gateway.
//!
//! [`ResultStore`] wraps an optional [`BackingStore`] and turns every
//! persistence problem into a logged, success-shaped outcome so that a
//! diagnosis already on screen is never blocked by history bookkeeping.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use verdant_diagnosis::{DiagnosisRecord, FeedbackAnnotation};

use crate::error::StoreError;

/// Records below this confidence are shown but not kept in history.
pub const DEFAULT_MIN_CONFIDENCE: u8 = 75;

/// Gateway policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Minimum `confidence_score` a record needs to be saved.
    pub min_confidence: u8,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

/// Reachability reported by a backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreStatus {
    /// Accepting reads and writes.
    Ready,
    /// Offline or misconfigured.
    Unreachable,
}

/// Relational rows plus a blob bucket for images.
///
/// Blob keys are the part of a blob URL after
/// [`blob_url_prefix`](Self::blob_url_prefix).
#[allow(async_fn_in_trait)]
pub trait BackingStore {
    /// Whether the store can currently be used.
    async fn status(&self) -> StoreStatus;

    /// Insert a new record.
    async fn insert(&self, record: &DiagnosisRecord) -> Result<(), StoreError>;

    /// Every record, newest first, with feedback attached.
    async fn list(&self) -> Result<Vec<DiagnosisRecord>, StoreError>;

    /// One record by id.
    async fn get(&self, id: Uuid) -> Result<Option<DiagnosisRecord>, StoreError>;

    /// Remove a record and its feedback. Returns `false` when absent.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Insert or replace the feedback of a stored record.
    async fn upsert_feedback(&self, feedback: &FeedbackAnnotation) -> Result<(), StoreError>;

    /// Store image bytes and return the URL they can be fetched from.
    async fn put_blob(&self, bytes: &[u8], mime_type: &str) -> Result<String, StoreError>;

    /// Remove a stored blob by key. Missing keys are not an error.
    async fn delete_blob(&self, key: &str) -> Result<(), StoreError>;

    /// URL prefix of blobs returned by [`put_blob`](Self::put_blob).
    fn blob_url_prefix(&self) -> &str;
}

/// Where a record's `image_url` points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLocation<'a> {
    /// A blob this store owns, identified by key.
    Stored(&'a str),
    /// A transient local preview (`blob:` or `data:` URL).
    Preview,
    /// Hosted elsewhere, e.g. a placeholder or demo picture.
    External,
}

impl<'a> ImageLocation<'a> {
    /// Classify `url` against a store's blob prefix.
    #[must_use]
    pub fn classify(url: &'a str, prefix: &str) -> Self {
        if url.starts_with("blob:") || url.starts_with("data:") {
            return Self::Preview;
        }
        match url.strip_prefix(prefix) {
            Some(key) if !prefix.is_empty() && !key.is_empty() => Self::Stored(key),
            _ => Self::External,
        }
    }
}

/// What [`ResultStore::save`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveOutcome {
    /// The record is in history.
    Saved,
    /// Confidence under the threshold; not kept.
    BelowThreshold,
    /// No store configured or reachable.
    Skipped,
    /// The store rejected the write. The error has been logged.
    Failed(String),
}

impl SaveOutcome {
    /// `true` only for [`Saved`](Self::Saved).
    #[must_use]
    pub const fn is_saved(&self) -> bool {
        matches!(self, Self::Saved)
    }
}

/// What a delete or feedback write did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOutcome {
    /// The change was applied.
    Written,
    /// The target record does not exist.
    NotFound,
    /// No store configured or reachable.
    Skipped,
    /// The store rejected the write. The error has been logged.
    Failed(String),
}

/// Persistence gateway with threshold policy and offline tolerance.
#[derive(Debug)]
pub struct ResultStore<S> {
    store: Option<S>,
    config: StoreConfig,
}

impl<S: BackingStore> ResultStore<S> {
    /// Gateway over a backing store.
    pub const fn connected(store: S, config: StoreConfig) -> Self {
        Self {
            store: Some(store),
            config,
        }
    }

    /// Gateway with no backing store: reads are empty and writes are
    /// skipped.
    pub const fn unconfigured(config: StoreConfig) -> Self {
        Self {
            store: None,
            config,
        }
    }

    /// The active policy.
    pub const fn config(&self) -> StoreConfig {
        self.config
    }

    /// The backing store, if configured.
    pub const fn backing(&self) -> Option<&S> {
        self.store.as_ref()
    }

    /// Whether a record with this confidence passes the save threshold.
    pub const fn meets_threshold(&self, confidence: u8) -> bool {
        confidence >= self.config.min_confidence
    }

    async fn reachable(&self) -> Option<&S> {
        let Some(store) = self.store.as_ref() else {
            debug!("no backing store configured");
            return None;
        };
        match store.status().await {
            StoreStatus::Ready => Some(store),
            StoreStatus::Unreachable => {
                warn!("backing store unreachable, skipping");
                None
            }
        }
    }

    /// Upload image bytes, returning their URL, or `None` when the store
    /// is unavailable or the upload fails.
    pub async fn store_image(&self, bytes: &[u8], mime_type: &str) -> Option<String> {
        let store = self.reachable().await?;
        match store.put_blob(bytes, mime_type).await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(error = %e, "image upload failed");
                None
            }
        }
    }

    /// Remove an uploaded image that no saved record refers to.
    ///
    /// Only blobs this store owns are deleted. Returns `true` when a blob
    /// was removed.
    pub async fn discard_image(&self, url: &str) -> bool {
        let Some(store) = self.reachable().await else {
            return false;
        };
        let ImageLocation::Stored(key) = ImageLocation::classify(url, store.blob_url_prefix()) else {
            debug!(url, "image not owned by store, keeping it");
            return false;
        };
        match store.delete_blob(key).await {
            Ok(()) => {
                debug!(key, "orphaned image discarded");
                true
            }
            Err(e) => {
                warn!(key, error = %e, "failed to discard image blob");
                false
            }
        }
    }

    /// Persist `record` if it meets the confidence threshold.
    pub async fn save(&self, record: &DiagnosisRecord) -> SaveOutcome {
        if !self.meets_threshold(record.confidence_score) {
            info!(
                id = %record.id,
                confidence = record.confidence_score,
                threshold = self.config.min_confidence,
                "confidence below threshold, not saving",
            );
            return SaveOutcome::BelowThreshold;
        }
        let Some(store) = self.reachable().await else {
            return SaveOutcome::Skipped;
        };
        match store.insert(record).await {
            Ok(()) => {
                info!(id = %record.id, disease = %record.disease_identifier, "diagnosis saved");
                SaveOutcome::Saved
            }
            Err(e) => {
                error!(id = %record.id, error = %e, "failed to save diagnosis");
                SaveOutcome::Failed(e.to_string())
            }
        }
    }

    /// History, newest first. Empty when the store is unavailable.
    pub async fn list(&self) -> Vec<DiagnosisRecord> {
        let Some(store) = self.reachable().await else {
            return Vec::new();
        };
        store.list().await.unwrap_or_else(|e| {
            error!(error = %e, "failed to list diagnoses");
            Vec::new()
        })
    }

    /// One record, or `None` when absent or the store is unavailable.
    pub async fn get(&self, id: Uuid) -> Option<DiagnosisRecord> {
        let store = self.reachable().await?;
        store.get(id).await.unwrap_or_else(|e| {
            error!(%id, error = %e, "failed to fetch diagnosis");
            None
        })
    }

    /// Remove a record and, when this store owns it, its image blob.
    ///
    /// Preview and externally hosted image URLs are left alone. A blob
    /// that fails to delete is logged; the record deletion still counts.
    pub async fn delete(&self, id: Uuid) -> WriteOutcome {
        let Some(store) = self.reachable().await else {
            return WriteOutcome::Skipped;
        };
        let image_url = match store.get(id).await {
            Ok(Some(record)) => Some(record.image_url),
            Ok(None) => None,
            Err(e) => {
                error!(%id, error = %e, "failed to fetch diagnosis before delete");
                return WriteOutcome::Failed(e.to_string());
            }
        };
        match store.delete(id).await {
            Ok(true) => {}
            Ok(false) => return WriteOutcome::NotFound,
            Err(e) => {
                error!(%id, error = %e, "failed to delete diagnosis");
                return WriteOutcome::Failed(e.to_string());
            }
        }
        if let Some(url) = image_url {
            match ImageLocation::classify(&url, store.blob_url_prefix()) {
                ImageLocation::Stored(key) => {
                    if let Err(e) = store.delete_blob(key).await {
                        warn!(%id, key, error = %e, "failed to delete image blob");
                    }
                }
                location => {
                    debug!(%id, ?location, "image not owned by store, keeping it");
                }
            }
        }
        info!(%id, "diagnosis deleted");
        WriteOutcome::Written
    }

    /// Attach feedback to a stored record. A later call replaces an
    /// earlier one.
    pub async fn attach_feedback(&self, feedback: &FeedbackAnnotation) -> WriteOutcome {
        let Some(store) = self.reachable().await else {
            return WriteOutcome::Skipped;
        };
        match store.upsert_feedback(feedback).await {
            Ok(()) => WriteOutcome::Written,
            Err(StoreError::NotFound(_)) => WriteOutcome::NotFound,
            Err(e) => {
                error!(id = %feedback.diagnosis_id, error = %e, "failed to save feedback");
                WriteOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::testing::record;

    fn gateway() -> ResultStore<MemoryStore> {
        ResultStore::connected(MemoryStore::new(), StoreConfig::default())
    }

    #[test]
    fn image_locations() {
        let prefix = "memory://images/";
        assert_eq!(
            ImageLocation::classify("memory://images/abc", prefix),
            ImageLocation::Stored("abc")
        );
        assert_eq!(
            ImageLocation::classify("blob:http://localhost/1234", prefix),
            ImageLocation::Preview
        );
        assert_eq!(
            ImageLocation::classify("data:image/png;base64,AAAA", prefix),
            ImageLocation::Preview
        );
        assert_eq!(
            ImageLocation::classify("https://images.example/demo.jpg", prefix),
            ImageLocation::External
        );
        assert_eq!(ImageLocation::classify("memory://images/", prefix), ImageLocation::External);
    }

    #[tokio::test]
    async fn below_threshold_is_not_listed_but_stays_usable() {
        let store = gateway();
        let record = record("early_blight", 60, "https://images.example/demo.jpg", 0);

        assert_eq!(store.save(&record).await, SaveOutcome::BelowThreshold);
        assert!(store.list().await.is_empty());
        assert!(store.get(record.id).await.is_none());
        // The caller still owns a complete record.
        assert_eq!(record.confidence_score, 60);
        assert_eq!(record.disease_name.as_deref(), Some("Early Blight"));
    }

    #[tokio::test]
    async fn threshold_is_inclusive() {
        let store = gateway();
        let record = record("late_blight", 75, "https://images.example/demo.jpg", 0);
        assert_eq!(store.save(&record).await, SaveOutcome::Saved);
        assert_eq!(store.get(record.id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let store = gateway();
        let older = record("leaf_rust", 90, "https://images.example/a.jpg", 30);
        let newer = record("healthy", 95, "https://images.example/b.jpg", 5);
        store.save(&older).await;
        store.save(&newer).await;
        let ids: Vec<_> = store.list().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[tokio::test]
    async fn unconfigured_store_is_a_quiet_no_op() {
        let store: ResultStore<MemoryStore> = ResultStore::unconfigured(StoreConfig::default());
        let record = record("leaf_rust", 90, "https://images.example/a.jpg", 0);
        assert_eq!(store.save(&record).await, SaveOutcome::Skipped);
        assert!(store.list().await.is_empty());
        assert!(store.get(record.id).await.is_none());
        assert_eq!(store.delete(record.id).await, WriteOutcome::Skipped);
        let feedback = FeedbackAnnotation::new(record.id, true, None);
        assert_eq!(store.attach_feedback(&feedback).await, WriteOutcome::Skipped);
        assert!(store.store_image(b"png", "image/png").await.is_none());
    }

    #[tokio::test]
    async fn unreachable_store_is_a_quiet_no_op() {
        let store = gateway();
        let record = record("leaf_rust", 90, "https://images.example/a.jpg", 0);
        assert_eq!(store.save(&record).await, SaveOutcome::Saved);

        store.backing().unwrap().set_status(StoreStatus::Unreachable);
        assert_eq!(store.save(&record).await, SaveOutcome::Skipped);
        assert!(store.list().await.is_empty());
        assert!(store.get(record.id).await.is_none());
        assert_eq!(store.delete(record.id).await, WriteOutcome::Skipped);

        store.backing().unwrap().set_status(StoreStatus::Ready);
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_owned_blob() {
        let store = gateway();
        let url = store.store_image(b"jpeg bytes", "image/jpeg").await.unwrap();
        let record = record("powdery_mildew", 88, &url, 0);
        store.save(&record).await;
        assert_eq!(store.backing().unwrap().blob_count(), 1);

        assert_eq!(store.delete(record.id).await, WriteOutcome::Written);
        assert_eq!(store.backing().unwrap().blob_count(), 0);
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn delete_never_targets_preview_or_external_images() {
        let store = gateway();
        let backing = store.backing().unwrap();
        store.store_image(b"kept", "image/png").await.unwrap();

        for url in [
            "blob:http://localhost/preview",
            "data:image/png;base64,AAAA",
            "https://images.example/demo.jpg",
        ] {
            let record = record("leaf_rust", 90, url, 0);
            store.save(&record).await;
            assert_eq!(store.delete(record.id).await, WriteOutcome::Written);
        }
        assert_eq!(backing.blob_count(), 1);
        assert!(backing.deleted_blob_keys().is_empty());
    }

    #[tokio::test]
    async fn discard_removes_only_owned_images() {
        let store = gateway();
        let backing = store.backing().unwrap();
        let url = store.store_image(b"orphan", "image/png").await.unwrap();

        assert!(!store.discard_image("blob:http://localhost/preview").await);
        assert!(!store.discard_image("https://images.example/demo.jpg").await);
        assert_eq!(backing.blob_count(), 1);

        assert!(store.discard_image(&url).await);
        assert_eq!(backing.blob_count(), 0);
    }

    #[tokio::test]
    async fn deleting_a_missing_record_reports_not_found() {
        let store = gateway();
        assert_eq!(store.delete(Uuid::new_v4()).await, WriteOutcome::NotFound);
    }

    #[tokio::test]
    async fn feedback_last_write_wins() {
        let store = gateway();
        let record = record("bacterial_spot", 80, "https://images.example/a.jpg", 0);
        store.save(&record).await;

        let first = FeedbackAnnotation::new(record.id, true, Some("spot on".into()));
        let second = FeedbackAnnotation::new(record.id, false, None);
        assert_eq!(store.attach_feedback(&first).await, WriteOutcome::Written);
        assert_eq!(store.attach_feedback(&second).await, WriteOutcome::Written);

        let stored = store.get(record.id).await.unwrap();
        assert_eq!(stored.feedback, Some(second));
    }

    #[tokio::test]
    async fn feedback_for_unknown_record_is_not_found() {
        let store = gateway();
        let feedback = FeedbackAnnotation::new(Uuid::new_v4(), true, None);
        assert_eq!(store.attach_feedback(&feedback).await, WriteOutcome::NotFound);
    }
}
