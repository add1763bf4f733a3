//! In-process backing store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use uuid::Uuid;
use verdant_diagnosis::{DiagnosisRecord, FeedbackAnnotation};

use crate::error::StoreError;
use crate::gateway::{BackingStore, StoreStatus};

/// URL prefix of blobs held by a [`MemoryStore`].
pub const MEMORY_BLOB_PREFIX: &str = "memory://images/";

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<Uuid, DiagnosisRecord>,
    blobs: HashMap<String, (String, Vec<u8>)>,
    deleted_blobs: Vec<String>,
}

/// A [`BackingStore`] kept in memory.
///
/// The reported status can be switched to simulate an offline store.
#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    status: Mutex<StoreStatus>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// An empty, reachable store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Mutex::default(),
            status: Mutex::new(StoreStatus::Ready),
        }
    }

    /// Change the status reported to the gateway.
    pub fn set_status(&self, status: StoreStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Number of stored blobs.
    pub fn blob_count(&self) -> usize {
        self.tables().blobs.len()
    }

    /// Keys passed to successful `delete_blob` calls, in order.
    pub fn deleted_blob_keys(&self) -> Vec<String> {
        self.tables().deleted_blobs.clone()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BackingStore for MemoryStore {
    async fn status(&self) -> StoreStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn insert(&self, record: &DiagnosisRecord) -> Result<(), StoreError> {
        self.tables().records.insert(record.id, record.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DiagnosisRecord>, StoreError> {
        let mut records: Vec<_> = self.tables().records.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DiagnosisRecord>, StoreError> {
        Ok(self.tables().records.get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.tables().records.remove(&id).is_some())
    }

    async fn upsert_feedback(&self, feedback: &FeedbackAnnotation) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let record = tables
            .records
            .get_mut(&feedback.diagnosis_id)
            .ok_or(StoreError::NotFound(feedback.diagnosis_id))?;
        record.feedback = Some(feedback.clone());
        Ok(())
    }

    async fn put_blob(&self, bytes: &[u8], mime_type: &str) -> Result<String, StoreError> {
        let key = Uuid::new_v4().to_string();
        self.tables()
            .blobs
            .insert(key.clone(), (mime_type.to_owned(), bytes.to_vec()));
        Ok(format!("{MEMORY_BLOB_PREFIX}{key}"))
    }

    async fn delete_blob(&self, key: &str) -> Result<(), StoreError> {
        let mut tables = self.tables();
        tables.blobs.remove(key);
        tables.deleted_blobs.push(key.to_owned());
        Ok(())
    }

    fn blob_url_prefix(&self) -> &str {
        MEMORY_BLOB_PREFIX
    }
}
