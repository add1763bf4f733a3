//! SQLite backing store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{info, warn};
use uuid::Uuid;
use verdant_diagnosis::{DiagnosisRecord, FeedbackAnnotation};

use crate::error::StoreError;
use crate::gateway::{BackingStore, StoreStatus};

/// URL prefix of blobs held by a [`SqliteStore`].
pub const SQLITE_BLOB_PREFIX: &str = "sqlite://images/";

const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("../migrations/001_initial.sql"))];

const SELECT_RECORDS: &str = "SELECT d.id, d.disease_identifier, d.is_healthy, d.disease_name,
        d.confidence_score, d.plant_type, d.image_url, d.created_at,
        dd.description, dd.symptoms, dd.treatment_options, dd.product_recommendations,
        f.helpful, f.comment, f.updated_at
     FROM diagnoses d
     JOIN diagnosis_details dd ON dd.diagnosis_id = d.id
     LEFT JOIN feedback f ON f.diagnosis_id = d.id";

/// Diagnosis history in a local SQLite database.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the file cannot be opened and
    /// [`StoreError::MigrationFailed`] if the schema cannot be brought up
    /// to date.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::prepare(Connection::open(path)?)
    }

    /// An in-memory database, mostly for tests.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self, StoreError> {
        configure_pragmas(&conn)?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Bytes and MIME type of a stored blob.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the query fails.
    pub fn blob(&self, key: &str) -> Result<Option<(String, Vec<u8>)>, StoreError> {
        let conn = self.conn();
        let blob = conn
            .query_row(
                "SELECT mime_type, bytes FROM images WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(blob)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn configure_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode=DELETE;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

/// Apply every migration newer than the recorded schema version.
fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    let current = current_version(conn);
    for &(version, sql) in MIGRATIONS {
        if version > current {
            info!("Running migration v{version}");
            conn.execute_batch(sql)
                .map_err(|e| StoreError::MigrationFailed {
                    version,
                    reason: e.to_string(),
                })?;
        }
    }
    Ok(())
}

/// Recorded schema version, 0 for a fresh database.
fn current_version(conn: &Connection) -> i64 {
    conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
        row.get::<_, i64>(0)
    })
    .unwrap_or(0)
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(field: &'static str, s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::corrupt(field, e))
}

fn to_json<T: serde::Serialize>(field: &'static str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::corrupt(field, e))
}

fn from_json<T: serde::de::DeserializeOwned>(field: &'static str, s: &str) -> Result<T, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::corrupt(field, e))
}

/// Raw column values of one joined record row.
struct RecordRow {
    id: String,
    disease_identifier: String,
    is_healthy: bool,
    disease_name: Option<String>,
    confidence_score: u8,
    plant_type: String,
    image_url: String,
    created_at: String,
    description: String,
    symptoms: String,
    treatment_options: String,
    product_recommendations: String,
    helpful: Option<bool>,
    comment: Option<String>,
    feedback_updated_at: Option<String>,
}

impl RecordRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            disease_identifier: row.get(1)?,
            is_healthy: row.get(2)?,
            disease_name: row.get(3)?,
            confidence_score: row.get(4)?,
            plant_type: row.get(5)?,
            image_url: row.get(6)?,
            created_at: row.get(7)?,
            description: row.get(8)?,
            symptoms: row.get(9)?,
            treatment_options: row.get(10)?,
            product_recommendations: row.get(11)?,
            helpful: row.get(12)?,
            comment: row.get(13)?,
            feedback_updated_at: row.get(14)?,
        })
    }

    fn into_record(self) -> Result<DiagnosisRecord, StoreError> {
        let id = Uuid::parse_str(&self.id).map_err(|e| StoreError::corrupt("diagnoses.id", e))?;
        let feedback = match (self.helpful, self.feedback_updated_at) {
            (Some(helpful), Some(updated_at)) => Some(FeedbackAnnotation {
                diagnosis_id: id,
                helpful,
                comment: self.comment,
                updated_at: parse_timestamp("feedback.updated_at", &updated_at)?,
            }),
            _ => None,
        };
        Ok(DiagnosisRecord {
            id,
            disease_identifier: self.disease_identifier,
            is_healthy: self.is_healthy,
            disease_name: self.disease_name,
            confidence_score: self.confidence_score,
            description: self.description,
            symptoms: from_json("diagnosis_details.symptoms", &self.symptoms)?,
            treatment_options: from_json(
                "diagnosis_details.treatment_options",
                &self.treatment_options,
            )?,
            product_recommendations: from_json(
                "diagnosis_details.product_recommendations",
                &self.product_recommendations,
            )?,
            plant_type: self.plant_type,
            image_url: self.image_url,
            created_at: parse_timestamp("diagnoses.created_at", &self.created_at)?,
            feedback,
        })
    }
}

impl BackingStore for SqliteStore {
    async fn status(&self) -> StoreStatus {
        match self.conn().query_row("SELECT 1", [], |_| Ok(())) {
            Ok(()) => StoreStatus::Ready,
            Err(e) => {
                warn!(error = %e, "SQLite store not responding");
                StoreStatus::Unreachable
            }
        }
    }

    async fn insert(&self, record: &DiagnosisRecord) -> Result<(), StoreError> {
        let symptoms = to_json("symptoms", &record.symptoms)?;
        let treatments = to_json("treatment_options", &record.treatment_options)?;
        let products = to_json("product_recommendations", &record.product_recommendations)?;
        let id = record.id.to_string();

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO diagnoses (id, disease_identifier, is_healthy, disease_name,
             confidence_score, plant_type, image_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                record.disease_identifier,
                record.is_healthy,
                record.disease_name,
                record.confidence_score,
                record.plant_type,
                record.image_url,
                timestamp(&record.created_at),
            ],
        )?;
        tx.execute(
            "INSERT INTO diagnosis_details (diagnosis_id, description, symptoms,
             treatment_options, product_recommendations)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, record.description, symptoms, treatments, products],
        )?;
        if let Some(feedback) = &record.feedback {
            upsert_feedback_row(&tx, feedback)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DiagnosisRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{SELECT_RECORDS} ORDER BY d.created_at DESC"))?;
        let rows = stmt.query_map([], RecordRow::read)?;
        rows.map(|row| row?.into_record()).collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<DiagnosisRecord>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("{SELECT_RECORDS} WHERE d.id = ?1"),
                params![id.to_string()],
                RecordRow::read,
            )
            .optional()?;
        row.map(RecordRow::into_record).transpose()
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let changed = self
            .conn()
            .execute("DELETE FROM diagnoses WHERE id = ?1", params![id.to_string()])?;
        Ok(changed > 0)
    }

    async fn upsert_feedback(&self, feedback: &FeedbackAnnotation) -> Result<(), StoreError> {
        let conn = self.conn();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM diagnoses WHERE id = ?1)",
            params![feedback.diagnosis_id.to_string()],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StoreError::NotFound(feedback.diagnosis_id));
        }
        upsert_feedback_row(&conn, feedback)
    }

    async fn put_blob(&self, bytes: &[u8], mime_type: &str) -> Result<String, StoreError> {
        let key = Uuid::new_v4().to_string();
        self.conn().execute(
            "INSERT INTO images (key, mime_type, bytes, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![key, mime_type, bytes, timestamp(&Utc::now())],
        )?;
        Ok(format!("{SQLITE_BLOB_PREFIX}{key}"))
    }

    async fn delete_blob(&self, key: &str) -> Result<(), StoreError> {
        self.conn()
            .execute("DELETE FROM images WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn blob_url_prefix(&self) -> &str {
        SQLITE_BLOB_PREFIX
    }
}

fn upsert_feedback_row(conn: &Connection, feedback: &FeedbackAnnotation) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO feedback (diagnosis_id, helpful, comment, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (diagnosis_id) DO UPDATE SET
             helpful = excluded.helpful,
             comment = excluded.comment,
             updated_at = excluded.updated_at",
        params![
            feedback.diagnosis_id.to_string(),
            feedback.helpful,
            feedback.comment,
            timestamp(&feedback.updated_at),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::gateway::{ResultStore, SaveOutcome, StoreConfig, WriteOutcome};
    use crate::testing::record;

    fn count(store: &SqliteStore, table: &str) -> i64 {
        store
            .conn()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn schema_version_is_current() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(current_version(&store.conn()), 1);
    }

    #[test]
    fn migration_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(run_migrations(&store.conn()).is_ok());
        assert_eq!(count(&store, "schema_version"), 1);
    }

    #[test]
    fn foreign_keys_enabled() {
        let store = SqliteStore::open_in_memory().unwrap();
        let fk: i64 = store
            .conn()
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[tokio::test]
    async fn record_round_trips_with_feedback() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut original = record("early_blight", 88, "https://images.example/a.jpg", 0);
        original.feedback = Some(FeedbackAnnotation::new(original.id, true, Some("thanks".into())));

        store.insert(&original).await.unwrap();
        assert_eq!(store.get(original.id).await.unwrap(), Some(original.clone()));
        assert_eq!(store.list().await.unwrap(), vec![original]);
    }

    #[tokio::test]
    async fn healthy_record_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let healthy = record("healthy", 95, "https://images.example/a.jpg", 0);
        store.insert(&healthy).await.unwrap();
        let loaded = store.get(healthy.id).await.unwrap().unwrap();
        assert!(loaded.is_healthy);
        assert!(loaded.disease_name.is_none());
        assert!(loaded.symptoms.is_empty());
    }

    #[tokio::test]
    async fn list_orders_by_created_at_desc() {
        let store = SqliteStore::open_in_memory().unwrap();
        let oldest = record("leaf_rust", 90, "https://images.example/a.jpg", 120);
        let newest = record("late_blight", 90, "https://images.example/b.jpg", 1);
        let middle = record("healthy", 90, "https://images.example/c.jpg", 60);
        for r in [&oldest, &newest, &middle] {
            store.insert(r).await.unwrap();
        }
        let ids: Vec<_> = store.list().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![newest.id, middle.id, oldest.id]);
    }

    #[tokio::test]
    async fn delete_cascades_to_details_and_feedback() {
        let store = SqliteStore::open_in_memory().unwrap();
        let r = record("leaf_rust", 90, "https://images.example/a.jpg", 0);
        store.insert(&r).await.unwrap();
        store
            .upsert_feedback(&FeedbackAnnotation::new(r.id, false, None))
            .await
            .unwrap();

        assert!(store.delete(r.id).await.unwrap());
        assert!(!store.delete(r.id).await.unwrap());
        assert_eq!(count(&store, "diagnosis_details"), 0);
        assert_eq!(count(&store, "feedback"), 0);
    }

    #[tokio::test]
    async fn feedback_upsert_replaces() {
        let store = SqliteStore::open_in_memory().unwrap();
        let r = record("bacterial_spot", 80, "https://images.example/a.jpg", 0);
        store.insert(&r).await.unwrap();

        let first = FeedbackAnnotation::new(r.id, true, Some("first".into()));
        let second = FeedbackAnnotation::new(r.id, false, Some("second".into()));
        store.upsert_feedback(&first).await.unwrap();
        store.upsert_feedback(&second).await.unwrap();

        assert_eq!(count(&store, "feedback"), 1);
        let loaded = store.get(r.id).await.unwrap().unwrap();
        assert_eq!(loaded.feedback, Some(second));
    }

    #[tokio::test]
    async fn feedback_for_missing_record_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .upsert_feedback(&FeedbackAnnotation::new(Uuid::new_v4(), true, None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn blobs_round_trip_and_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        let url = store.put_blob(b"\x89PNG", "image/png").await.unwrap();
        let key = url.strip_prefix(SQLITE_BLOB_PREFIX).unwrap();
        assert_eq!(
            store.blob(key).unwrap(),
            Some(("image/png".to_owned(), b"\x89PNG".to_vec()))
        );
        store.delete_blob(key).await.unwrap();
        assert_eq!(store.blob(key).unwrap(), None);
    }

    #[tokio::test]
    async fn gateway_over_sqlite() {
        let gateway = ResultStore::connected(
            SqliteStore::open_in_memory().unwrap(),
            StoreConfig::default(),
        );
        let low = record("early_blight", 60, "https://images.example/a.jpg", 0);
        assert_eq!(gateway.save(&low).await, SaveOutcome::BelowThreshold);
        assert!(gateway.list().await.is_empty());

        let url = gateway.store_image(b"jpeg", "image/jpeg").await.unwrap();
        let high = record("late_blight", 91, &url, 0);
        assert_eq!(gateway.save(&high).await, SaveOutcome::Saved);
        assert_eq!(gateway.list().await, vec![high.clone()]);

        assert_eq!(gateway.delete(high.id).await, WriteOutcome::Written);
        assert_eq!(count(gateway.backing().unwrap(), "images"), 0);
    }
}
