//! SQLite tracker for deployments where several processes share upload state.
//!
//! Removal is a soft delete (`removed = 1`), so removed ids stay reserved and
//! answer as gone. Each mutation is a single `UPDATE … RETURNING` statement,
//! which keeps it atomic per id.

use super::{TrackerError, TrackerResult, UploadTracker};
use crate::models::{UploadLength, UploadMetadata, UploadResource};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use tracing::debug;

/// Schema applied by [`SqliteUploadTracker::migrate`].
pub const MIGRATION_SQL: &str = include_str!("../../../migrations/0001_init.sql");

const COLUMNS: &str =
    "id, upload_length, upload_offset, metadata, checksum, created_at, expires_at";

#[derive(FromRow, Debug)]
struct UploadRow {
    id: String,
    upload_length: Option<i64>,
    upload_offset: i64,
    metadata: Option<String>,
    checksum: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<UploadRow> for UploadResource {
    type Error = TrackerError;

    fn try_from(row: UploadRow) -> Result<Self, Self::Error> {
        let corrupt = |what: String| TrackerError::Corrupt(row.id.clone(), what);
        let length = match row.upload_length {
            Some(len) => UploadLength::Known(
                u64::try_from(len).map_err(|_| corrupt(format!("negative length {len}")))?,
            ),
            None => UploadLength::Deferred,
        };
        let offset = u64::try_from(row.upload_offset)
            .map_err(|_| corrupt(format!("negative offset {}", row.upload_offset)))?;
        let metadata = UploadMetadata::parse(row.metadata.as_deref())
            .map_err(|err| corrupt(err.to_string()))?;

        Ok(UploadResource {
            id: row.id,
            length,
            offset,
            metadata,
            checksum: row.checksum,
            created_at: row.created_at,
            expires_at: row.expires_at,
        })
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[derive(Clone)]
pub struct SqliteUploadTracker {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
    retention: Duration,
}

impl SqliteUploadTracker {
    pub fn new(db: Arc<SqlitePool>, retention: Duration) -> Self {
        Self { db, retention }
    }

    /// Apply the embedded schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> TrackerResult<()> {
        let statements = MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("running {} migration statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    async fn fetch_live(&self, id: &str) -> TrackerResult<Option<UploadResource>> {
        let row = sqlx::query_as::<_, UploadRow>(&format!(
            "SELECT {COLUMNS} FROM uploads WHERE id = ? AND removed = 0"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        row.map(UploadResource::try_from).transpose()
    }

    /// Explain why a guarded UPDATE matched no row.
    async fn rejected(&self, id: &str, err: TrackerError) -> TrackerError {
        match self.fetch_live(id).await {
            Ok(Some(_)) => err,
            Ok(None) => TrackerError::NotFound(id.to_string()),
            Err(other) => other,
        }
    }
}

#[async_trait]
impl UploadTracker for SqliteUploadTracker {
    async fn create(
        &self,
        id: &str,
        length: UploadLength,
        metadata: UploadMetadata,
    ) -> TrackerResult<UploadResource> {
        let upload = UploadResource::new(id, length, metadata, self.retention);
        let result = sqlx::query(
            "INSERT INTO uploads (id, upload_length, upload_offset, metadata, checksum,
                                  created_at, expires_at, removed)
             VALUES (?, ?, 0, ?, NULL, ?, ?, 0)",
        )
        .bind(&upload.id)
        .bind(upload.length.known().map(to_i64))
        .bind(upload.metadata.raw.as_deref())
        .bind(upload.created_at)
        .bind(upload.expires_at)
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => Ok(upload),
            Err(err) if is_unique_violation(&err) => Err(TrackerError::AlreadyExists(id.to_string())),
            Err(err) => Err(TrackerError::Sqlx(err)),
        }
    }

    async fn patch(&self, id: &str, offset: u64) -> TrackerResult<UploadResource> {
        let offset_i = to_i64(offset);
        let row = sqlx::query_as::<_, UploadRow>(&format!(
            "UPDATE uploads SET upload_offset = ?, expires_at = ?
             WHERE id = ? AND removed = 0 AND upload_offset <= ?
               AND (upload_length IS NULL OR upload_length >= ?)
             RETURNING {COLUMNS}"
        ))
        .bind(offset_i)
        .bind(Utc::now() + self.retention)
        .bind(id)
        .bind(offset_i)
        .bind(offset_i)
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self
                .rejected(
                    id,
                    TrackerError::InvalidOffset {
                        id: id.to_string(),
                        offset,
                    },
                )
                .await),
        }
    }

    async fn head(&self, id: &str) -> TrackerResult<Option<UploadResource>> {
        self.fetch_live(id).await
    }

    async fn update_length(&self, id: &str, length: u64) -> TrackerResult<UploadResource> {
        let length_i = to_i64(length);
        let row = sqlx::query_as::<_, UploadRow>(&format!(
            "UPDATE uploads SET upload_length = ?, expires_at = ?
             WHERE id = ? AND removed = 0 AND upload_length IS NULL AND upload_offset <= ?
             RETURNING {COLUMNS}"
        ))
        .bind(length_i)
        .bind(Utc::now() + self.retention)
        .bind(id)
        .bind(length_i)
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self
                .rejected(
                    id,
                    TrackerError::InvalidLength {
                        id: id.to_string(),
                        length,
                    },
                )
                .await),
        }
    }

    async fn list_expired(&self, remove: bool) -> TrackerResult<Vec<String>> {
        let now = Utc::now();
        let sql = if remove {
            "UPDATE uploads SET removed = 1 WHERE removed = 0 AND expires_at < ? RETURNING id"
        } else {
            "SELECT id FROM uploads WHERE removed = 0 AND expires_at < ?"
        };
        let ids = sqlx::query_scalar::<_, String>(sql)
            .bind(now)
            .fetch_all(&*self.db)
            .await?;
        Ok(ids)
    }

    async fn remove(&self, ids: &[String]) -> TrackerResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE uploads SET removed = 1 WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");
        builder.build().execute(&*self.db).await?;
        Ok(())
    }

    async fn was_removed(&self, id: &str) -> TrackerResult<bool> {
        let removed = sqlx::query_scalar::<_, i64>("SELECT removed FROM uploads WHERE id = ?")
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(removed == Some(1))
    }

    async fn record_checksum(&self, id: &str, checksum: &str) -> TrackerResult<()> {
        let result = sqlx::query("UPDATE uploads SET checksum = ? WHERE id = ? AND removed = 0")
            .bind(checksum)
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(TrackerError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn find_by_checksum(&self, checksum: &str) -> TrackerResult<Option<UploadResource>> {
        let row = sqlx::query_as::<_, UploadRow>(&format!(
            "SELECT {COLUMNS} FROM uploads WHERE checksum = ? AND removed = 0 LIMIT 1"
        ))
        .bind(checksum)
        .fetch_optional(&*self.db)
        .await?;
        row.map(UploadResource::try_from).transpose()
    }

    async fn ping(&self) -> TrackerResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn tracker_with(retention: Duration) -> SqliteUploadTracker {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let tracker = SqliteUploadTracker::new(Arc::new(pool), retention);
        tracker.migrate().await.unwrap();
        tracker
    }

    async fn tracker() -> SqliteUploadTracker {
        tracker_with(Duration::hours(24)).await
    }

    #[tokio::test]
    async fn round_trips_a_record() {
        let tracker = tracker().await;
        let metadata = UploadMetadata::parse(Some("filename d29ybGQ=,flag")).unwrap();
        tracker
            .create("a", UploadLength::Known(10), metadata.clone())
            .await
            .unwrap();

        let stored = tracker.head("a").await.unwrap().unwrap();
        assert_eq!(stored.length, UploadLength::Known(10));
        assert_eq!(stored.offset, 0);
        assert_eq!(stored.metadata, metadata);
        assert!(tracker.head("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let tracker = tracker().await;
        tracker
            .create("a", UploadLength::Deferred, UploadMetadata::default())
            .await
            .unwrap();
        assert!(matches!(
            tracker
                .create("a", UploadLength::Deferred, UploadMetadata::default())
                .await,
            Err(TrackerError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn patch_is_guarded() {
        let tracker = tracker().await;
        tracker
            .create("a", UploadLength::Known(10), UploadMetadata::default())
            .await
            .unwrap();
        assert_eq!(tracker.patch("a", 6).await.unwrap().offset, 6);
        assert!(matches!(
            tracker.patch("a", 3).await,
            Err(TrackerError::InvalidOffset { .. })
        ));
        assert!(matches!(
            tracker.patch("a", 12).await,
            Err(TrackerError::InvalidOffset { .. })
        ));
        assert!(matches!(
            tracker.patch("zzz", 1).await,
            Err(TrackerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn declares_deferred_length() {
        let tracker = tracker().await;
        tracker
            .create("a", UploadLength::Deferred, UploadMetadata::default())
            .await
            .unwrap();
        assert!(tracker.head("a").await.unwrap().unwrap().is_deferred());
        let upload = tracker.update_length("a", 5).await.unwrap();
        assert_eq!(upload.length, UploadLength::Known(5));
        assert!(matches!(
            tracker.update_length("a", 9).await,
            Err(TrackerError::InvalidLength { .. })
        ));
    }

    #[tokio::test]
    async fn soft_delete_and_expiry() {
        let tracker = tracker_with(Duration::seconds(-1)).await;
        for id in ["a", "b"] {
            tracker
                .create(id, UploadLength::Known(1), UploadMetadata::default())
                .await
                .unwrap();
        }
        tracker.remove(&["a".to_string()]).await.unwrap();
        assert!(tracker.was_removed("a").await.unwrap());
        assert!(tracker.head("a").await.unwrap().is_none());

        assert_eq!(tracker.list_expired(false).await.unwrap(), vec!["b"]);
        assert_eq!(tracker.list_expired(true).await.unwrap(), vec!["b"]);
        assert!(tracker.list_expired(false).await.unwrap().is_empty());
        assert!(tracker.was_removed("b").await.unwrap());
    }

    #[tokio::test]
    async fn checksum_lookup() {
        let tracker = tracker().await;
        tracker
            .create("a", UploadLength::Known(3), UploadMetadata::default())
            .await
            .unwrap();
        tracker.record_checksum("a", "sha1 Zm9v").await.unwrap();
        let found = tracker.find_by_checksum("sha1 Zm9v").await.unwrap().unwrap();
        assert_eq!(found.checksum.as_deref(), Some("sha1 Zm9v"));
        tracker.ping().await.unwrap();
    }
}
