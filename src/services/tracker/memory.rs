//! In-process tracker for single-node deployments.

use super::{TrackerError, TrackerResult, UploadTracker};
use crate::models::{UploadLength, UploadMetadata, UploadResource};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, mapref::entry::Entry};

/// Tracker backed by a `DashMap`. Removed ids are kept as tombstones so they
/// can be reported as gone rather than unknown. Tombstones older than the
/// retention window are pruned on each expiry listing; after that the id
/// reads as unknown.
pub struct InMemoryUploadTracker {
    uploads: DashMap<String, UploadResource>,
    removed: DashMap<String, DateTime<Utc>>,
    retention: Duration,
}

impl InMemoryUploadTracker {
    /// `retention` is how long an upload survives without progress.
    pub fn new(retention: Duration) -> Self {
        Self {
            uploads: DashMap::new(),
            removed: DashMap::new(),
            retention,
        }
    }

    pub fn len(&self) -> usize {
        self.uploads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty()
    }

    fn drop_ids(&self, ids: &[String]) {
        let now = Utc::now();
        for id in ids {
            if self.uploads.remove(id).is_some() {
                self.removed.insert(id.clone(), now);
            }
        }
    }

    fn prune_tombstones(&self, now: DateTime<Utc>) {
        let horizon = now - self.retention;
        self.removed.retain(|_, removed_at| *removed_at > horizon);
    }
}

#[async_trait]
impl UploadTracker for InMemoryUploadTracker {
    async fn create(
        &self,
        id: &str,
        length: UploadLength,
        metadata: UploadMetadata,
    ) -> TrackerResult<UploadResource> {
        if self.removed.contains_key(id) {
            return Err(TrackerError::AlreadyExists(id.to_string()));
        }
        match self.uploads.entry(id.to_string()) {
            Entry::Occupied(_) => Err(TrackerError::AlreadyExists(id.to_string())),
            Entry::Vacant(slot) => {
                let upload = UploadResource::new(id, length, metadata, self.retention);
                slot.insert(upload.clone());
                Ok(upload)
            }
        }
    }

    async fn patch(&self, id: &str, offset: u64) -> TrackerResult<UploadResource> {
        let mut upload = self
            .uploads
            .get_mut(id)
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))?;
        if !upload.accepts_offset(offset) {
            return Err(TrackerError::InvalidOffset {
                id: id.to_string(),
                offset,
            });
        }
        upload.advance_to(offset, self.retention);
        Ok(upload.clone())
    }

    async fn head(&self, id: &str) -> TrackerResult<Option<UploadResource>> {
        Ok(self.uploads.get(id).map(|u| u.clone()))
    }

    async fn update_length(&self, id: &str, length: u64) -> TrackerResult<UploadResource> {
        let mut upload = self
            .uploads
            .get_mut(id)
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))?;
        if !upload.is_deferred() || length < upload.offset {
            return Err(TrackerError::InvalidLength {
                id: id.to_string(),
                length,
            });
        }
        upload.declare_length(length, self.retention);
        Ok(upload.clone())
    }

    async fn list_expired(&self, remove: bool) -> TrackerResult<Vec<String>> {
        let now = Utc::now();
        self.prune_tombstones(now);
        let expired: Vec<String> = self
            .uploads
            .iter()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();
        if remove {
            self.drop_ids(&expired);
        }
        Ok(expired)
    }

    async fn remove(&self, ids: &[String]) -> TrackerResult<()> {
        self.drop_ids(ids);
        Ok(())
    }

    async fn was_removed(&self, id: &str) -> TrackerResult<bool> {
        Ok(self.removed.contains_key(id))
    }

    async fn record_checksum(&self, id: &str, checksum: &str) -> TrackerResult<()> {
        let mut upload = self
            .uploads
            .get_mut(id)
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))?;
        upload.checksum = Some(checksum.to_string());
        Ok(())
    }

    async fn find_by_checksum(&self, checksum: &str) -> TrackerResult<Option<UploadResource>> {
        Ok(self
            .uploads
            .iter()
            .find(|entry| entry.checksum.as_deref() == Some(checksum))
            .map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> InMemoryUploadTracker {
        InMemoryUploadTracker::new(Duration::hours(24))
    }

    #[tokio::test]
    async fn create_and_patch() {
        let tracker = tracker();
        let created = tracker
            .create("a", UploadLength::Known(10), UploadMetadata::default())
            .await
            .unwrap();
        assert_eq!(created.offset, 0);

        let patched = tracker.patch("a", 4).await.unwrap();
        assert_eq!(patched.offset, 4);
        assert!(patched.expires_at >= created.expires_at);
        assert_eq!(tracker.head("a").await.unwrap().unwrap().offset, 4);
    }

    #[tokio::test]
    async fn patch_rejects_regression_and_overflow() {
        let tracker = tracker();
        tracker
            .create("a", UploadLength::Known(10), UploadMetadata::default())
            .await
            .unwrap();
        tracker.patch("a", 5).await.unwrap();
        assert!(matches!(
            tracker.patch("a", 4).await,
            Err(TrackerError::InvalidOffset { offset: 4, .. })
        ));
        assert!(matches!(
            tracker.patch("a", 11).await,
            Err(TrackerError::InvalidOffset { offset: 11, .. })
        ));
        assert!(matches!(
            tracker.patch("missing", 1).await,
            Err(TrackerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn deferred_length_is_declared_once() {
        let tracker = tracker();
        tracker
            .create("a", UploadLength::Deferred, UploadMetadata::default())
            .await
            .unwrap();
        let upload = tracker.update_length("a", 7).await.unwrap();
        assert_eq!(upload.length, UploadLength::Known(7));
        assert!(matches!(
            tracker.update_length("a", 8).await,
            Err(TrackerError::InvalidLength { .. })
        ));
    }

    #[tokio::test]
    async fn removed_ids_leave_tombstones() {
        let tracker = tracker();
        tracker
            .create("a", UploadLength::Known(1), UploadMetadata::default())
            .await
            .unwrap();
        tracker.remove(&["a".to_string()]).await.unwrap();
        assert!(tracker.head("a").await.unwrap().is_none());
        assert!(tracker.was_removed("a").await.unwrap());
        assert!(!tracker.was_removed("never").await.unwrap());
        assert!(matches!(
            tracker
                .create("a", UploadLength::Known(1), UploadMetadata::default())
                .await,
            Err(TrackerError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn sweeps_expired_uploads() {
        let tracker = InMemoryUploadTracker::new(Duration::seconds(-1));
        tracker
            .create("old", UploadLength::Known(1), UploadMetadata::default())
            .await
            .unwrap();

        assert_eq!(tracker.list_expired(false).await.unwrap(), vec!["old"]);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.list_expired(true).await.unwrap(), vec!["old"]);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn old_tombstones_are_pruned() {
        let tracker = InMemoryUploadTracker::new(Duration::seconds(-1));
        tracker
            .create("a", UploadLength::Known(1), UploadMetadata::default())
            .await
            .unwrap();
        tracker.remove(&["a".to_string()]).await.unwrap();
        assert!(tracker.was_removed("a").await.unwrap());

        tracker.list_expired(false).await.unwrap();
        assert!(!tracker.was_removed("a").await.unwrap());
    }

    #[tokio::test]
    async fn recent_tombstones_survive_pruning() {
        let tracker = tracker();
        tracker
            .create("a", UploadLength::Known(1), UploadMetadata::default())
            .await
            .unwrap();
        tracker.remove(&["a".to_string()]).await.unwrap();
        tracker.list_expired(false).await.unwrap();
        assert!(tracker.was_removed("a").await.unwrap());
    }

    #[tokio::test]
    async fn finds_by_checksum() {
        let tracker = tracker();
        tracker
            .create("a", UploadLength::Known(3), UploadMetadata::default())
            .await
            .unwrap();
        tracker.record_checksum("a", "md5 AAAA").await.unwrap();
        let found = tracker.find_by_checksum("md5 AAAA").await.unwrap().unwrap();
        assert_eq!(found.id, "a");
        assert!(tracker.find_by_checksum("md5 BBBB").await.unwrap().is_none());
    }
}
