//! Represents one resumable upload tracked by the server.

use super::metadata::UploadMetadata;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Total size of an upload, either declared or still pending.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadLength {
    /// Total size in bytes.
    Known(u64),
    /// The client will declare the size in a later PATCH.
    Deferred,
}

impl UploadLength {
    pub fn known(self) -> Option<u64> {
        match self {
            UploadLength::Known(length) => Some(length),
            UploadLength::Deferred => None,
        }
    }

    pub fn is_deferred(self) -> bool {
        matches!(self, UploadLength::Deferred)
    }
}

/// A single upload resource.
///
/// The struct stores bookkeeping only; payload bytes live in storage under the
/// same `id`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UploadResource {
    /// Opaque identifier, also the last path segment of the upload URL.
    pub id: String,

    /// Declared total size.
    pub length: UploadLength,

    /// Bytes durably received so far.
    pub offset: u64,

    /// Client metadata from the creation request.
    pub metadata: UploadMetadata,

    /// `"<algorithm> <base64 digest>"` of the full payload, when known.
    pub checksum: Option<String>,

    /// When the upload was created.
    pub created_at: DateTime<Utc>,

    /// When the upload becomes eligible for the expiry sweep.
    pub expires_at: DateTime<Utc>,
}

impl UploadResource {
    pub fn new(
        id: impl Into<String>,
        length: UploadLength,
        metadata: UploadMetadata,
        retention: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            length,
            offset: 0,
            metadata,
            checksum: None,
            created_at: now,
            expires_at: now + retention,
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.length.is_deferred()
    }

    /// True once every declared byte has been received.
    pub fn is_complete(&self) -> bool {
        self.length.known() == Some(self.offset)
    }

    /// Bytes still expected, or `None` while the length is deferred.
    pub fn remaining(&self) -> Option<u64> {
        self.length.known().map(|l| l.saturating_sub(self.offset))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Whether moving to `offset` keeps `offset` monotonic and within bounds.
    pub fn accepts_offset(&self, offset: u64) -> bool {
        offset >= self.offset && self.length.known().is_none_or(|l| offset <= l)
    }

    /// Move the offset forward and slide the expiry window.
    ///
    /// Callers check [`accepts_offset`](Self::accepts_offset) first.
    pub fn advance_to(&mut self, offset: u64, retention: Duration) {
        self.offset = offset;
        self.expires_at = Utc::now() + retention;
    }

    /// Settle a deferred length and slide the expiry window.
    pub fn declare_length(&mut self, length: u64, retention: Duration) {
        self.length = UploadLength::Known(length);
        self.expires_at = Utc::now() + retention;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(length: UploadLength) -> UploadResource {
        UploadResource::new("abc", length, UploadMetadata::default(), Duration::hours(1))
    }

    #[test]
    fn deferred_until_declared() {
        let mut res = upload(UploadLength::Deferred);
        assert!(res.is_deferred());
        assert_eq!(res.remaining(), None);
        assert!(!res.is_complete());

        res.declare_length(8, Duration::hours(1));
        assert!(!res.is_deferred());
        assert_eq!(res.remaining(), Some(8));
    }

    #[test]
    fn offset_bounds() {
        let mut res = upload(UploadLength::Known(10));
        assert!(res.accepts_offset(10));
        assert!(!res.accepts_offset(11));

        res.advance_to(6, Duration::hours(1));
        assert!(!res.accepts_offset(5));
        assert!(res.accepts_offset(6));
        assert_eq!(res.remaining(), Some(4));
    }

    #[test]
    fn advancing_slides_expiry() {
        let mut res = upload(UploadLength::Known(10));
        let before = res.expires_at;
        res.advance_to(4, Duration::days(2));
        assert!(res.expires_at > before);
    }

    #[test]
    fn zero_length_is_complete_immediately() {
        assert!(upload(UploadLength::Known(0)).is_complete());
    }
}
