//! Represents the client-supplied `Upload-Metadata` attached to an upload.

use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("metadata key is empty")]
    EmptyKey,
    #[error("metadata value for `{0}` is not valid base64")]
    InvalidBase64(String),
    #[error("metadata value for `{0}` is not valid UTF-8")]
    InvalidUtf8(String),
}

/// Key-value metadata entries attached to an upload.
///
/// The wire form is a comma-separated list of `key base64(value)` pairs. A key
/// sent without a value is retained with `None`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadMetadata {
    /// Header value exactly as received, echoed back on HEAD.
    pub raw: Option<String>,

    /// Decoded entries.
    pub entries: BTreeMap<String, Option<String>>,
}

impl UploadMetadata {
    /// Decode a raw `Upload-Metadata` header value.
    pub fn parse(raw: Option<&str>) -> Result<Self, MetadataError> {
        let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
            return Ok(Self::default());
        };

        let mut entries = BTreeMap::new();
        for pair in raw.split(',') {
            let mut parts = pair.trim().splitn(2, ' ');
            let key = parts.next().unwrap_or_default().trim();
            if key.is_empty() {
                return Err(MetadataError::EmptyKey);
            }
            let value = match parts.next().map(str::trim).filter(|v| !v.is_empty()) {
                Some(encoded) => {
                    let bytes = general_purpose::STANDARD
                        .decode(encoded)
                        .map_err(|_| MetadataError::InvalidBase64(key.to_string()))?;
                    let decoded = String::from_utf8(bytes)
                        .map_err(|_| MetadataError::InvalidUtf8(key.to_string()))?;
                    Some(decoded)
                }
                None => None,
            };
            entries.insert(key.to_string(), value);
        }

        Ok(Self {
            raw: Some(raw.to_string()),
            entries,
        })
    }

    /// Decoded value for `key`, if the key was sent with a value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(|v| v.as_deref())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_pairs_and_bare_keys() {
        let meta = UploadMetadata::parse(Some("filename d29ybGQ=,is_confidential")).unwrap();
        assert_eq!(meta.get("filename"), Some("world"));
        assert!(meta.contains_key("is_confidential"));
        assert_eq!(meta.get("is_confidential"), None);
        assert_eq!(meta.raw.as_deref(), Some("filename d29ybGQ=,is_confidential"));
    }

    #[test]
    fn absent_or_blank_header_is_empty() {
        assert!(UploadMetadata::parse(None).unwrap().is_empty());
        let blank = UploadMetadata::parse(Some("   ")).unwrap();
        assert!(blank.is_empty());
        assert_eq!(blank.raw, None);
    }

    #[test]
    fn rejects_bad_base64() {
        let err = UploadMetadata::parse(Some("filename !!!")).unwrap_err();
        assert_eq!(err, MetadataError::InvalidBase64("filename".into()));
    }

    #[test]
    fn rejects_empty_key() {
        let err = UploadMetadata::parse(Some("filename d29ybGQ=,,")).unwrap_err();
        assert_eq!(err, MetadataError::EmptyKey);
    }
}
