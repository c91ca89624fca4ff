use crate::protocol::{CHECKSUM_MISMATCH, TUS_RESUMABLE, TUS_VERSION, TUS_VERSION_HEADER};
use crate::services::checksum::UnsupportedAlgorithm;
use crate::services::storage::StorageError;
use crate::services::tracker::TrackerError;
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

pub type TusResult<T> = Result<T, TusError>;

/// Every way a protocol exchange can fail. Each variant maps to exactly one
/// HTTP status.
#[derive(Debug, Error)]
pub enum TusError {
    #[error("unsupported protocol version `{}`", .received.as_deref().unwrap_or("<none>"))]
    VersionMismatch { received: Option<String> },

    #[error("malformed request: {message}")]
    Malformed {
        message: String,
        instance: Option<String>,
    },

    #[error("upload length {declared} exceeds the maximum of {max} bytes")]
    SizeExceeded { declared: u64, max: u64 },

    #[error("content type must be `application/offset+octet-stream`")]
    UnsupportedMediaType { received: Option<String> },

    #[error("upload `{0}` not found")]
    NotFound(String),

    #[error("upload `{0}` was terminated")]
    Gone(String),

    #[error("upload `{id}` is at offset {expected}, request declared {received}")]
    OffsetConflict {
        id: String,
        expected: u64,
        received: u64,
    },

    #[error("upload `{0}` is being written by another request")]
    Locked(String),

    #[error("the `{0}` extension is disabled")]
    ExtensionDisabled(&'static str),

    #[error("checksum mismatch for upload `{0}`")]
    ChecksumMismatch(String),

    #[error(transparent)]
    UnsupportedChecksumAlgorithm(#[from] UnsupportedAlgorithm),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TusError {
    pub fn malformed(message: impl Into<String>) -> Self {
        TusError::Malformed {
            message: message.into(),
            instance: None,
        }
    }

    /// Shortcut for a malformed request against a known upload.
    pub fn malformed_for(id: &str, message: impl Into<String>) -> Self {
        TusError::Malformed {
            message: message.into(),
            instance: Some(id.to_string()),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            TusError::VersionMismatch { .. } => StatusCode::PRECONDITION_FAILED,
            TusError::Malformed { .. } => StatusCode::BAD_REQUEST,
            TusError::SizeExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            TusError::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            TusError::NotFound(_) => StatusCode::NOT_FOUND,
            TusError::Gone(_) => StatusCode::GONE,
            TusError::OffsetConflict { .. } => StatusCode::CONFLICT,
            TusError::Locked(_) => StatusCode::LOCKED,
            TusError::ExtensionDisabled(_) => StatusCode::METHOD_NOT_ALLOWED,
            TusError::ChecksumMismatch(_) => {
                StatusCode::from_u16(CHECKSUM_MISMATCH).unwrap_or(StatusCode::BAD_REQUEST)
            }
            TusError::UnsupportedChecksumAlgorithm(_) => StatusCode::BAD_REQUEST,
            TusError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            TusError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Upload id the failure refers to, when there is one.
    pub fn instance(&self) -> Option<&str> {
        match self {
            TusError::Malformed { instance, .. } => instance.as_deref(),
            TusError::NotFound(id)
            | TusError::Gone(id)
            | TusError::Locked(id)
            | TusError::ChecksumMismatch(id)
            | TusError::OffsetConflict { id, .. } => Some(id),
            _ => None,
        }
    }
}

impl IntoResponse for TusError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        } else {
            tracing::debug!("request rejected ({}): {}", status.as_u16(), self);
        }

        let mut body = json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });
        if let Some(instance) = self.instance() {
            body["instance"] = json!(instance);
        }
        match &self {
            TusError::OffsetConflict {
                expected, received, ..
            } => {
                body["expected"] = json!(expected);
                body["received"] = json!(received);
            }
            TusError::SizeExceeded { declared, max } => {
                body["expected"] = json!(max);
                body["received"] = json!(declared);
            }
            _ => {}
        }

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        if matches!(self, TusError::VersionMismatch { .. }) {
            headers.insert(TUS_VERSION_HEADER, HeaderValue::from_static(TUS_VERSION));
        }
        response
    }
}

impl From<StorageError> for TusError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) | StorageError::InvalidId(id) => TusError::NotFound(id),
            StorageError::Io(err) => TusError::StorageUnavailable(err.to_string()),
            other => TusError::Internal(other.to_string()),
        }
    }
}

impl From<TrackerError> for TusError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::NotFound(id) => TusError::NotFound(id),
            other => TusError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_are_stable() {
        assert_eq!(TusError::Locked("a".into()).status().as_u16(), 423);
        assert_eq!(TusError::ChecksumMismatch("a".into()).status().as_u16(), 460);
        assert_eq!(TusError::Gone("a".into()).status(), StatusCode::GONE);
        assert_eq!(
            TusError::VersionMismatch { received: None }.status(),
            StatusCode::PRECONDITION_FAILED
        );
    }

    #[test]
    fn version_mismatch_advertises_supported_version() {
        let response = TusError::VersionMismatch {
            received: Some("0.2.2".into()),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(response.headers()[&TUS_VERSION_HEADER], TUS_VERSION);
        assert_eq!(response.headers()[&TUS_RESUMABLE], TUS_VERSION);
    }

    #[test]
    fn storage_faults_are_not_client_errors() {
        let err: TusError = StorageError::Io(std::io::Error::other("disk gone")).into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);

        let err: TusError = StorageError::NotFound("abc".into()).into();
        assert_eq!(err.instance(), Some("abc"));
    }
}
