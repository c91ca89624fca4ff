//! tus 1.0.0 wire constants, request header parsing, and the normalized
//! response handed back to the HTTP adapter.

use crate::errors::{TusError, TusResult};
use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};

pub const TUS_VERSION: &str = "1.0.0";
pub const UPLOAD_CONTENT_TYPE: &str = "application/offset+octet-stream";
pub const CACHE_CONTROL_NO_STORE: &str = "no-store";
pub const EXPOSED_HEADERS: &str = "Location, Upload-Offset, Upload-Length, Upload-Metadata, \
     Upload-Defer-Length, Upload-Expires, Tus-Version, Tus-Resumable, Tus-Extension, \
     Tus-Max-Size, Tus-Checksum-Algorithm";

pub const TUS_RESUMABLE: HeaderName = HeaderName::from_static("tus-resumable");
pub const TUS_VERSION_HEADER: HeaderName = HeaderName::from_static("tus-version");
pub const TUS_EXTENSION: HeaderName = HeaderName::from_static("tus-extension");
pub const TUS_MAX_SIZE: HeaderName = HeaderName::from_static("tus-max-size");
pub const TUS_CHECKSUM_ALGORITHM: HeaderName = HeaderName::from_static("tus-checksum-algorithm");
pub const UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
pub const UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
pub const UPLOAD_DEFER_LENGTH: HeaderName = HeaderName::from_static("upload-defer-length");
pub const UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");
pub const UPLOAD_EXPIRES: HeaderName = HeaderName::from_static("upload-expires");
pub const UPLOAD_CHECKSUM: HeaderName = HeaderName::from_static("upload-checksum");
pub const X_HTTP_METHOD_OVERRIDE: HeaderName = HeaderName::from_static("x-http-method-override");

/// Non-standard status used by the checksum extension.
pub const CHECKSUM_MISMATCH: u16 = 460;

/// Trimmed, non-empty textual value of a request header.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Parse a non-negative integer header. Absent is `Ok(None)`; anything that is
/// present but not a `u64` is malformed.
pub fn parse_u64_header(headers: &HeaderMap, name: &HeaderName) -> TusResult<Option<u64>> {
    match header_str(headers, name) {
        None => Ok(None),
        Some(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| TusError::malformed(format!("{name} must be a non-negative integer, got `{value}`"))),
    }
}

/// Reject requests that do not speak the supported protocol version.
pub fn check_version(headers: &HeaderMap) -> TusResult<()> {
    match header_str(headers, &TUS_RESUMABLE) {
        Some(v) if v == TUS_VERSION => Ok(()),
        other => Err(TusError::VersionMismatch {
            received: other.map(str::to_string),
        }),
    }
}

pub fn has_upload_content_type(headers: &HeaderMap) -> bool {
    header_str(headers, &header::CONTENT_TYPE)
        .is_some_and(|ct| ct.eq_ignore_ascii_case(UPLOAD_CONTENT_TYPE))
}

pub fn check_upload_content_type(headers: &HeaderMap) -> TusResult<()> {
    if has_upload_content_type(headers) {
        Ok(())
    } else {
        Err(TusError::UnsupportedMediaType {
            received: header_str(headers, &header::CONTENT_TYPE).map(str::to_string),
        })
    }
}

/// `Upload-Defer-Length: 1` is the only accepted value.
pub fn wants_deferred_length(headers: &HeaderMap) -> bool {
    header_str(headers, &UPLOAD_DEFER_LENGTH) == Some("1")
}

/// RFC 7231 IMF-fixdate, as required for `Upload-Expires`.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Status plus headers for one protocol exchange.
#[derive(Debug)]
pub struct TusResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl TusResponse {
    /// Start a response carrying the headers every tus reply includes.
    pub fn new(status: StatusCode) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static(EXPOSED_HEADERS),
        );
        Self { status, headers }
    }

    /// Set a header, silently skipping values that are not valid header text.
    pub fn header(mut self, name: HeaderName, value: impl AsRef<str>) -> Self {
        if let Ok(value) = HeaderValue::from_str(value.as_ref()) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn no_store(self) -> Self {
        self.header(header::CACHE_CONTROL, CACHE_CONTROL_NO_STORE)
    }

    pub fn header_value(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl IntoResponse for TusResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn headers(pairs: &[(HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn version_must_match() {
        assert!(check_version(&headers(&[(TUS_RESUMABLE, "1.0.0")])).is_ok());
        assert!(matches!(
            check_version(&headers(&[(TUS_RESUMABLE, "0.2.2")])),
            Err(TusError::VersionMismatch { received: Some(_) })
        ));
        assert!(matches!(
            check_version(&HeaderMap::new()),
            Err(TusError::VersionMismatch { received: None })
        ));
    }

    #[test]
    fn numeric_headers() {
        let map = headers(&[(UPLOAD_OFFSET, "42"), (UPLOAD_LENGTH, "-1")]);
        assert_eq!(parse_u64_header(&map, &UPLOAD_OFFSET).unwrap(), Some(42));
        assert!(matches!(
            parse_u64_header(&map, &UPLOAD_LENGTH),
            Err(TusError::Malformed { .. })
        ));
        assert_eq!(parse_u64_header(&map, &UPLOAD_METADATA).unwrap(), None);
    }

    #[test]
    fn content_type_is_case_insensitive() {
        let map = headers(&[(header::CONTENT_TYPE, "Application/Offset+Octet-Stream")]);
        assert!(has_upload_content_type(&map));
        assert!(check_upload_content_type(&HeaderMap::new()).is_err());
    }

    #[test]
    fn formats_imf_fixdate() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(http_date(at), "Tue, 05 Mar 2024 07:08:09 GMT");
    }
}
