//! HTTP handlers for the tus verbs.
//! Each handler only adapts axum extractors to a `TusProcessor` call; request
//! bodies are streamed, never buffered.

use crate::{
    errors::TusError,
    models::{UploadLength, UploadResource},
    protocol::{
        TUS_RESUMABLE, TUS_VERSION, TusResponse, UPLOAD_LENGTH, UPLOAD_OFFSET,
        X_HTTP_METHOD_OVERRIDE, header_str,
    },
    services::{processor::TusProcessor, stream::ByteStream},
};
use axum::{
    body::Body,
    extract::{OriginalUri, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use std::io;

/// Adapt an axum request body into the engine's byte stream.
fn body_stream(body: Body) -> ByteStream {
    body.into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed()
}

/// `OPTIONS {base}` and `OPTIONS {base}/{id}`
pub async fn discover(
    State(processor): State<TusProcessor>,
    headers: HeaderMap,
) -> Result<TusResponse, TusError> {
    processor.discover(&headers)
}

/// `POST {base}`: create an upload, with optional first chunk.
pub async fn create_upload(
    State(processor): State<TusProcessor>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Body,
) -> Result<TusResponse, TusError> {
    processor
        .create(&headers, uri.path(), body_stream(body))
        .await
}

/// `HEAD {base}/{id}`
pub async fn inspect_upload(
    State(processor): State<TusProcessor>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<TusResponse, TusError> {
    processor.inspect(&id, &headers).await
}

/// `PATCH {base}/{id}`
pub async fn write_upload(
    State(processor): State<TusProcessor>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<TusResponse, TusError> {
    processor.write(&id, &headers, body_stream(body)).await
}

/// `DELETE {base}/{id}`
pub async fn terminate_upload(
    State(processor): State<TusProcessor>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<TusResponse, TusError> {
    processor.terminate(&id, &headers).await
}

/// `POST {base}/{id}` with `X-HTTP-Method-Override`, for clients that can
/// only send GET and POST.
pub async fn override_method(
    State(processor): State<TusProcessor>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<TusResponse, TusError> {
    let method = header_str(&headers, &X_HTTP_METHOD_OVERRIDE).map(str::to_ascii_uppercase);
    match method.as_deref() {
        Some("PATCH") => processor.write(&id, &headers, body_stream(body)).await,
        Some("DELETE") => processor.terminate(&id, &headers).await,
        Some("HEAD") => processor.inspect(&id, &headers).await,
        Some(other) => Err(TusError::malformed_for(
            &id,
            format!("unsupported X-HTTP-Method-Override `{other}`"),
        )),
        None => Err(TusError::malformed_for(
            &id,
            "POST on an upload requires X-HTTP-Method-Override",
        )),
    }
}

/// `GET {base}/{id}`: stream the bytes received so far.
pub async fn download_upload(
    State(processor): State<TusProcessor>,
    Path(id): Path<String>,
) -> Result<Response, TusError> {
    let (upload, stream) = processor.read(&id).await?;

    let mut response = Body::from_stream(stream).into_response();
    *response.status_mut() = StatusCode::OK;
    set_download_headers(response.headers_mut(), &upload);
    Ok(response)
}

fn set_download_headers(headers: &mut HeaderMap, upload: &UploadResource) {
    let content_type = upload
        .metadata
        .get("filetype")
        .and_then(|ft| HeaderValue::from_str(ft).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(upload.offset));
    headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    headers.insert(UPLOAD_OFFSET, HeaderValue::from(upload.offset));
    if let UploadLength::Known(length) = upload.length {
        headers.insert(UPLOAD_LENGTH, HeaderValue::from(length));
    }
    if let Some(filename) = upload.metadata.get("filename") {
        let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', ""));
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
}
