//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the upload tracker and blob storage

use crate::services::processor::TusProcessor;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Liveness probe; never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Pings the upload tracker (`SELECT 1` for SQLite).
/// 2. Writes, reads back and deletes a scratch file in blob storage.
///
/// HTTP 200 when all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(processor): State<TusProcessor>) -> impl IntoResponse {
    let tracker_check = CheckStatus::from(processor.ping_tracker().await);
    let storage_check = CheckStatus::from(processor.probe_storage().await);
    let overall_ok = tracker_check.ok && storage_check.ok;

    let mut checks = HashMap::new();
    checks.insert("tracker", tracker_check);
    checks.insert("storage", storage_check);

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl<E: std::fmt::Display> From<Result<(), E>> for CheckStatus {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => CheckStatus {
                ok: true,
                error: None,
            },
            Err(err) => CheckStatus {
                ok: false,
                error: Some(err.to_string()),
            },
        }
    }
}
