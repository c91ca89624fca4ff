//! Defines routes for the tus upload collection.
//!
//! ## Structure
//! - **Collection** (`{base}`)
//!   - `OPTIONS`: capability discovery
//!   - `POST`: create upload (only when creation is enabled)
//!
//! - **Upload** (`{base}/{id}`)
//!   - `HEAD`: offset query
//!   - `PATCH`: append chunk
//!   - `DELETE`: terminate (only when termination is enabled)
//!   - `POST`: `X-HTTP-Method-Override` tunnel
//!   - `GET`: download received bytes
//!   - `OPTIONS`: capability discovery
//!
//! Health endpoints are mounted at the root.

use crate::{
    config::TusSettings,
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{
            create_upload, discover, download_upload, inspect_upload, override_method,
            terminate_upload, write_upload,
        },
    },
    services::processor::TusProcessor,
};
use axum::{
    Router,
    routing::{MethodRouter, get, options},
};

/// Build the router for the upload collection mounted at `base_path`.
///
/// `base_path` is normalized (leading slash, no trailing slash, empty for the
/// root). The router carries the shared `TusProcessor` to all handlers.
pub fn routes(base_path: &str, settings: &TusSettings) -> Router<TusProcessor> {
    let collection_path = if base_path.is_empty() { "/" } else { base_path };
    let upload_path = format!("{}/{{id}}", base_path);

    let mut collection: MethodRouter<TusProcessor> = options(discover);
    if settings.enable_creation {
        collection = collection.post(create_upload);
    }

    let mut upload: MethodRouter<TusProcessor> = options(discover)
        .get(download_upload)
        .head(inspect_upload)
        .patch(write_upload)
        .post(override_method);
    if settings.enable_termination {
        upload = upload.delete(terminate_upload);
    }

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(collection_path, collection)
        .route(&upload_path, upload)
}
