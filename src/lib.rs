//! Resumable upload server implementing tus 1.0.0.
//!
//! The engine lives in [`services`]; [`handlers`] and [`routes`] are a thin
//! axum adapter over [`services::TusProcessor`].

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod protocol;
pub mod routes;
pub mod services;

use axum::Router;
use services::TusProcessor;

/// Full application router with the processor attached as state.
pub fn app(base_path: &str, processor: TusProcessor) -> Router {
    routes::routes::routes(base_path, processor.settings()).with_state(processor)
}
