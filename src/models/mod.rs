//! Core data models for the resumable upload server.
//!
//! An upload is tracked as an `UploadResource`; its bytes are owned by the
//! storage layer and keyed by the same id.

pub mod metadata;
pub mod upload;

pub use metadata::{MetadataError, UploadMetadata};
pub use upload::{UploadLength, UploadResource};
