//! Provider selection: turns configuration into a wired `TusProcessor`.

use crate::{
    config::{AppConfig, TrackerKind},
    services::{
        events::EventHooks,
        lock::InMemoryUploadLocker,
        processor::TusProcessor,
        storage::LocalDiskStorage,
        tracker::{InMemoryUploadTracker, SqliteUploadTracker, UploadTracker},
    },
};
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::{path::Path, str::FromStr, sync::Arc};

/// Open (creating if needed) the SQLite database behind `database_url`.
pub async fn connect_sqlite(database_url: &str) -> Result<Arc<SqlitePool>> {
    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory if needed
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database url {}", database_url))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {}", database_url))?;
    Ok(Arc::new(pool))
}

/// Build the tracker selected by `cfg.tracker`, migrating SQL schemas.
pub async fn build_tracker(cfg: &AppConfig) -> Result<Arc<dyn UploadTracker>> {
    let retention = cfg.tus.expiration;
    match cfg.tracker {
        TrackerKind::Memory => Ok(Arc::new(InMemoryUploadTracker::new(retention))),
        TrackerKind::Sqlite => {
            let db = connect_sqlite(&cfg.database_url).await?;
            let tracker = SqliteUploadTracker::new(db, retention);
            tracker.migrate().await.context("migrating upload tracker schema")?;
            Ok(Arc::new(tracker))
        }
    }
}

/// Wire tracker, storage, locker and callbacks into a processor.
pub async fn build_processor(cfg: &AppConfig, events: EventHooks) -> Result<TusProcessor> {
    let tracker = build_tracker(cfg).await?;
    let storage = LocalDiskStorage::open(&cfg.storage_dir)
        .await
        .with_context(|| format!("opening upload directory {}", cfg.storage_dir))?;
    tracing::info!(
        "Using {:?} tracker and local storage at {}",
        cfg.tracker,
        storage.base_path.display()
    );

    Ok(TusProcessor::new(
        cfg.tus.clone(),
        tracker,
        Arc::new(storage),
        Arc::new(InMemoryUploadLocker::new()),
        events,
    ))
}
