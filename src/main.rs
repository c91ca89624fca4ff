use anyhow::Result;
use axum::Router;
use std::{io::ErrorKind, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tus_server::{
    config::AppConfig,
    services::{
        TusProcessor, bootstrap,
        events::EventHooks,
        tracker::SqliteUploadTracker,
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting tus-server with config: {:?}", cfg);

    // --- Handle migration mode ---
    if migrate {
        let db = bootstrap::connect_sqlite(&cfg.database_url).await?;
        SqliteUploadTracker::new(db, cfg.tus.expiration)
            .migrate()
            .await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize engine ---
    let processor = bootstrap::build_processor(&cfg, lifecycle_logging()).await?;
    spawn_expiry_sweep(processor.clone(), cfg.sweep_interval_secs);

    // --- Build router ---
    let app: Router = tus_server::app(&cfg.base_path, processor);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!(
        "Server listening on http://{}{}",
        listener.local_addr()?,
        cfg.base_path
    );
    axum::serve(listener, app).await?;

    Ok(())
}

/// Default callbacks: record upload lifecycle transitions in the log.
fn lifecycle_logging() -> EventHooks {
    EventHooks::new()
        .on_complete(|event| async move {
            tracing::info!(
                "upload {} finished: {} bytes, metadata {:?}",
                event.upload.id,
                event.upload.offset,
                event.upload.metadata.entries
            );
            anyhow::Ok(())
        })
        .on_terminate(|event| async move {
            tracing::info!("upload {} terminated by client", event.upload.id);
            anyhow::Ok(())
        })
}

/// Periodically drop uploads whose expiry window has lapsed.
fn spawn_expiry_sweep(processor: TusProcessor, every_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(every_secs));
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match processor.sweep_expired().await {
                Ok(removed) if !removed.is_empty() => {
                    tracing::debug!("expiry sweep removed {:?}", removed);
                }
                Ok(_) => {}
                Err(err) => tracing::warn!("expiry sweep failed: {}", err),
            }
        }
    });
}
