use anyhow::{Context, Result};
use chunk_ingest::{
    app, config, db,
    services::{artifact_registry::SqliteArtifactRegistry, upload_service::UploadService},
};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting chunk-ingest with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core service ---
    let registry = Arc::new(SqliteArtifactRegistry::new(db.clone()));
    let service = UploadService::new(&cfg.storage_dir, registry, cfg.limits())
        .await
        .with_context(|| format!("preparing storage directory {}", cfg.storage_dir))?;

    // Nothing survives a restart in memory, so staging on disk is unreachable.
    service
        .purge_orphans()
        .await
        .context("purging orphaned staging data")?;
    let sweeper = service.spawn_sweeper(cfg.sweep_interval);

    // --- Build router ---
    let app = app(service);

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

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
