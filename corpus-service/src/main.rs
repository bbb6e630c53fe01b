use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::{info, warn};

mod api;
mod config;
mod db;
mod error;
mod events;
mod i18n;
mod inference;
mod jobs;
mod pipeline;
mod service;
mod status;
mod storage;
#[cfg(test)]
mod testing;

use crate::config::{RuntimeConfig, load_static_config};
use crate::db::Database;
use crate::inference::HttpInference;
use crate::service::CorpusService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    info!("Starting corpus service v{}", env!("CARGO_PKG_VERSION"));

    // Static configuration tells us where the database lives
    let static_config = load_static_config()?;
    info!(
        host = %static_config.server.host,
        port = static_config.server.port,
        "Static configuration loaded"
    );

    std::fs::create_dir_all(&static_config.storage.data_dir)?;

    let db_path = static_config.storage.data_dir.join("corpus.db");
    let db = Arc::new(Database::open(&db_path)?);
    info!(path = %db_path.display(), "Database initialized");

    // Runtime config (static + dynamic with DB overrides)
    let runtime_config = Arc::new(RuntimeConfig::load(static_config, &db)?);
    info!("Runtime configuration loaded with DB settings");

    let metrics = PrometheusBuilder::new().install_recorder()?;

    let inference = Arc::new(HttpInference::new(&runtime_config.dynamic().inference)?);
    let service = Arc::new(CorpusService::new(db, runtime_config.clone(), inference)?);

    // Jobs left running by a previous process go back through the retry policy
    match service.recover_interrupted_jobs() {
        Ok(count) if count > 0 => info!(count, "Recovered interrupted jobs"),
        Err(e) => warn!(error = %e, "Interrupted job recovery failed"),
        _ => {}
    }

    let workers = CorpusService::start_workers(service.clone());
    let retention = CorpusService::start_retention_task(service.clone());

    let app = api::router(service.clone(), metrics);

    let addr = format!(
        "{}:{}",
        runtime_config.static_config.server.host, runtime_config.static_config.server.port
    );
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down workers");
    service.shutdown();
    for worker in workers.into_iter().chain(std::iter::once(retention)) {
        if let Err(e) = worker.await {
            warn!(error = %e, "Worker exited abnormally");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("corpus_service=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().event_format(format))
        .with(filter)
        .init();
}
