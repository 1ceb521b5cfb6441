//! Corral fleet service binary.
//!
//! Runs the HTTP API over a PostgreSQL store and the configured artifact
//! storage backend.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use corral_fleet::api::{self, AppState};
use corral_fleet::{
    create_object_store, ConvergenceEngine, DeviceRegistry, FleetConfig, FleetStore,
    PostgresStore, RolloutEngine, TelemetryLedger,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("corral_fleet=info".parse()?))
        .init();

    info!("corral fleet service starting");

    // Load configuration
    let config = FleetConfig::load().unwrap_or_else(|e| {
        info!(error = %e, "failed to load config, using defaults");
        FleetConfig::default()
    });

    info!(
        listen = %config.server.listen,
        database = %config.database.url,
        "configuration loaded"
    );

    // Connect storage backends
    let store: Arc<dyn FleetStore> = Arc::new(
        PostgresStore::new(&config.database.url, config.database.max_connections).await?,
    );
    let blobs = create_object_store(&config.artifacts)?;

    // Wire the engines
    let state = AppState {
        store: Arc::clone(&store),
        convergence: Arc::new(ConvergenceEngine::new(Arc::clone(&store))),
        rollout: Arc::new(RolloutEngine::new(Arc::clone(&store), blobs)),
        registry: Arc::new(DeviceRegistry::new(Arc::clone(&store))),
        ledger: Arc::new(TelemetryLedger::new(store)),
    };

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(config.server.listen).await?;

    info!(addr = %config.server.listen, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
