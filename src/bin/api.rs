use atomic_ops::{api::start_server, oracle, store, AtomicBridge, PipelineConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = PipelineConfig::from_env()?;
    let api_port = config.api_port;

    info!("Atomic Operations Pipeline - API Server");
    info!(
        port = api_port,
        database_url = %config.database_url,
        mode = %config.verification_mode,
        "Configuration loaded"
    );

    let pool = store::connect(&config.database_url).await?;
    let oracle = oracle::from_config(&config)?;
    let bridge = Arc::new(AtomicBridge::new(pool, config, oracle));

    info!("Bridge initialized, starting API server");

    start_server(bridge, api_port).await?;

    Ok(())
}
