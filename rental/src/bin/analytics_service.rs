//! Analytics service.
//!
//! Replica consumers and the revenue summary over HTTP.

use rental::bootstrap::{self, start_analytics_service};
use rental::config::Config;
use rentflow_postgres::{PostgresAnalyticsStore, ServiceDatabase};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    bootstrap::init_tracing("rental=info,rentflow_postgres=info,rentflow_redpanda=info");

    info!(
        brokers = %config.redpanda.brokers,
        port = config.server.port,
        "Starting analytics service"
    );

    let pool = bootstrap::prepare(&config, ServiceDatabase::Analytics).await?;
    let shared = bootstrap::production_ports(&config, &pool)?;

    let (shutdown, _) = broadcast::channel(1);
    let running = start_analytics_service(
        &config,
        &shared,
        Arc::new(PostgresAnalyticsStore::new(pool)),
        &shutdown,
    );

    bootstrap::run_until_shutdown(&config, running, shutdown).await?;
    info!("Analytics service stopped");
    Ok(())
}
