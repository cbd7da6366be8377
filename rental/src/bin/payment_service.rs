//! Payment service.
//!
//! Gateway orders and captures over HTTP, the capture-fact relay, the completion
//! consumer and the release consumer.

use rental::bootstrap::{self, start_payment_service};
use rental::config::Config;
use rental::directory::HttpReservationDirectory;
use rental::gateway::PayPalGateway;
use rentflow_postgres::{PostgresPaymentStore, ServiceDatabase};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    bootstrap::init_tracing("rental=info,rentflow_postgres=info,rentflow_redpanda=info");

    info!(
        brokers = %config.redpanda.brokers,
        gateway = %config.gateway.base_url,
        reservations = %config.directory.base_url,
        port = config.server.port,
        "Starting payment service"
    );

    let gateway = PayPalGateway::new(config.gateway.clone())?;
    let directory = HttpReservationDirectory::new(&config.directory)?;
    let pool = bootstrap::prepare(&config, ServiceDatabase::Payment).await?;
    let shared = bootstrap::production_ports(&config, &pool)?;
    let store = Arc::new(PostgresPaymentStore::new(pool));

    let (shutdown, _) = broadcast::channel(1);
    let running = start_payment_service(
        &config,
        &shared,
        Arc::<PostgresPaymentStore>::clone(&store),
        store,
        Arc::new(directory),
        Arc::new(gateway),
        &shutdown,
    );

    bootstrap::run_until_shutdown(&config, running, shutdown).await?;
    info!("Payment service stopped");
    Ok(())
}
