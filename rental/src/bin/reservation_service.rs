//! Reservation service.
//!
//! Bookings over HTTP, the reservation outbox relay, the confirmation consumer and the
//! expiration sweeper.

use rental::bootstrap::{self, start_reservation_service};
use rental::config::Config;
use rentflow_postgres::{PostgresReservationStore, PostgresVehicleCatalog, ServiceDatabase};
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
        "Starting reservation service"
    );

    let pool = bootstrap::prepare(&config, ServiceDatabase::Reservation).await?;
    let shared = bootstrap::production_ports(&config, &pool)?;
    let store = Arc::new(PostgresReservationStore::new(pool.clone()));

    let (shutdown, _) = broadcast::channel(1);
    let running = start_reservation_service(
        &config,
        &shared,
        Arc::<PostgresReservationStore>::clone(&store),
        store,
        Arc::new(PostgresVehicleCatalog::new(pool)),
        &shutdown,
    );

    bootstrap::run_until_shutdown(&config, running, shutdown).await?;
    info!("Reservation service stopped");
    Ok(())
}
