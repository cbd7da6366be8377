//! Service wiring.
//!
//! Each `start_*` function builds one service from its ports, spawns its background
//! tasks (relay, saga consumers, sweeper) and returns the HTTP router. The binaries pass
//! `PostgreSQL` and Redpanda adapters; tests pass the in-memory ones.

use crate::analytics::AnalyticsService;
use crate::config::Config;
use crate::payments::PaymentService;
use crate::reservations::ReservationService;
use crate::runtime::handlers::{
    ANALYTICS_PAYMENTS, ANALYTICS_RESERVATIONS, AnalyticsPaymentHandler,
    AnalyticsReservationHandler, PAYMENT_COMPLETION, PAYMENT_RELEASE, PaymentCompletionHandler,
    PaymentReleaseHandler, RESERVATION_CONFIRMATION, ReservationConfirmationHandler,
};
use crate::runtime::{ExpirationSweeper, OutboxRelay, SagaConsumer, SagaHandler};
use crate::{metrics, server};
use anyhow::Context;
use axum::Router;
use rentflow_core::environment::{Clock, SystemClock};
use rentflow_core::messages::{
    CAPTURE_COMPLETED_TOPIC, PAYMENT_COMPLETED_TOPIC, RESERVATION_EVENTS_TOPIC,
};
use rentflow_core::ports::{
    AnalyticsStore, DeadLetterSink, OutboxSource, PaymentGateway, PaymentStore,
    ReservationDirectory, ReservationStore, VehicleCatalog,
};
use rentflow_core::stream::ChangeStream;
use rentflow_postgres::{DeadLetterQueue, ServiceDatabase};
use rentflow_redpanda::RedpandaChangeStream;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Collaborators every service needs.
#[derive(Clone)]
pub struct SharedPorts {
    /// Change stream
    pub stream: Arc<dyn ChangeStream>,
    /// Where consumers park permanent failures
    pub dead_letters: Arc<dyn DeadLetterSink>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

/// A started service.
pub struct RunningService {
    /// HTTP routes
    pub router: Router,
    /// Background tasks; they stop on the shutdown signal
    pub tasks: Vec<JoinHandle<()>>,
}

impl RunningService {
    /// Wait for the background tasks, at most `timeout`.
    pub async fn join(self, timeout: Duration) {
        let all = futures::future::join_all(self.tasks);
        if tokio::time::timeout(timeout, all).await.is_err() {
            tracing::warn!(?timeout, "Background tasks did not stop in time");
        }
    }
}

/// Install the tracing subscriber: `RUST_LOG` if set, `default_filter` otherwise.
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Register metrics, start the exporter, connect and migrate the service database.
///
/// # Errors
///
/// Returns an error if the exporter cannot listen or the database is unreachable.
pub async fn prepare(config: &Config, database: ServiceDatabase) -> anyhow::Result<PgPool> {
    metrics::register_metrics();
    metrics::install_exporter(config.server.metrics_addr()?)?;

    let pool = rentflow_postgres::connect(&config.database.url, config.database.max_connections)
        .await
        .context("connecting to PostgreSQL")?;
    rentflow_postgres::migrate(&pool, database)
        .await
        .context("running migrations")?;
    tracing::info!(?database, "Database ready");
    Ok(pool)
}

/// Redpanda stream, `PostgreSQL` dead-letter queue and the system clock.
///
/// # Errors
///
/// Returns an error if the Redpanda producer cannot be created.
pub fn production_ports(config: &Config, pool: &PgPool) -> anyhow::Result<SharedPorts> {
    let stream = RedpandaChangeStream::builder()
        .brokers(config.redpanda.brokers.clone())
        .producer_acks(config.redpanda.producer_acks.clone())
        .build()
        .context("creating Redpanda producer")?;
    tracing::info!(brokers = %config.redpanda.brokers, "Change stream ready");

    Ok(SharedPorts {
        stream: Arc::new(stream),
        dead_letters: Arc::new(DeadLetterQueue::new(pool.clone())),
        clock: Arc::new(SystemClock),
    })
}

/// Serve HTTP until Ctrl+C, then stop the background tasks.
///
/// # Errors
///
/// Returns an error if the HTTP listener fails.
pub async fn run_until_shutdown(
    config: &Config,
    running: RunningService,
    shutdown: broadcast::Sender<()>,
) -> anyhow::Result<()> {
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
        tracing::info!("Shutting down gracefully...");
        let _ = signal.send(());
    });

    let addr = config.server.http_addr()?;
    let served = server::serve(running.router.clone(), addr, shutdown.subscribe()).await;
    // Stop the background tasks even if the listener failed.
    let _ = shutdown.send(());
    running.join(config.server.shutdown_timeout()).await;
    served
}

fn consumer(
    config: &Config,
    shared: &SharedPorts,
    name: &str,
    topics: &[&str],
    handler: Arc<dyn SagaHandler>,
    shutdown: &broadcast::Sender<()>,
) -> JoinHandle<()> {
    SagaConsumer::new(
        name,
        config.consumer_group(name),
        topics,
        Arc::clone(&shared.stream),
        handler,
        Arc::clone(&shared.dead_letters),
        shutdown.subscribe(),
    )
    .with_retry_delay(config.consumer.retry_delay())
    .spawn()
}

fn relay(
    config: &Config,
    shared: &SharedPorts,
    name: &'static str,
    source: Arc<dyn OutboxSource>,
    shutdown: &broadcast::Sender<()>,
) -> JoinHandle<()> {
    OutboxRelay::new(
        name,
        source,
        Arc::clone(&shared.stream),
        Arc::clone(&shared.clock),
    )
    .with_batch_size(config.relay.batch_size)
    .with_retention(config.relay.retention())
    .spawn(config.relay.poll_interval(), shutdown.subscribe())
}

/// Reservation service: HTTP API, reservation outbox relay, confirmation consumer and
/// expiration sweeper.
pub fn start_reservation_service(
    config: &Config,
    shared: &SharedPorts,
    store: Arc<dyn ReservationStore>,
    outbox: Arc<dyn OutboxSource>,
    catalog: Arc<dyn VehicleCatalog>,
    shutdown: &broadcast::Sender<()>,
) -> RunningService {
    let service = Arc::new(ReservationService::new(
        store,
        catalog,
        Arc::clone(&shared.clock),
        config.booking.policy(),
    ));

    let sweeper = ExpirationSweeper::new(
        Arc::clone(&service),
        Arc::clone(&shared.clock),
        config.sweeper.threshold(),
        config.sweeper.batch_size,
    );

    let tasks = vec![
        relay(config, shared, "reservation_outbox", outbox, shutdown),
        consumer(
            config,
            shared,
            RESERVATION_CONFIRMATION,
            &[PAYMENT_COMPLETED_TOPIC],
            Arc::new(ReservationConfirmationHandler::new(Arc::clone(&service))),
            shutdown,
        ),
        sweeper.spawn(config.sweeper.interval(), shutdown.subscribe()),
    ];

    RunningService {
        router: server::reservation_router(service),
        tasks,
    }
}

/// Payment service: HTTP API, capture-fact relay, completion and release consumers.
///
/// `reservations` is how the service reads reservation state before it charges.
pub fn start_payment_service(
    config: &Config,
    shared: &SharedPorts,
    store: Arc<dyn PaymentStore>,
    outbox: Arc<dyn OutboxSource>,
    reservations: Arc<dyn ReservationDirectory>,
    gateway: Arc<dyn PaymentGateway>,
    shutdown: &broadcast::Sender<()>,
) -> RunningService {
    let service = Arc::new(PaymentService::new(
        store,
        reservations,
        gateway,
        Arc::clone(&shared.clock),
    ));

    let tasks = vec![
        relay(config, shared, "capture_events", outbox, shutdown),
        consumer(
            config,
            shared,
            PAYMENT_COMPLETION,
            &[CAPTURE_COMPLETED_TOPIC],
            Arc::new(PaymentCompletionHandler::new(
                Arc::clone(&service),
                Arc::clone(&shared.stream),
            )),
            shutdown,
        ),
        consumer(
            config,
            shared,
            PAYMENT_RELEASE,
            &[RESERVATION_EVENTS_TOPIC],
            Arc::new(PaymentReleaseHandler::new(Arc::clone(&service))),
            shutdown,
        ),
    ];

    RunningService {
        router: server::payment_router(service),
        tasks,
    }
}

/// Analytics service: HTTP API and the two replica consumers.
pub fn start_analytics_service(
    config: &Config,
    shared: &SharedPorts,
    store: Arc<dyn AnalyticsStore>,
    shutdown: &broadcast::Sender<()>,
) -> RunningService {
    let service = Arc::new(AnalyticsService::new(store));

    let tasks = vec![
        consumer(
            config,
            shared,
            ANALYTICS_RESERVATIONS,
            &[RESERVATION_EVENTS_TOPIC],
            Arc::new(AnalyticsReservationHandler::new(Arc::clone(&service))),
            shutdown,
        ),
        consumer(
            config,
            shared,
            ANALYTICS_PAYMENTS,
            &[PAYMENT_COMPLETED_TOPIC],
            Arc::new(AnalyticsPaymentHandler::new(Arc::clone(&service))),
            shutdown,
        ),
    ];

    RunningService {
        router: server::analytics_router(service),
        tasks,
    }
}
