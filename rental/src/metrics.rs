//! Business and pipeline metrics.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `rentflow_reservations_total{status}`: reservations entering a status
//! - `rentflow_reservations_expired_total`: reservations expired by the sweeper
//! - `rentflow_payments_total{status}`: payments entering a status
//! - `rentflow_payments_completed_total`: completions committed with a capture fact
//! - `rentflow_saga_messages_total{consumer,outcome}`: consumer outcomes
//! - `rentflow_terminal_conflicts_total{consumer}`: late facts against terminal reservations
//! - `rentflow_outbox_relayed_total{topic}`: outbox rows published
//! - `rentflow_outbox_purged_total`: relayed rows removed by retention
//! - `rentflow_dead_letters_total{consumer}`: messages dead-lettered
//! - `rentflow_dead_letters_resolved_total`: dead letters resolved by an operator

use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Register metric descriptions. Call once at startup.
pub fn register_metrics() {
    describe_counter!(
        "rentflow_reservations_total",
        "Reservations entering a status (PENDING, CONFIRMED, PICKED_UP, COMPLETED, CANCELLED, EXPIRED)"
    );
    describe_counter!(
        "rentflow_reservations_expired_total",
        "Reservations expired by the sweeper"
    );
    describe_counter!("rentflow_payments_total", "Payments entering a status");
    describe_counter!(
        "rentflow_payments_completed_total",
        "Payments completed together with their capture fact"
    );
    describe_counter!(
        "rentflow_saga_messages_total",
        "Saga messages by consumer and outcome (applied, retry, dead_letter)"
    );
    describe_counter!(
        "rentflow_terminal_conflicts_total",
        "Late saga facts refused by a terminal reservation"
    );
    describe_counter!("rentflow_outbox_relayed_total", "Outbox rows published");
    describe_counter!(
        "rentflow_outbox_purged_total",
        "Relayed outbox rows removed by the retention policy"
    );
    describe_counter!("rentflow_dead_letters_total", "Messages dead-lettered");
    describe_counter!(
        "rentflow_dead_letters_resolved_total",
        "Dead letters resolved by an operator"
    );

    tracing::info!("Metrics registered");
}

/// Install the Prometheus exporter, listening on `addr`.
///
/// # Errors
///
/// Returns an error if the listener cannot be installed.
pub fn install_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}

/// A reservation entered `status`.
pub fn record_reservation_status(status: &'static str) {
    metrics::counter!("rentflow_reservations_total", "status" => status).increment(1);
}

/// A payment entered `status`.
pub fn record_payment_status(status: &'static str) {
    metrics::counter!("rentflow_payments_total", "status" => status).increment(1);
}

/// A payment completed together with its capture fact.
pub fn record_payment_completed() {
    metrics::counter!("rentflow_payments_completed_total").increment(1);
}

/// The sweeper expired a reservation.
pub fn record_reservation_expired() {
    metrics::counter!("rentflow_reservations_expired_total").increment(1);
}

/// The relay published an outbox row on `topic`.
pub fn record_outbox_relayed(topic: &str) {
    metrics::counter!("rentflow_outbox_relayed_total", "topic" => topic.to_string()).increment(1);
}

/// The relay purged `count` relayed rows.
pub fn record_outbox_purged(count: u64) {
    metrics::counter!("rentflow_outbox_purged_total").increment(count);
}

/// A saga consumer finished a message.
pub fn record_saga_outcome(consumer: &str, outcome: &'static str) {
    metrics::counter!(
        "rentflow_saga_messages_total",
        "consumer" => consumer.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// A late fact hit a terminal reservation.
pub fn record_terminal_conflict(consumer: &str) {
    metrics::counter!("rentflow_terminal_conflicts_total", "consumer" => consumer.to_string())
        .increment(1);
}
