//! # Rentflow Testing
//!
//! Testing utilities for the Rentflow services.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - In-memory implementations of every port in `rentflow_core::ports`
//! - [`InMemoryChangeStream`] with per-group offsets and redelivery
//! - [`MockPaymentGateway`] with scripted failures
//!
//! ## Example
//!
//! ```ignore
//! use rentflow_testing::{InMemoryReservationStore, InMemoryVehicleCatalog, ManualClock};
//!
//! #[tokio::test]
//! async fn booking_is_pending() {
//!     let clock = ManualClock::at("2025-06-01T10:00:00Z");
//!     let store = InMemoryReservationStore::new();
//!     let catalog = InMemoryVehicleCatalog::new().with_vehicle(VehicleId::new(1), Money::from_units(50));
//!     // ...
//! }
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)] // Lock poisoning only happens after a test already panicked

mod analytics;
mod catalog;
mod dead_letters;
mod gateway;
mod offsets;
mod payments;
mod reservations;
mod stream;

use chrono::{DateTime, Utc};
use rentflow_core::environment::Clock;

/// Mock implementations of Environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use chrono::Duration;
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use rentflow_testing::mocks::FixedClock;
    /// use rentflow_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock the test moves by hand. Clones share the same time.
    ///
    /// # Example
    ///
    /// ```
    /// use rentflow_testing::mocks::ManualClock;
    /// use rentflow_core::environment::Clock;
    /// use chrono::Duration;
    ///
    /// let clock = ManualClock::at("2025-06-01T10:00:00Z");
    /// let start = clock.now();
    /// clock.advance(Duration::minutes(31));
    /// assert_eq!(clock.now() - start, Duration::minutes(31));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Start at an RFC 3339 timestamp.
        #[must_use]
        pub fn at(rfc3339: &str) -> Self {
            Self::new(parse(rfc3339))
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap() = time;
        }

        /// Move forward by `by`.
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.lock().unwrap();
            *time += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Parse an RFC 3339 timestamp into UTC.
    #[must_use]
    pub fn parse(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(parse("2025-01-01T00:00:00Z"))
    }
}

/// Install a `tracing` subscriber that writes to the test harness.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use analytics::InMemoryAnalyticsStore;
pub use catalog::InMemoryVehicleCatalog;
pub use dead_letters::{InMemoryDeadLetters, RecordedDeadLetter};
pub use gateway::MockPaymentGateway;
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use payments::InMemoryPaymentStore;
pub use reservations::InMemoryReservationStore;
pub use stream::InMemoryChangeStream;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::at("2025-06-01T10:00:00Z");
        let handle = clock.clone();
        handle.advance(Duration::minutes(30));
        assert_eq!(clock.now(), mocks::parse("2025-06-01T10:30:00Z"));
    }
}
