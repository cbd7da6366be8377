//! Error taxonomy shared by every service.
//!
//! [`RentalError`] is what services return to callers. Each variant maps to one
//! [`ErrorKind`], which decides how the error travels:
//!
//! | Kind | Synchronous caller | Saga consumer |
//! |---|---|---|
//! | `Validation` | 422 | dead-letter |
//! | `Conflict` | 409 | dead-letter (terminal conflicts never reach here) |
//! | `NotFound` | 404 | dead-letter |
//! | `Transient` | 503 | retry after backoff |
//!
//! [`StoreError`] is what persistence ports return; it converts into [`RentalError`].

use crate::lifecycle::LifecycleError;
use thiserror::Error;

/// Classification used by transports (HTTP status, consumer outcome).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or constraint-violating input; never retried.
    Validation,
    /// Overlap, duplicate active payment, terminal conflict on a staff command.
    Conflict,
    /// Referenced entity does not exist.
    NotFound,
    /// Infrastructure failure; safe to retry.
    Transient,
}

/// Errors returned by services.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RentalError {
    /// Input rejected before any state mutation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Request collides with existing state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Entity not found by its business key.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity type (e.g. "reservation")
        entity: &'static str,
        /// Business key that was looked up
        id: String,
    },

    /// Database, stream or gateway unavailable.
    #[error("Transient failure: {0}")]
    Transient(String),
}

impl RentalError {
    /// Convenience constructor for [`RentalError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Transient(_) => ErrorKind::Transient,
        }
    }

    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors returned by persistence ports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Row not found
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity type
        entity: &'static str,
        /// Key that was looked up
        id: String,
    },

    /// Constraint violation (overlap, unique index)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Connection, lock timeout or commit failure
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Stored data could not be decoded
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// State machine refused the transition
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl StoreError {
    /// Convenience constructor for [`StoreError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<StoreError> for RentalError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::Conflict(reason) => Self::Conflict(reason),
            StoreError::Unavailable(reason) => Self::Transient(reason),
            // A row we wrote ourselves no longer decodes; retrying will not help.
            StoreError::Corrupt(reason) => Self::Validation(reason),
            StoreError::Lifecycle(error) => error.into(),
        }
    }
}

impl From<LifecycleError> for RentalError {
    fn from(error: LifecycleError) -> Self {
        match error {
            LifecycleError::Illegal { .. } | LifecycleError::InvalidFacts(_) => {
                Self::Validation(error.to_string())
            },
        }
    }
}
