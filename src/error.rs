//! Error taxonomy for the batch planner.
//!
//! External degradation ([`ProviderError`]) never escapes a component: every
//! caller converts it into the matching fallback path. Store failures
//! ([`StoreError`]) are scoped to the batch being written. Only
//! [`PlannerError`] aborts a whole run.

use thiserror::Error;

/// Failure talking to an external collaborator (geocoding, routing, AI, notifications).
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The collaborator has no credentials or endpoint configured.
    #[error("{0} is not configured")]
    Unconfigured(&'static str),

    /// The HTTP request could not be sent or timed out.
    #[error("{service} request failed: {source}")]
    Http {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The service answered with a non-success HTTP status.
    #[error("{service} returned HTTP status {status}")]
    Status { service: &'static str, status: u16 },

    /// The service answered 2xx but reported an application-level error code.
    #[error("{service} returned code {code}")]
    Code { service: &'static str, code: String },

    /// The service answered successfully with an empty result set.
    #[error("{0} returned no results")]
    Empty(&'static str),

    /// The response body did not match the expected shape.
    #[error("failed to decode {service} response: {message}")]
    Decode {
        service: &'static str,
        message: String,
    },

    /// The request was rejected before reaching the service.
    #[error("invalid request: {0}")]
    InvalidInput(String),
}

impl ProviderError {
    pub(crate) fn from_reqwest(service: &'static str, err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Status {
                service,
                status: status.as_u16(),
            },
            None if err.is_decode() => Self::Decode {
                service,
                message: err.to_string(),
            },
            None => Self::Http {
                service,
                source: err,
            },
        }
    }
}

/// Failure reading from or writing to a store collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{operation} failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn backend(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            operation,
            message: message.into(),
        }
    }
}

/// Run-level failure. Everything else is reported inside the run result.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("cannot read pending orders: {0}")]
    PendingOrders(#[source] StoreError),

    #[error("cannot build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
