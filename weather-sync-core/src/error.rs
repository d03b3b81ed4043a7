use thiserror::Error;

use crate::model::DataKind;

/// What went wrong talking to the weather provider.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderFailure {
    #[error("request timed out")]
    Timeout,

    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// A failed provider call, tagged with the location it was made for.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("weather provider request for '{location}' failed: {failure}")]
pub struct ProviderError {
    pub location: String,
    pub failure: ProviderFailure,
}

impl ProviderError {
    pub fn new(location: impl Into<String>, failure: ProviderFailure) -> Self {
        Self { location: location.into(), failure }
    }

    pub(crate) fn from_reqwest(location: &str, err: reqwest::Error) -> Self {
        let failure = if err.is_timeout() {
            ProviderFailure::Timeout
        } else if err.is_decode() {
            ProviderFailure::Malformed(err.to_string())
        } else {
            ProviderFailure::Transport(err.to_string())
        };
        Self::new(location, failure)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("record store I/O failed: {0}")]
    Io(String),

    #[error("record store serialization failed: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Failure of a coordinated fetch-and-merge. Cloned to every waiter.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{kind} record for '{location}' rejected: {reason}")]
    Rejected {
        location: String,
        kind: DataKind,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{kind} refresh for '{location}' aborted: {reason}")]
    Aborted {
        location: String,
        kind: DataKind,
        reason: String,
    },
}

/// Errors surfaced by the query service to its host.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServiceError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("no {kind} data available for '{location}'")]
    NotFound { location: String, kind: DataKind },

    #[error("weather provider unavailable: {0}")]
    ProviderUnavailable(ProviderError),

    #[error(transparent)]
    Store(StoreError),
}

impl ServiceError {
    /// HTTP status a host should answer with. Missing data is reported as
    /// unavailable: the caller cannot tell "no data" from "fetch failed".
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::BadRequest(_) => 400,
            ServiceError::NotFound { .. } | ServiceError::ProviderUnavailable(_) => 503,
            ServiceError::Store(_) => 500,
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        ServiceError::Store(err)
    }
}

impl From<RefreshError> for ServiceError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::Provider(e) => ServiceError::ProviderUnavailable(e),
            RefreshError::Store(e) => ServiceError::Store(e),
            RefreshError::Rejected { location, kind, reason }
            | RefreshError::Aborted { location, kind, reason } => {
                ServiceError::ProviderUnavailable(ProviderError::new(
                    location,
                    ProviderFailure::Malformed(format!("{kind}: {reason}")),
                ))
            }
        }
    }
}
