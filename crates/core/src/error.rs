use std::time::Duration;
use thiserror::Error;

/// Failure talking to the market-data provider.
///
/// A timeout is its own variant so callers never confuse it with an empty series.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{dataset} request timed out after {after:?}")]
    Timeout { dataset: String, after: Duration },

    #[error("{dataset} request failed: {detail}")]
    Network { dataset: String, detail: String },

    #[error("{dataset} returned HTTP {status}: {body}")]
    HttpStatus {
        dataset: String,
        status: u16,
        body: String,
    },

    #[error("{dataset} API error: {message}")]
    Api { dataset: String, message: String },

    #[error("{dataset} response could not be decoded: {detail}")]
    Decode { dataset: String, detail: String },

    #[error("{dataset} returned no rows")]
    Empty { dataset: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }
}

/// Why a valuation model produced no usable result.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("input unavailable: {0}")]
    Unavailable(#[from] FetchError),

    #[error("model failed: {0:#}")]
    Failed(anyhow::Error),
}

/// An external classification/weight proposal failed validation.
#[derive(Debug, Clone, Error)]
#[error("proposal rejected ({} violation(s)): {}", .errors.len(), .errors.join("; "))]
pub struct GuardrailViolation {
    pub errors: Vec<String>,
}
