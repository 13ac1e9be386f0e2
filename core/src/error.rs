//! Error types for marketplace domain operations.

use thiserror::Error;

/// Errors raised by the wallet, auction, attribution, conversion and
/// reconciliation services.
#[derive(Debug, Error)]
pub enum MarketplaceError {
    /// Missing or unknown credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated caller is not allowed to touch the resource
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed input; rejected with no side effects
    #[error("Validation error: {0}")]
    Validation(String),

    /// Campaign or advertiser state machine violation
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Uniqueness violations (duplicate slug, duplicate api key)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Backing store unavailable or failed mid-operation
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Delivery error: {0}")]
    Delivery(String),
}

impl MarketplaceError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Returns true when a retry of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Delivery(_))
    }
}

impl From<serde_json::Error> for MarketplaceError {
    fn from(err: serde_json::Error) -> Self {
        MarketplaceError::Validation(format!("Serialization error: {}", err))
    }
}

/// Result alias for marketplace operations
pub type MarketplaceResult<T> = Result<T, MarketplaceError>;
