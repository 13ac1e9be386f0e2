use marketplace_core::MarketplaceError;
use std::time::Duration;
use thiserror::Error;

/// Why a single POST to an advertiser endpoint did not count as delivered.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("endpoint did not answer within {0:?}")]
    Timeout(Duration),

    /// Any non-2xx answer
    #[error("endpoint answered with status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<DeliveryError> for MarketplaceError {
    fn from(err: DeliveryError) -> Self {
        MarketplaceError::Delivery(err.to_string())
    }
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;
