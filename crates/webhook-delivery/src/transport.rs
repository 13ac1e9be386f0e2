//! Outbound HTTP for webhook attempts.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{DeliveryError, DeliveryResult};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the delivery id so receivers can drop replays.
pub const DELIVERY_ID_HEADER: &str = "X-Marketplace-Delivery";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// POSTs `payload` as JSON. `Ok` only for a 2xx answer within the timeout.
    async fn post(
        &self,
        delivery_id: Uuid,
        url: &str,
        payload: &serde_json::Value,
    ) -> DeliveryResult<()>;
}

#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> DeliveryResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("broker-marketplace-webhooks/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| DeliveryError::Transport(err.to_string()))?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl WebhookTransport for ReqwestTransport {
    #[instrument(skip(self, payload))]
    async fn post(
        &self,
        delivery_id: Uuid,
        url: &str,
        payload: &serde_json::Value,
    ) -> DeliveryResult<()> {
        let response = self
            .client
            .post(url)
            .header(DELIVERY_ID_HEADER, delivery_id.to_string())
            .json(payload)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    DeliveryError::Timeout(self.timeout)
                } else {
                    DeliveryError::Transport(err.to_string())
                }
            })?;

        let status = response.status();
        debug!(status = status.as_u16(), "Webhook endpoint answered");
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status(status.as_u16()))
        }
    }
}
