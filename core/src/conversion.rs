//! Conversion Postback Handler.
//!
//! Validation order is fixed: api key, click existence, click ownership,
//! event type. Every rejection happens before any write. Accepted postbacks
//! are deduplicated on an idempotency key derived from the click id, the event
//! type and an optional caller-supplied nonce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{MarketplaceError, MarketplaceResult};
use crate::store::{ConversionInsert, MarketplaceStore};
use crate::types::{Advertiser, CampaignEvent, ConversionEvent, ConversionType, EventType};
use crate::webhook::WebhookQueue;

/// Postback body as sent by the advertiser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostbackRequest {
    pub click_id: String,
    pub event_type: String,
    #[serde(default)]
    pub conversion_value_cents: Option<i64>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedConversion {
    pub conversion_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// True when the postback repeated an already recorded conversion
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_delivery_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct ConversionHandler {
    store: Arc<dyn MarketplaceStore>,
    webhooks: WebhookQueue,
}

impl ConversionHandler {
    pub fn new(store: Arc<dyn MarketplaceStore>, webhooks: WebhookQueue) -> Self {
        Self { store, webhooks }
    }

    /// Records one advertiser postback. `nonce` is the optional
    /// `Idempotency-Key` supplied by the caller.
    #[instrument(skip(self, api_key, request), fields(click_id = %request.click_id))]
    pub async fn record(
        &self,
        api_key: Option<&str>,
        request: PostbackRequest,
        nonce: Option<&str>,
    ) -> MarketplaceResult<RecordedConversion> {
        let advertiser = self.authenticate(api_key).await?;

        if request.click_id.trim().is_empty() {
            return Err(MarketplaceError::validation("click_id is required"));
        }
        let click = self
            .store
            .get_click(&request.click_id)
            .await?
            .ok_or_else(|| MarketplaceError::not_found(format!("click {}", request.click_id)))?;

        if click.advertiser_slug != advertiser.slug {
            warn!(
                caller = %advertiser.slug,
                owner = %click.advertiser_slug,
                "Rejected cross-tenant conversion postback"
            );
            metrics::increment_counter!("marketplace_postbacks_rejected_total", "reason" => "cross_tenant");
            return Err(MarketplaceError::Forbidden(
                "click belongs to a different advertiser".into(),
            ));
        }

        let event_type: ConversionType = request.event_type.parse()?;
        if request.conversion_value_cents.map_or(false, |v| v < 0) {
            return Err(MarketplaceError::validation(
                "conversion_value_cents must not be negative",
            ));
        }

        let conversion = ConversionEvent {
            id: Uuid::new_v4(),
            click_id: click.click_id.clone(),
            advertiser_slug: advertiser.slug.clone(),
            campaign_id: click.campaign_id,
            event_type,
            value_cents: request.conversion_value_cents,
            metadata: request.metadata.unwrap_or(serde_json::Value::Null),
            idempotency_key: idempotency_key(&click.click_id, event_type, nonce),
            created_at: Utc::now(),
        };

        let value = conversion.value_cents.unwrap_or(0);
        let mut event = CampaignEvent::new(
            EventType::Conversion,
            conversion.campaign_id,
            Some(advertiser.slug.clone()),
            value,
            Some(conversion.click_id.clone()),
            click.placement,
        );
        event.occurred_at = conversion.created_at;

        let delivery = match advertiser.webhook_url.as_deref() {
            Some(url) => Some(self.webhooks.new_delivery(
                &conversion.advertiser_slug,
                url,
                webhook_payload(&conversion),
            )?),
            None => None,
        };
        let delivery_id = delivery.as_ref().map(|d| d.id);

        // Conversion, event, rollup counter and delivery commit together, so a
        // failed attempt leaves nothing behind and the retry is not a duplicate.
        let conversion = match self
            .store
            .record_conversion(conversion, event, delivery)
            .await?
        {
            ConversionInsert::Inserted(conversion) => conversion,
            ConversionInsert::Duplicate(existing) => {
                info!(conversion = %existing.id, "Duplicate postback suppressed");
                metrics::increment_counter!("marketplace_postbacks_duplicate_total");
                return Ok(RecordedConversion {
                    conversion_id: existing.id,
                    created_at: existing.created_at,
                    duplicate: true,
                    webhook_delivery_id: None,
                });
            }
        };
        if let Some(id) = delivery_id {
            info!(delivery = %id, advertiser = %advertiser.slug, "Webhook delivery queued");
        }

        metrics::increment_counter!("marketplace_conversions_total", "event_type" => event_type.as_str());
        info!(
            conversion = %conversion.id,
            advertiser = %advertiser.slug,
            event_type = %event_type,
            "Conversion recorded"
        );

        Ok(RecordedConversion {
            conversion_id: conversion.id,
            created_at: conversion.created_at,
            duplicate: false,
            webhook_delivery_id: delivery_id,
        })
    }

    /// Resolves an api key to an active advertiser.
    pub async fn authenticate(&self, api_key: Option<&str>) -> MarketplaceResult<Advertiser> {
        let api_key = api_key
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| MarketplaceError::Unauthorized("missing api key".into()))?;

        self.store
            .find_advertiser_by_api_key(api_key)
            .await?
            .filter(|advertiser| advertiser.is_active())
            .ok_or_else(|| MarketplaceError::Unauthorized("invalid api key".into()))
    }
}

/// Outbound webhook body for a conversion.
pub fn webhook_payload(conversion: &ConversionEvent) -> serde_json::Value {
    serde_json::json!({
        "event": "conversion",
        "conversion_id": conversion.id,
        "click_id": conversion.click_id,
        "event_type": conversion.event_type,
        "conversion_value_cents": conversion.value_cents,
        "metadata": conversion.metadata,
        "timestamp": conversion.created_at.to_rfc3339(),
    })
}

/// `sha256(click_id:event_type:nonce)`, hex encoded.
pub fn idempotency_key(click_id: &str, event_type: ConversionType, nonce: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(click_id.as_bytes());
    hasher.update(b":");
    hasher.update(event_type.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(nonce.unwrap_or("").trim().as_bytes());
    hex::encode(hasher.finalize())
}
