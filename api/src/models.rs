//! API request and response models
//!
//! Core domain types (`Winner`, `JobSummary`, `Wallet`, ...) serialize as-is;
//! the structures here cover query strings and request bodies.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use marketplace_core::advertisers::NewAdvertiser;
use marketplace_core::auction::Winner;
use marketplace_core::frequency_cap::ImpressionHistory;
use marketplace_core::types::{
    AdvertiserStatus, Campaign, CampaignId, Cents, InventoryType, Placement, SponsorshipTier,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

/// Upper bound on `seen` entries accepted from a client.
pub const MAX_SEEN_ENTRIES: usize = 200;

/// Upper bound on campaign ids per impression report.
pub const MAX_IMPRESSIONS_PER_REPORT: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub struct WinnersQuery {
    pub limit: Option<usize>,
    /// Per-window impression cap override; 0 disables capping
    pub cap: Option<u32>,
    /// Client-held history as `<campaign_id>:<unix_seconds>` pairs, comma separated
    pub seen: Option<String>,
}

impl WinnersQuery {
    /// Parses `seen` into a history for `placement`. Malformed entries are a
    /// client error rather than silently ignored.
    pub fn impression_history(&self, placement: Placement) -> ApiResult<ImpressionHistory> {
        let mut history = ImpressionHistory::new();
        let Some(raw) = self.seen.as_deref() else {
            return Ok(history);
        };

        let entries: Vec<&str> = raw
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .collect();
        if entries.len() > MAX_SEEN_ENTRIES {
            return Err(ApiError::validation(
                format!("seen accepts at most {} entries", MAX_SEEN_ENTRIES),
                Some("seen".to_string()),
            ));
        }

        for entry in entries {
            let (id, ts) = entry.split_once(':').ok_or_else(|| {
                ApiError::validation(format!("malformed seen entry '{}'", entry), Some("seen".to_string()))
            })?;
            let campaign_id: CampaignId = id.parse().map_err(|_| {
                ApiError::validation(format!("malformed campaign id '{}'", id), Some("seen".to_string()))
            })?;
            let seen_at: DateTime<Utc> = ts
                .parse::<i64>()
                .ok()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                .ok_or_else(|| {
                    ApiError::validation(format!("malformed timestamp '{}'", ts), Some("seen".to_string()))
                })?;
            history.record(placement, campaign_id, seen_at);
        }
        Ok(history)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WinnersResponse {
    pub placement: Placement,
    pub day: NaiveDate,
    pub winners: Vec<Winner>,
}

#[derive(Debug, Deserialize)]
pub struct ImpressionReport {
    pub placement: Placement,
    pub campaign_ids: Vec<CampaignId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImpressionReportResponse {
    pub recorded: usize,
}

/// `/go/{slug}` query. Both values are optional and untrusted.
#[derive(Debug, Default, Deserialize)]
pub struct RedirectQuery {
    pub campaign: Option<String>,
    pub placement: Option<String>,
}

/// Completed payment, reported by the payment processor.
#[derive(Debug, Deserialize)]
pub struct TopUpRequest {
    pub advertiser_slug: String,
    pub amount_cents: Cents,
    /// Payment reference; replays with the same reference are no-ops
    pub reference_id: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopUpResponse {
    pub applied: bool,
    pub balance_cents: Cents,
    pub entry_id: Option<uuid::Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DayQuery {
    pub day: Option<NaiveDate>,
}

// ─── Admin ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterAdvertiserRequest {
    pub slug: String,
    pub display_name: String,
    pub api_key: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub destination_url: Option<String>,
}

impl From<RegisterAdvertiserRequest> for NewAdvertiser {
    fn from(request: RegisterAdvertiserRequest) -> Self {
        NewAdvertiser {
            slug: request.slug,
            display_name: request.display_name,
            api_key: request.api_key,
            webhook_url: request.webhook_url,
            destination_url: request.destination_url,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AdvertiserStatusRequest {
    pub status: AdvertiserStatus,
    #[serde(default)]
    pub actor: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdvertiserStatusResponse {
    pub slug: String,
    pub status: AdvertiserStatus,
    pub changed: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateCampaignRequest {
    pub advertiser_slug: String,
    pub name: String,
    pub placement: Placement,
    #[serde(default)]
    pub inventory_type: Option<InventoryType>,
    #[serde(default)]
    pub rate_cents: Cents,
    #[serde(default)]
    pub total_budget_cents: Option<Cents>,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub tier: Option<SponsorshipTier>,
    #[serde(default)]
    pub tier_expires_on: Option<NaiveDate>,
}

impl From<CreateCampaignRequest> for Campaign {
    fn from(request: CreateCampaignRequest) -> Self {
        let mut campaign = Campaign::new(
            request.advertiser_slug,
            request.name,
            request.placement,
            request.rate_cents,
            request.total_budget_cents,
            request.start_date,
            request.end_date,
        );
        if let Some(inventory_type) = request.inventory_type {
            campaign.inventory_type = inventory_type;
        }
        if let Some(tier) = request.tier {
            campaign.tier = tier;
        }
        campaign.tier_expires_on = request.tier_expires_on;
        campaign
    }
}

/// Body for `/admin/campaigns/{id}/{action}`.
#[derive(Debug, Default, Deserialize)]
pub struct CampaignActionRequest {
    /// Required for `reject`
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
}
