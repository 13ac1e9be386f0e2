//! Click/Impression Attribution and CPC billing.
//!
//! A redirect first writes a [`ClickRecord`] through [`Attribution::issue_click`]
//! and then bills it with [`Attribution::bill_click`]. Billing never returns an
//! error: failures are logged, counted and audited, and the click event that
//! was already written lets the reconciler backfill a missing debit.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{MarketplaceError, MarketplaceResult};
use crate::lifecycle::CampaignLifecycle;
use crate::notify::{Notifier, ACTOR_BILLING};
use crate::store::MarketplaceStore;
use crate::types::{
    Advertiser, AuditEntry, Campaign, CampaignEvent, CampaignId, CampaignState, Cents,
    ClickRecord, EventType, Placement,
};
use crate::wallet::WalletLedger;

/// Inbound redirect details.
#[derive(Debug, Clone, Default)]
pub struct ClickRequest {
    pub advertiser_slug: String,
    /// Campaign reference carried from a recent auction result
    pub campaign_id: Option<CampaignId>,
    pub placement: Option<Placement>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
}

/// What billing did for one click.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BillingOutcome {
    /// No campaign reference; recorded as an organic click
    Organic,
    /// Flat-fee campaign; click recorded at zero cost
    Unmetered { campaign_id: CampaignId },
    Billed {
        campaign_id: CampaignId,
        cost_cents: Cents,
        balance_after_cents: Cents,
        budget_exhausted: bool,
    },
    /// Campaign reference failed verification; nothing was charged
    Skipped { reason: String },
    /// Budget reserved and event written but the debit did not complete
    Failed { error: String },
}

#[derive(Clone)]
pub struct Attribution {
    store: Arc<dyn MarketplaceStore>,
    wallet: WalletLedger,
    lifecycle: CampaignLifecycle,
    notifier: Notifier,
    visitor_hash_salt: String,
}

impl Attribution {
    pub fn new(store: Arc<dyn MarketplaceStore>, visitor_hash_salt: impl Into<String>) -> Self {
        Self {
            wallet: WalletLedger::new(store.clone()),
            lifecycle: CampaignLifecycle::new(store.clone()),
            notifier: Notifier::new(store.clone()),
            store,
            visitor_hash_salt: visitor_hash_salt.into(),
        }
    }

    /// Generates a fresh click id and writes the click record. Visitor
    /// identifiers are salted and hashed before they reach the store.
    pub async fn issue_click(&self, request: &ClickRequest) -> MarketplaceResult<ClickRecord> {
        let click = ClickRecord {
            click_id: new_click_id(),
            advertiser_slug: request.advertiser_slug.clone(),
            campaign_id: request.campaign_id,
            placement: request.placement,
            ip_hash: request.ip.as_deref().map(|v| self.hash_visitor(v)),
            user_agent_hash: request.user_agent.as_deref().map(|v| self.hash_visitor(v)),
            referrer: request.referrer.clone(),
            created_at: Utc::now(),
        };
        self.store.insert_click(click.clone()).await?;
        metrics::increment_counter!("marketplace_clicks_total");
        Ok(click)
    }

    /// Bills a recorded click against its campaign and wallet.
    #[instrument(skip(self, click), fields(click_id = %click.click_id))]
    pub async fn bill_click(&self, click: &ClickRecord) -> BillingOutcome {
        let outcome = match self.try_bill(click).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(advertiser = %click.advertiser_slug, "Click billing failed: {}", e);
                BillingOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        match &outcome {
            BillingOutcome::Billed { cost_cents, .. } => {
                metrics::counter!("marketplace_billed_cents_total", *cost_cents as u64);
                metrics::increment_counter!("marketplace_clicks_billed_total");
            }
            BillingOutcome::Skipped { reason } => {
                warn!(advertiser = %click.advertiser_slug, "Click not billed: {}", reason);
                metrics::increment_counter!("marketplace_billing_skipped_total");
                self.audit_billing(click, "billing.skipped", reason).await;
            }
            BillingOutcome::Failed { error } => {
                metrics::increment_counter!("marketplace_billing_failures_total");
                self.audit_billing(click, "billing.failed", error).await;
            }
            BillingOutcome::Organic | BillingOutcome::Unmetered { .. } => {}
        }
        outcome
    }

    async fn try_bill(&self, click: &ClickRecord) -> MarketplaceResult<BillingOutcome> {
        let Some(campaign_id) = click.campaign_id else {
            self.append_click_event(click, None, 0).await?;
            return Ok(BillingOutcome::Organic);
        };

        let campaign = match self.store.get_campaign(campaign_id).await? {
            Some(campaign) => campaign,
            None => {
                return Ok(BillingOutcome::Skipped {
                    reason: format!("unknown campaign {}", campaign_id),
                })
            }
        };
        if campaign.advertiser_slug != click.advertiser_slug {
            return Ok(BillingOutcome::Skipped {
                reason: format!(
                    "campaign {} does not belong to {}",
                    campaign_id, click.advertiser_slug
                ),
            });
        }
        if campaign.state != CampaignState::Active {
            return Ok(BillingOutcome::Skipped {
                reason: format!("campaign {} is {}", campaign_id, campaign.state),
            });
        }

        if !campaign.is_cpc() {
            self.append_click_event(click, Some(&campaign), 0).await?;
            return Ok(BillingOutcome::Unmetered { campaign_id });
        }

        // Spend and its click event commit together, so an abandoned billing
        // task leaves either both or neither; the debit follows the event.
        let rate = campaign.rate_cents;
        let event = click_event(click, Some(&campaign), rate);
        let Some(updated) = self
            .store
            .reserve_click_spend(campaign_id, rate, event)
            .await?
        else {
            self.exhaust_if_reached(campaign_id).await?;
            return Ok(BillingOutcome::Skipped {
                reason: format!("campaign {} is no longer billable", campaign_id),
            });
        };

        let budget_exhausted = if updated.spend_exhausted() {
            self.lifecycle
                .auto_transition(
                    campaign_id,
                    &[CampaignState::Active],
                    CampaignState::BudgetExhausted,
                    "budget exhausted",
                    ACTOR_BILLING,
                )
                .await?
        } else {
            false
        };

        let receipt = self
            .wallet
            .debit(&campaign.advertiser_slug, rate, &click.click_id)
            .await?;

        info!(
            campaign = %campaign_id,
            advertiser = %campaign.advertiser_slug,
            cost_cents = rate,
            spent_cents = updated.total_spent_cents,
            balance_cents = receipt.balance_after_cents,
            "Click billed"
        );

        Ok(BillingOutcome::Billed {
            campaign_id,
            cost_cents: rate,
            balance_after_cents: receipt.balance_after_cents,
            budget_exhausted,
        })
    }

    /// Appends zero-cost impression events for rendered winners. Unknown
    /// campaigns and campaigns outside `placement` are ignored.
    pub async fn record_impressions(
        &self,
        placement: Placement,
        campaign_ids: &[CampaignId],
    ) -> MarketplaceResult<usize> {
        let mut recorded = 0;
        for id in campaign_ids {
            let Some(campaign) = self.store.get_campaign(*id).await? else {
                continue;
            };
            if campaign.placement != placement {
                continue;
            }
            let event = CampaignEvent::new(
                EventType::Impression,
                Some(campaign.id),
                Some(campaign.advertiser_slug),
                0,
                None,
                Some(placement),
            );
            self.store.append_event(event).await?;
            recorded += 1;
        }
        metrics::counter!("marketplace_impressions_total", recorded as u64);
        Ok(recorded)
    }

    pub fn hash_visitor(&self, value: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.visitor_hash_salt.as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
        hex::encode(hasher.finalize())
    }

    async fn append_click_event(
        &self,
        click: &ClickRecord,
        campaign: Option<&Campaign>,
        cost_cents: Cents,
    ) -> MarketplaceResult<()> {
        self.store
            .append_event(click_event(click, campaign, cost_cents))
            .await
    }

    async fn exhaust_if_reached(&self, campaign_id: CampaignId) -> MarketplaceResult<()> {
        let reached = self
            .store
            .get_campaign(campaign_id)
            .await?
            .map_or(false, |c| c.state == CampaignState::Active && c.spend_exhausted());
        if reached {
            self.lifecycle
                .auto_transition(
                    campaign_id,
                    &[CampaignState::Active],
                    CampaignState::BudgetExhausted,
                    "budget exhausted",
                    ACTOR_BILLING,
                )
                .await?;
        }
        Ok(())
    }

    async fn audit_billing(&self, click: &ClickRecord, action: &str, cause: &str) {
        let entry = AuditEntry::new(action, "click", click.click_id.clone(), cause, ACTOR_BILLING)
            .with_details(serde_json::json!({
                "advertiser_slug": click.advertiser_slug,
                "campaign_id": click.campaign_id,
            }));
        self.notifier.audit(entry).await;
    }
}

fn click_event(click: &ClickRecord, campaign: Option<&Campaign>, cost_cents: Cents) -> CampaignEvent {
    CampaignEvent::new(
        EventType::Click,
        campaign.map(|c| c.id),
        Some(click.advertiser_slug.clone()),
        cost_cents,
        Some(click.click_id.clone()),
        campaign.map(|c| c.placement).or(click.placement),
    )
}

/// Opaque click identifier.
pub fn new_click_id() -> String {
    format!("clk_{}", Uuid::new_v4().simple())
}

/// Rejects a redirect to an advertiser that does not exist.
pub async fn ensure_advertiser(
    store: &Arc<dyn MarketplaceStore>,
    slug: &str,
) -> MarketplaceResult<Advertiser> {
    store
        .get_advertiser(slug)
        .await?
        .ok_or_else(|| MarketplaceError::not_found(format!("advertiser {}", slug)))
}
