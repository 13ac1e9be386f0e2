//! Placement Auction.
//!
//! Winners for a placement are the `active` campaigns whose window contains
//! the day, ranked by effective sponsorship tier, then by creation time, then
//! by id. The ranking is a total order so equal inputs give equal output.
//! The auction never bills.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::MarketplaceResult;
use crate::store::MarketplaceStore;
use crate::types::{Campaign, CampaignId, CampaignState, Placement, SponsorshipTier};

/// One provisional auction winner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Winner {
    pub campaign_id: CampaignId,
    pub advertiser_slug: String,
    pub placement: Placement,
    pub tier: SponsorshipTier,
}

#[derive(Clone)]
pub struct PlacementAuction {
    store: Arc<dyn MarketplaceStore>,
}

impl PlacementAuction {
    pub fn new(store: Arc<dyn MarketplaceStore>) -> Self {
        Self { store }
    }

    /// Ordered winners for `placement` on `today`.
    #[instrument(skip(self))]
    pub async fn get_winners(
        &self,
        placement: Placement,
        today: NaiveDate,
    ) -> MarketplaceResult<Vec<Winner>> {
        let mut candidates: Vec<Campaign> = self
            .store
            .list_campaigns()
            .await?
            .into_iter()
            .filter(|c| {
                c.state == CampaignState::Active
                    && c.placement == placement
                    && c.window_contains(today)
                    && !c.spend_exhausted()
            })
            .collect();

        // Advertiser status and CPC wallet balance, looked up once per advertiser.
        let mut eligible: HashMap<String, bool> = HashMap::new();
        let mut kept = Vec::with_capacity(candidates.len());
        for campaign in candidates.drain(..) {
            let slug = campaign.advertiser_slug.clone();
            let advertiser_ok = match eligible.get(&slug) {
                Some(ok) => *ok,
                None => {
                    let ok = self
                        .store
                        .get_advertiser(&slug)
                        .await?
                        .map_or(false, |a| a.is_active());
                    eligible.insert(slug.clone(), ok);
                    ok
                }
            };
            if !advertiser_ok {
                continue;
            }
            if campaign.is_cpc() {
                let funded = self
                    .store
                    .get_wallet(&slug)
                    .await?
                    .map_or(false, |w| w.balance_cents > 0);
                if !funded {
                    debug!(campaign = %campaign.id, "Skipping unfunded CPC campaign");
                    continue;
                }
            }
            kept.push(campaign);
        }

        kept.sort_by(|a, b| rank(a, b, today));

        Ok(kept
            .into_iter()
            .map(|c| Winner {
                tier: c.effective_tier(today),
                campaign_id: c.id,
                advertiser_slug: c.advertiser_slug,
                placement: c.placement,
            })
            .collect())
    }
}

/// Higher tier first, then older campaigns, then lower id.
fn rank(a: &Campaign, b: &Campaign, today: NaiveDate) -> Ordering {
    b.effective_tier(today)
        .cmp(&a.effective_tier(today))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}
