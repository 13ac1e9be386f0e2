//! Campaign lifecycle state machine.
//!
//! `draft → pending_review → approved → active → {paused, budget_exhausted,
//! completed, rejected}`. Admin actions go through [`CampaignLifecycle::transition`],
//! which rejects edges the state machine does not allow. Automatic moves made by
//! billing and the reconciler go through [`CampaignLifecycle::auto_transition`],
//! a compare-and-set that silently loses to a concurrent change.

use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::error::{MarketplaceError, MarketplaceResult};
use crate::notify::Notifier;
use crate::store::MarketplaceStore;
use crate::types::{AuditEntry, Campaign, CampaignId, CampaignState};

#[derive(Clone)]
pub struct CampaignLifecycle {
    store: Arc<dyn MarketplaceStore>,
    notifier: Notifier,
}

impl CampaignLifecycle {
    pub fn new(store: Arc<dyn MarketplaceStore>) -> Self {
        Self {
            notifier: Notifier::new(store.clone()),
            store,
        }
    }

    /// Stores a new campaign. Campaigns always start in `draft`.
    pub async fn create(&self, mut campaign: Campaign) -> MarketplaceResult<Campaign> {
        if campaign.rate_cents < 0 {
            return Err(MarketplaceError::validation("rate_cents must not be negative"));
        }
        if campaign.total_budget_cents.map_or(false, |budget| budget <= 0) {
            return Err(MarketplaceError::validation("total_budget_cents must be positive"));
        }
        if campaign.is_cpc() && campaign.rate_cents == 0 {
            return Err(MarketplaceError::validation(
                "cost-per-click campaigns need a positive rate_cents",
            ));
        }
        if let Some(end) = campaign.end_date {
            if end < campaign.start_date {
                return Err(MarketplaceError::validation("end_date precedes start_date"));
            }
        }
        if self.store.get_advertiser(&campaign.advertiser_slug).await?.is_none() {
            return Err(MarketplaceError::not_found(format!(
                "advertiser {}",
                campaign.advertiser_slug
            )));
        }

        campaign.state = CampaignState::Draft;
        campaign.total_spent_cents = 0;
        self.store.insert_campaign(campaign.clone()).await?;
        info!(campaign = %campaign.id, advertiser = %campaign.advertiser_slug, "Campaign created");
        Ok(campaign)
    }

    /// Validated transition for admin and advertiser actions.
    #[instrument(skip(self, cause))]
    pub async fn transition(
        &self,
        id: CampaignId,
        to: CampaignState,
        cause: &str,
        actor: &str,
    ) -> MarketplaceResult<Campaign> {
        let campaign = self.load(id).await?;
        let from = campaign.state;

        if !from.can_transition_to(to) {
            return Err(MarketplaceError::InvalidTransition(format!(
                "campaign {} cannot move from {} to {}",
                id, from, to
            )));
        }

        if !self.store.transition_campaign(id, &[from], to).await? {
            return Err(MarketplaceError::Conflict(format!(
                "campaign {} changed state concurrently",
                id
            )));
        }

        self.record(id, from, to, cause, actor).await;
        self.load(id).await
    }

    /// Compare-and-set move used by automatic rules. Returns false when the
    /// campaign was no longer in one of `from`.
    pub async fn auto_transition(
        &self,
        id: CampaignId,
        from: &[CampaignState],
        to: CampaignState,
        cause: &str,
        actor: &str,
    ) -> MarketplaceResult<bool> {
        let current = self.load(id).await?.state;
        if !from.contains(&current) || !current.can_transition_to(to) {
            debug!(campaign = %id, state = %current, target = %to, "Skipping automatic transition");
            return Ok(false);
        }

        let moved = self.store.transition_campaign(id, &[current], to).await?;
        if moved {
            self.record(id, current, to, cause, actor).await;
        }
        Ok(moved)
    }

    pub async fn submit_for_review(&self, id: CampaignId, actor: &str) -> MarketplaceResult<Campaign> {
        self.transition(id, CampaignState::PendingReview, "submitted for review", actor)
            .await
    }

    pub async fn approve(&self, id: CampaignId, actor: &str) -> MarketplaceResult<Campaign> {
        self.transition(id, CampaignState::Approved, "approved by admin", actor)
            .await
    }

    pub async fn reject(&self, id: CampaignId, reason: &str, actor: &str) -> MarketplaceResult<Campaign> {
        self.transition(id, CampaignState::Rejected, reason, actor).await
    }

    pub async fn pause(&self, id: CampaignId, actor: &str) -> MarketplaceResult<Campaign> {
        self.transition(id, CampaignState::Paused, "paused manually", actor)
            .await
    }

    /// `paused → active`. CPC campaigns only resume on a funded wallet.
    pub async fn resume(&self, id: CampaignId, actor: &str) -> MarketplaceResult<Campaign> {
        let campaign = self.load(id).await?;
        if campaign.is_cpc() {
            let balance = self
                .store
                .get_wallet(&campaign.advertiser_slug)
                .await?
                .map(|wallet| wallet.balance_cents)
                .unwrap_or(0);
            if balance <= 0 {
                return Err(MarketplaceError::InvalidTransition(format!(
                    "campaign {} cannot resume while wallet balance is {}",
                    id, balance
                )));
            }
        }
        self.transition(id, CampaignState::Active, "resumed", actor)
            .await
    }

    /// Pauses every `active` campaign of an advertiser.
    pub async fn pause_advertiser_campaigns(
        &self,
        advertiser_slug: &str,
        cause: &str,
        actor: &str,
    ) -> MarketplaceResult<Vec<CampaignId>> {
        let mut paused = Vec::new();
        for campaign in self.store.campaigns_for_advertiser(advertiser_slug).await? {
            if campaign.state != CampaignState::Active {
                continue;
            }
            if self
                .auto_transition(
                    campaign.id,
                    &[CampaignState::Active],
                    CampaignState::Paused,
                    cause,
                    actor,
                )
                .await?
            {
                paused.push(campaign.id);
            }
        }
        if !paused.is_empty() {
            info!(
                advertiser = advertiser_slug,
                count = paused.len(),
                "Paused active campaigns: {}",
                cause
            );
        }
        Ok(paused)
    }

    async fn load(&self, id: CampaignId) -> MarketplaceResult<Campaign> {
        self.store
            .get_campaign(id)
            .await?
            .ok_or_else(|| MarketplaceError::not_found(format!("campaign {}", id)))
    }

    async fn record(
        &self,
        id: CampaignId,
        from: CampaignState,
        to: CampaignState,
        cause: &str,
        actor: &str,
    ) {
        info!(campaign = %id, from = %from, to = %to, actor, "Campaign transition: {}", cause);
        metrics::increment_counter!("marketplace_campaign_transitions_total", "to" => to.as_str());
        let entry = AuditEntry::new(
            format!("campaign.{}", to),
            "campaign",
            id.to_string(),
            cause,
            actor,
        )
        .with_details(serde_json::json!({ "from": from, "to": to }));
        self.notifier.audit(entry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::testing::{register_active, sample_campaign};
    use crate::types::Placement;

    #[tokio::test]
    async fn test_admin_path_to_approved_is_audited() {
        let store: Arc<dyn MarketplaceStore> = Arc::new(InMemoryStore::new());
        register_active(&store, "acme").await;
        let lifecycle = CampaignLifecycle::new(store.clone());

        let campaign = lifecycle
            .create(sample_campaign("acme", Placement::CpcListing, 200, Some(1000)))
            .await
            .unwrap();
        lifecycle.submit_for_review(campaign.id, "advertiser:acme").await.unwrap();
        let approved = lifecycle.approve(campaign.id, "admin").await.unwrap();

        assert_eq!(approved.state, CampaignState::Approved);
        let audit = store.list_audit().await.unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[1].action, "campaign.approved");
        assert_eq!(audit[1].actor, "admin");
    }

    #[tokio::test]
    async fn test_invalid_edge_is_rejected() {
        let store: Arc<dyn MarketplaceStore> = Arc::new(InMemoryStore::new());
        register_active(&store, "acme").await;
        let lifecycle = CampaignLifecycle::new(store.clone());

        let campaign = lifecycle
            .create(sample_campaign("acme", Placement::DealsFeatured, 0, None))
            .await
            .unwrap();

        let err = lifecycle
            .transition(campaign.id, CampaignState::Active, "skip review", "admin")
            .await
            .unwrap_err();
        assert!(matches!(err, MarketplaceError::InvalidTransition(_)));

        lifecycle.reject(campaign.id, "policy violation", "admin").await.unwrap();
        let err = lifecycle.pause(campaign.id, "admin").await.unwrap_err();
        assert!(matches!(err, MarketplaceError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_cpc_resume_requires_funded_wallet() {
        let store: Arc<dyn MarketplaceStore> = Arc::new(InMemoryStore::new());
        register_active(&store, "acme").await;
        let lifecycle = CampaignLifecycle::new(store.clone());

        let mut campaign = sample_campaign("acme", Placement::CpcListing, 200, None);
        campaign.state = CampaignState::Paused;
        store.insert_campaign(campaign.clone()).await.unwrap();

        let err = lifecycle.resume(campaign.id, "admin").await.unwrap_err();
        assert!(matches!(err, MarketplaceError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_cpc_campaign_needs_rate() {
        let store: Arc<dyn MarketplaceStore> = Arc::new(InMemoryStore::new());
        register_active(&store, "acme").await;
        let lifecycle = CampaignLifecycle::new(store);

        let err = lifecycle
            .create(sample_campaign("acme", Placement::CpcListing, 0, None))
            .await
            .unwrap_err();
        assert!(matches!(err, MarketplaceError::Validation(_)));
    }
}
