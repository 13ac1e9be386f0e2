//! Scheduled Reconciler.
//!
//! Each job is idempotent and can be re-run at any time. Jobs return a
//! [`JobSummary`] with per-action counts, and every state change they make is
//! written to the audit log with its cause.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::error::MarketplaceResult;
use crate::lifecycle::CampaignLifecycle;
use crate::notify::{Notifier, ACTOR_RECONCILER};
use crate::store::{day_bounds, MarketplaceStore};
use crate::types::{
    AuditEntry, CampaignId, CampaignState, DailyStat, EventType, LedgerEntryKind, SponsorshipTier,
};
use crate::wallet::WalletLedger;

/// Counts of actions taken by one job run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job: String,
    pub ran_at: DateTime<Utc>,
    pub actions: BTreeMap<String, u64>,
}

impl JobSummary {
    fn new(job: &str, ran_at: DateTime<Utc>) -> Self {
        Self {
            job: job.to_string(),
            ran_at,
            actions: BTreeMap::new(),
        }
    }

    fn bump(&mut self, action: &str) {
        self.add(action, 1);
    }

    fn add(&mut self, action: &str, count: u64) {
        *self.actions.entry(action.to_string()).or_insert(0) += count;
    }

    pub fn count(&self, action: &str) -> u64 {
        self.actions.get(action).copied().unwrap_or(0)
    }

    fn finish(self) -> Self {
        for (action, count) in &self.actions {
            metrics::counter!(
                "marketplace_reconciler_actions_total",
                *count,
                "job" => self.job.clone(),
                "action" => action.clone()
            );
        }
        info!(job = %self.job, actions = ?self.actions, "Reconciler job finished");
        self
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn MarketplaceStore>,
    lifecycle: CampaignLifecycle,
    wallet: WalletLedger,
    notifier: Notifier,
}

impl Reconciler {
    pub fn new(store: Arc<dyn MarketplaceStore>) -> Self {
        Self {
            lifecycle: CampaignLifecycle::new(store.clone()),
            wallet: WalletLedger::new(store.clone()),
            notifier: Notifier::new(store.clone()),
            store,
        }
    }

    /// Job 1: rebuilds the daily rollup rows for `day` from campaign events.
    /// Rows are overwritten, so reruns never double-count.
    #[instrument(skip(self))]
    pub async fn rollup_day(&self, day: NaiveDate) -> MarketplaceResult<JobSummary> {
        let mut summary = JobSummary::new("rollups", Utc::now());
        let (from, to) = day_bounds(day);

        let mut stats: BTreeMap<CampaignId, DailyStat> = BTreeMap::new();
        for event in self.store.events_between(from, to).await? {
            let Some(campaign_id) = event.campaign_id else {
                summary.bump("organic_events_skipped");
                continue;
            };
            stats
                .entry(campaign_id)
                .or_insert_with(|| DailyStat::empty(campaign_id, day))
                .absorb(&event);
        }

        for (campaign_id, stat) in stats {
            let changed = match self.store.get_daily_stat(campaign_id, day).await? {
                Some(existing) => !existing.same_totals(&stat),
                None => true,
            };
            self.store.upsert_daily_stat(stat).await?;
            summary.bump("rollups_written");
            if changed {
                summary.bump("rollups_changed");
            }
        }
        Ok(summary.finish())
    }

    /// Job 2: date and budget driven lifecycle transitions.
    #[instrument(skip(self))]
    pub async fn advance_lifecycle(&self, today: NaiveDate) -> MarketplaceResult<JobSummary> {
        use CampaignState::*;

        let mut summary = JobSummary::new("lifecycle", Utc::now());
        for campaign in self.store.list_campaigns().await? {
            let ended = campaign.end_date.map_or(false, |end| end < today);
            let (to, cause, action) = match campaign.state {
                Approved | Active | Paused | BudgetExhausted if ended => {
                    (Completed, "end_date passed", "completed")
                }
                Approved if campaign.start_date <= today => {
                    (Active, "start_date reached", "activated")
                }
                Active if campaign.spend_exhausted() => {
                    (BudgetExhausted, "budget exhausted", "budget_exhausted")
                }
                _ => continue,
            };

            match self
                .lifecycle
                .auto_transition(campaign.id, &[campaign.state], to, cause, ACTOR_RECONCILER)
                .await
            {
                Ok(true) => summary.bump(action),
                Ok(false) => summary.bump("raced"),
                Err(e) => {
                    error!(campaign = %campaign.id, "Lifecycle transition failed: {}", e);
                    summary.bump("errors");
                }
            }
        }
        Ok(summary.finish())
    }

    /// Job 3: deactivates ended promotions and resets lapsed sponsorship tiers.
    #[instrument(skip(self))]
    pub async fn expire_promotions(&self, today: NaiveDate) -> MarketplaceResult<JobSummary> {
        let mut summary = JobSummary::new("promotions", Utc::now());

        for offer in self.store.list_promotions().await? {
            if !offer.active || offer.ends_on.map_or(true, |end| end >= today) {
                continue;
            }
            if self.store.deactivate_promotion(offer.id).await? {
                summary.bump("promotions_expired");
                self.notifier
                    .audit(AuditEntry::new(
                        "promotion.expired",
                        "promotion",
                        offer.id.to_string(),
                        "end_date passed",
                        ACTOR_RECONCILER,
                    ))
                    .await;
            }
        }

        for campaign in self.store.list_campaigns().await? {
            let lapsed = campaign.tier != SponsorshipTier::Standard
                && campaign.tier_expires_on.map_or(false, |end| end < today);
            if !lapsed {
                continue;
            }
            if self
                .store
                .set_campaign_tier(campaign.id, SponsorshipTier::Standard, None)
                .await?
            {
                summary.bump("tiers_expired");
                self.notifier
                    .audit(
                        AuditEntry::new(
                            "campaign.tier_expired",
                            "campaign",
                            campaign.id.to_string(),
                            "tier_expires_on passed",
                            ACTOR_RECONCILER,
                        )
                        .with_details(serde_json::json!({ "previous_tier": campaign.tier })),
                    )
                    .await;
            }
        }
        Ok(summary.finish())
    }

    /// Job 4: low-balance alerts (at most one per 24h) and pausing of
    /// campaigns for advertisers whose balance reached zero.
    #[instrument(skip(self))]
    pub async fn scan_low_balances(&self, now: DateTime<Utc>) -> MarketplaceResult<JobSummary> {
        let mut summary = JobSummary::new("low_balance", Utc::now());

        for wallet in self.store.list_wallets().await? {
            if wallet.balance_cents <= 0 {
                let paused = self
                    .lifecycle
                    .pause_advertiser_campaigns(
                        &wallet.advertiser_slug,
                        "wallet balance reached zero",
                        ACTOR_RECONCILER,
                    )
                    .await?;
                summary.add("campaigns_paused", paused.len() as u64);
            }
            if wallet.balance_cents <= wallet.low_balance_threshold_cents {
                summary.bump("wallets_below_threshold");
                if self.wallet.maybe_alert_low_balance(&wallet, now).await {
                    summary.bump("alerts_sent");
                }
            }
        }
        Ok(summary.finish())
    }

    /// Job 5: re-issues debits for billed click events of `day` that have no
    /// ledger entry. Debits are keyed by click id, so this is safe to rerun.
    #[instrument(skip(self))]
    pub async fn backfill_debits(&self, day: NaiveDate) -> MarketplaceResult<JobSummary> {
        let mut summary = JobSummary::new("backfill_debits", Utc::now());
        let (from, to) = day_bounds(day);

        for event in self.store.events_between(from, to).await? {
            if event.event_type != EventType::Click || event.cost_cents <= 0 {
                continue;
            }
            let (Some(click_id), Some(slug)) = (&event.click_id, &event.advertiser_slug) else {
                continue;
            };
            summary.bump("billed_clicks_checked");
            if self
                .store
                .ledger_entry(slug, LedgerEntryKind::Debit, click_id)
                .await?
                .is_some()
            {
                continue;
            }

            match self.wallet.debit(slug, event.cost_cents, click_id).await {
                Ok(receipt) if receipt.applied => {
                    warn!(click_id = %click_id, advertiser = %slug, "Backfilled orphaned debit");
                    summary.bump("debits_backfilled");
                    self.notifier
                        .audit(
                            AuditEntry::new(
                                "wallet.debit_backfilled",
                                "click",
                                click_id.clone(),
                                "click event without debit",
                                ACTOR_RECONCILER,
                            )
                            .with_details(serde_json::json!({
                                "advertiser_slug": slug,
                                "campaign_id": event.campaign_id,
                                "amount_cents": event.cost_cents,
                            })),
                        )
                        .await;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(click_id = %click_id, "Debit backfill failed: {}", e);
                    summary.bump("errors");
                }
            }
        }
        Ok(summary.finish())
    }

    /// Job 6: compares each campaign's `total_spent_cents` with the sum of its
    /// billed click events. Spend without events cannot be backfilled, so a
    /// mismatch is only reported (warning plus audit entry) for an operator.
    #[instrument(skip(self))]
    pub async fn audit_campaign_spend(&self, now: DateTime<Utc>) -> MarketplaceResult<JobSummary> {
        let mut summary = JobSummary::new("spend_audit", Utc::now());
        let campaigns = self.store.list_campaigns().await?;
        let Some(earliest) = campaigns.iter().map(|c| c.created_at).min() else {
            return Ok(summary.finish());
        };

        let mut billed: HashMap<CampaignId, i64> = HashMap::new();
        let until = now + Duration::seconds(1);
        for event in self.store.events_between(earliest, until).await? {
            if event.event_type != EventType::Click {
                continue;
            }
            if let Some(campaign_id) = event.campaign_id {
                *billed.entry(campaign_id).or_insert(0) += event.cost_cents;
            }
        }

        for campaign in campaigns {
            summary.bump("campaigns_checked");
            let events_cents = billed.get(&campaign.id).copied().unwrap_or(0);
            if events_cents == campaign.total_spent_cents {
                continue;
            }
            warn!(
                campaign = %campaign.id,
                spent_cents = campaign.total_spent_cents,
                events_cents,
                "Campaign spend does not match its billed click events"
            );
            summary.bump("spend_mismatches");
            self.notifier
                .audit(
                    AuditEntry::new(
                        "campaign.spend_mismatch",
                        "campaign",
                        campaign.id.to_string(),
                        "total spent differs from billed click events",
                        ACTOR_RECONCILER,
                    )
                    .with_details(serde_json::json!({
                        "advertiser_slug": campaign.advertiser_slug,
                        "total_spent_cents": campaign.total_spent_cents,
                        "billed_events_cents": events_cents,
                    })),
                )
                .await;
        }
        Ok(summary.finish())
    }

    /// Runs every job once: rollups and debit backfill for yesterday and today,
    /// then lifecycle, promotions, the low-balance scan and the spend audit.
    pub async fn run_all(&self, now: DateTime<Utc>) -> Vec<JobSummary> {
        let today = now.date_naive();
        let yesterday = today - Duration::days(1);
        let mut summaries = Vec::new();

        let results = [
            self.backfill_debits(yesterday).await,
            self.backfill_debits(today).await,
            self.rollup_day(yesterday).await,
            self.advance_lifecycle(today).await,
            self.expire_promotions(today).await,
            self.scan_low_balances(now).await,
            self.audit_campaign_spend(now).await,
        ];
        for result in results {
            match result {
                Ok(summary) => summaries.push(summary),
                Err(e) => error!("Reconciler job failed: {}", e),
            }
        }
        summaries
    }
}

/// Sums campaign events into per-campaign totals for `day`. Used to check a
/// stored rollup against its source events.
pub async fn recompute_day(
    store: &Arc<dyn MarketplaceStore>,
    day: NaiveDate,
) -> MarketplaceResult<HashMap<CampaignId, DailyStat>> {
    let (from, to) = day_bounds(day);
    let mut stats = HashMap::new();
    for event in store.events_between(from, to).await? {
        if let Some(campaign_id) = event.campaign_id {
            stats
                .entry(campaign_id)
                .or_insert_with(|| DailyStat::empty(campaign_id, day))
                .absorb(&event);
        }
    }
    Ok(stats)
}
