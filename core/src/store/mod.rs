//! Storage seam for every marketplace service.
//!
//! Implementations must make each method atomic with respect to concurrent
//! callers. In particular wallet mutations, campaign spend increments and
//! campaign state changes are expressed as single atomic operations
//! (`apply_ledger_entry`, `reserve_click_spend`, `transition_campaign`) rather
//! than read-modify-write sequences. Multi-row writes that must land together
//! (`reserve_click_spend`, `record_conversion`) commit all or nothing. The
//! delivery claim hands each due delivery to at most one worker per lease,
//! and only the lease holder may renew it or store an attempt.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MarketplaceResult;
use crate::types::{
    Advertiser, AdvertiserStatus, AuditEntry, AutoTopUp, Campaign, CampaignEvent, CampaignId,
    CampaignState, Cents, ClickRecord, ConversionEvent, DailyStat, LedgerEntry, LedgerEntryKind,
    Notification, PromoOffer, SponsorshipTier, Wallet, WebhookDelivery,
};

pub mod memory;

pub use memory::InMemoryStore;

/// A requested wallet mutation keyed by `(advertiser_slug, kind, reference_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRequest {
    pub advertiser_slug: String,
    pub kind: LedgerEntryKind,
    pub amount_cents: Cents,
    pub reference_id: String,
    pub source: Option<String>,
}

/// Result of `apply_ledger_entry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerOutcome {
    /// False when the reference was already applied; nothing changed
    pub applied: bool,
    /// The stored entry (the earlier one on replay)
    pub entry: LedgerEntry,
    pub balance_before_cents: Cents,
    pub balance_after_cents: Cents,
    pub wallet: Wallet,
}

/// Advertiser-editable wallet settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSettings {
    pub low_balance_threshold_cents: Cents,
    pub low_balance_alerts_enabled: bool,
    pub auto_top_up: Option<AutoTopUp>,
}

/// Outcome of a conversion insert under its idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionInsert {
    Inserted(ConversionEvent),
    Duplicate(ConversionEvent),
}

#[async_trait]
pub trait MarketplaceStore: Send + Sync {
    // ─── advertisers ───

    /// Creates the account and its wallet together. Duplicate slug or api
    /// key is a `Conflict`.
    async fn insert_advertiser(&self, advertiser: Advertiser, wallet: Wallet)
        -> MarketplaceResult<()>;

    async fn get_advertiser(&self, slug: &str) -> MarketplaceResult<Option<Advertiser>>;

    async fn find_advertiser_by_api_key(&self, api_key: &str)
        -> MarketplaceResult<Option<Advertiser>>;

    async fn set_advertiser_status(
        &self,
        slug: &str,
        status: AdvertiserStatus,
    ) -> MarketplaceResult<bool>;

    // ─── wallets ───

    async fn get_wallet(&self, slug: &str) -> MarketplaceResult<Option<Wallet>>;

    async fn list_wallets(&self) -> MarketplaceResult<Vec<Wallet>>;

    /// Applies a credit or debit exactly once per
    /// `(advertiser_slug, kind, reference_id)`.
    async fn apply_ledger_entry(&self, request: LedgerRequest) -> MarketplaceResult<LedgerOutcome>;

    async fn ledger_entry(
        &self,
        slug: &str,
        kind: LedgerEntryKind,
        reference_id: &str,
    ) -> MarketplaceResult<Option<LedgerEntry>>;

    async fn ledger_entries(&self, slug: &str) -> MarketplaceResult<Vec<LedgerEntry>>;

    async fn configure_wallet(
        &self,
        slug: &str,
        settings: WalletSettings,
    ) -> MarketplaceResult<Wallet>;

    /// Stamps `last_low_balance_alert_at = now` only if no alert was sent in
    /// the preceding `cooldown`. Returns whether the caller won the slot.
    async fn claim_low_balance_alert(
        &self,
        slug: &str,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> MarketplaceResult<bool>;

    // ─── campaigns ───

    async fn insert_campaign(&self, campaign: Campaign) -> MarketplaceResult<()>;

    async fn get_campaign(&self, id: CampaignId) -> MarketplaceResult<Option<Campaign>>;

    async fn list_campaigns(&self) -> MarketplaceResult<Vec<Campaign>>;

    async fn campaigns_for_advertiser(&self, slug: &str) -> MarketplaceResult<Vec<Campaign>>;

    /// Compare-and-set on the lifecycle state: moves to `to` only when the
    /// current state is one of `from`.
    async fn transition_campaign(
        &self,
        id: CampaignId,
        from: &[CampaignState],
        to: CampaignState,
    ) -> MarketplaceResult<bool>;

    /// Atomic `total_spent_cents += amount` together with the append of the
    /// billed click `event`. Applied only while the campaign is `active` and
    /// `amount` fits in the remaining budget. Returns the updated campaign,
    /// or `None` when the guard failed and nothing was written.
    async fn reserve_click_spend(
        &self,
        id: CampaignId,
        amount_cents: Cents,
        event: CampaignEvent,
    ) -> MarketplaceResult<Option<Campaign>>;

    async fn set_campaign_tier(
        &self,
        id: CampaignId,
        tier: SponsorshipTier,
        expires_on: Option<NaiveDate>,
    ) -> MarketplaceResult<bool>;

    // ─── events & clicks ───

    async fn append_event(&self, event: CampaignEvent) -> MarketplaceResult<()>;

    /// Events with `from <= occurred_at < to`, oldest first.
    async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> MarketplaceResult<Vec<CampaignEvent>>;

    async fn insert_click(&self, click: ClickRecord) -> MarketplaceResult<()>;

    async fn get_click(&self, click_id: &str) -> MarketplaceResult<Option<ClickRecord>>;

    // ─── conversions ───

    /// Stores a conversion under its idempotency key together with its
    /// campaign event, the live daily conversion counter (when the
    /// conversion names a campaign) and the optional webhook delivery. All or nothing; a
    /// duplicate key writes nothing and returns the earlier conversion.
    async fn record_conversion(
        &self,
        conversion: ConversionEvent,
        event: CampaignEvent,
        delivery: Option<WebhookDelivery>,
    ) -> MarketplaceResult<ConversionInsert>;

    async fn conversions_for_click(&self, click_id: &str)
        -> MarketplaceResult<Vec<ConversionEvent>>;

    // ─── rollups ───

    /// Insert or overwrite the row keyed by `(campaign_id, day)`.
    async fn upsert_daily_stat(&self, stat: DailyStat) -> MarketplaceResult<()>;

    async fn get_daily_stat(
        &self,
        campaign_id: CampaignId,
        day: NaiveDate,
    ) -> MarketplaceResult<Option<DailyStat>>;

    // ─── webhook deliveries ───

    async fn enqueue_delivery(&self, delivery: WebhookDelivery) -> MarketplaceResult<()>;

    /// Pending deliveries with `next_retry_at <= now`, oldest first, at most
    /// `limit`. Each returned row has its `next_retry_at` moved to
    /// `lease_until` so concurrent claimers skip it.
    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease_until: DateTime<Utc>,
    ) -> MarketplaceResult<Vec<WebhookDelivery>>;

    /// Extends a claim. Succeeds only while the row is pending and still
    /// leased until `held_until`, i.e. no other worker re-claimed it.
    async fn renew_delivery_lease(
        &self,
        id: Uuid,
        held_until: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> MarketplaceResult<bool>;

    /// Stores an attempt result, guarded like `renew_delivery_lease`.
    /// Returns false and writes nothing when the lease was lost.
    async fn save_delivery(
        &self,
        delivery: WebhookDelivery,
        held_until: DateTime<Utc>,
    ) -> MarketplaceResult<bool>;

    async fn get_delivery(&self, id: Uuid) -> MarketplaceResult<Option<WebhookDelivery>>;

    // ─── promotions ───

    async fn insert_promotion(&self, offer: PromoOffer) -> MarketplaceResult<()>;

    async fn list_promotions(&self) -> MarketplaceResult<Vec<PromoOffer>>;

    /// Sets `active = false`; returns false when already inactive.
    async fn deactivate_promotion(&self, id: Uuid) -> MarketplaceResult<bool>;

    // ─── notifications & audit ───

    async fn insert_notification(&self, notification: Notification) -> MarketplaceResult<()>;

    async fn notifications_for(&self, slug: &str) -> MarketplaceResult<Vec<Notification>>;

    async fn append_audit(&self, entry: AuditEntry) -> MarketplaceResult<()>;

    async fn list_audit(&self) -> MarketplaceResult<Vec<AuditEntry>>;
}

/// Half-open UTC bounds of a calendar day.
pub fn day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = day.and_time(chrono::NaiveTime::MIN).and_utc();
    (start, start + Duration::days(1))
}
