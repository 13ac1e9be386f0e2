//! Core marketplace types.
//!
//! Advertisers, wallets, campaigns, the append-only event trail, click and
//! conversion records, rollups, webhook deliveries, and the bookkeeping
//! records (ledger entries, notifications, audit entries) that every
//! service writes through the [`MarketplaceStore`](crate::store::MarketplaceStore).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::MarketplaceError;

/// Money is always integer cents.
pub type Cents = i64;
pub type CampaignId = Uuid;
pub type AdvertiserSlug = String;
pub type ClickId = String;

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum that is
/// persisted and exchanged as a snake_case string.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = MarketplaceError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(MarketplaceError::Validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

// ─── Advertiser ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvertiserStatus {
    Pending,
    Active,
    Suspended,
}

text_enum!(AdvertiserStatus {
    Pending => "pending",
    Active => "active",
    Suspended => "suspended",
});

/// A marketplace participant (a broker) buying placements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advertiser {
    /// Immutable identity key referenced everywhere else
    pub slug: AdvertiserSlug,
    pub display_name: String,
    pub status: AdvertiserStatus,
    /// Authenticates inbound conversion postbacks
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Outbound conversion webhook target
    pub webhook_url: Option<String>,
    /// Where redirect clicks land; falls back to the internal review page
    pub destination_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Advertiser {
    pub fn is_active(&self) -> bool {
        self.status == AdvertiserStatus::Active
    }
}

// ─── Wallet ────────────────────────────────────────────────────────────────

/// Saved auto top-up instruction executed by the external payment processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoTopUp {
    pub threshold_cents: Cents,
    pub target_cents: Cents,
    pub payment_method_ref: String,
}

/// Prepaid balance funding an advertiser's spend. Exactly one per advertiser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub advertiser_slug: AdvertiserSlug,
    pub balance_cents: Cents,
    pub lifetime_deposited_cents: Cents,
    pub lifetime_spent_cents: Cents,
    pub low_balance_threshold_cents: Cents,
    pub low_balance_alerts_enabled: bool,
    pub last_low_balance_alert_at: Option<DateTime<Utc>>,
    pub auto_top_up: Option<AutoTopUp>,
    pub updated_at: DateTime<Utc>,
}

/// Default low-balance alert threshold for new wallets ($50).
pub const DEFAULT_LOW_BALANCE_THRESHOLD_CENTS: Cents = 5_000;

impl Wallet {
    pub fn new(advertiser_slug: impl Into<String>) -> Self {
        Self {
            advertiser_slug: advertiser_slug.into(),
            balance_cents: 0,
            lifetime_deposited_cents: 0,
            lifetime_spent_cents: 0,
            low_balance_threshold_cents: DEFAULT_LOW_BALANCE_THRESHOLD_CENTS,
            low_balance_alerts_enabled: true,
            last_low_balance_alert_at: None,
            auto_top_up: None,
            updated_at: Utc::now(),
        }
    }

    /// `balance = deposited - spent` must hold at all times.
    pub fn identity_holds(&self) -> bool {
        self.balance_cents == self.lifetime_deposited_cents - self.lifetime_spent_cents
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    Credit,
    Debit,
}

text_enum!(LedgerEntryKind {
    Credit => "credit",
    Debit => "debit",
});

/// One applied wallet mutation. `(advertiser_slug, kind, reference_id)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub advertiser_slug: AdvertiserSlug,
    pub kind: LedgerEntryKind,
    pub amount_cents: Cents,
    pub reference_id: String,
    pub source: Option<String>,
    pub balance_after_cents: Cents,
    pub created_at: DateTime<Utc>,
}

// ─── Placements & campaigns ────────────────────────────────────────────────

/// How a campaign's exposure is sold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryType {
    /// Flat-fee sponsorship; no per-click wallet metering
    FeaturedListing,
    CostPerClick,
}

text_enum!(InventoryType {
    FeaturedListing => "featured_listing",
    CostPerClick => "cost_per_click",
});

/// Named ad slots on the site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Placement {
    DealsFeatured,
    BrokersFeatured,
    CompareSidebar,
    ArticleInline,
    CpcListing,
}

text_enum!(Placement {
    DealsFeatured => "deals-featured",
    BrokersFeatured => "brokers-featured",
    CompareSidebar => "compare-sidebar",
    ArticleInline => "article-inline",
    CpcListing => "cpc-listing",
});

impl Placement {
    pub fn default_inventory(&self) -> InventoryType {
        match self {
            Placement::CpcListing | Placement::ArticleInline => InventoryType::CostPerClick,
            _ => InventoryType::FeaturedListing,
        }
    }
}

/// Sponsorship priority. Declaration order is ascending priority.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SponsorshipTier {
    #[default]
    Standard,
    Silver,
    Gold,
    Platinum,
}

text_enum!(SponsorshipTier {
    Standard => "standard",
    Silver => "silver",
    Gold => "gold",
    Platinum => "platinum",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignState {
    Draft,
    PendingReview,
    Approved,
    Active,
    Paused,
    BudgetExhausted,
    Completed,
    Rejected,
}

text_enum!(CampaignState {
    Draft => "draft",
    PendingReview => "pending_review",
    Approved => "approved",
    Active => "active",
    Paused => "paused",
    BudgetExhausted => "budget_exhausted",
    Completed => "completed",
    Rejected => "rejected",
});

impl CampaignState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignState::Completed | CampaignState::Rejected)
    }

    /// Allowed edges of the campaign lifecycle.
    pub fn can_transition_to(&self, next: CampaignState) -> bool {
        use CampaignState::*;

        if self.is_terminal() || *self == next {
            return false;
        }

        match (self, next) {
            (_, Rejected) => true,
            (Draft, PendingReview) => true,
            (PendingReview, Approved) => true,
            (Approved, Active) | (Approved, Completed) => true,
            (Active, Paused) | (Active, BudgetExhausted) | (Active, Completed) => true,
            (Paused, Active) | (Paused, Completed) => true,
            (BudgetExhausted, Completed) => true,
            _ => false,
        }
    }
}

/// A scheduled, budgeted unit of advertiser spend targeting one placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub advertiser_slug: AdvertiserSlug,
    pub name: String,
    pub placement: Placement,
    pub inventory_type: InventoryType,
    /// Per-click price for CPC campaigns
    pub rate_cents: Cents,
    /// `None` means unlimited
    pub total_budget_cents: Option<Cents>,
    pub total_spent_cents: Cents,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub state: CampaignState,
    pub tier: SponsorshipTier,
    pub tier_expires_on: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// New campaign in `draft` for the placement's default inventory type.
    pub fn new(
        advertiser_slug: impl Into<String>,
        name: impl Into<String>,
        placement: Placement,
        rate_cents: Cents,
        total_budget_cents: Option<Cents>,
        start_date: NaiveDate,
        end_date: Option<NaiveDate>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            advertiser_slug: advertiser_slug.into(),
            name: name.into(),
            placement,
            inventory_type: placement.default_inventory(),
            rate_cents,
            total_budget_cents,
            total_spent_cents: 0,
            start_date,
            end_date,
            state: CampaignState::Draft,
            tier: SponsorshipTier::Standard,
            tier_expires_on: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when the scheduling window contains `day`.
    pub fn window_contains(&self, day: NaiveDate) -> bool {
        self.start_date <= day && self.end_date.map_or(true, |end| day <= end)
    }

    pub fn budget_reached(&self) -> bool {
        self.total_budget_cents
            .map_or(false, |budget| self.total_spent_cents >= budget)
    }

    /// True when `amount` fits in the remaining budget; unlimited budgets always fit.
    pub fn can_afford(&self, amount: Cents) -> bool {
        self.total_budget_cents
            .map_or(true, |budget| self.total_spent_cents + amount <= budget)
    }

    /// No further billable unit fits: the budget is reached, or a CPC
    /// campaign has less left than one click.
    pub fn spend_exhausted(&self) -> bool {
        self.budget_reached() || (self.is_cpc() && !self.can_afford(self.rate_cents))
    }

    /// Tier used for ranking on `day`; an expired tier counts as standard.
    pub fn effective_tier(&self, day: NaiveDate) -> SponsorshipTier {
        match self.tier_expires_on {
            Some(expires) if expires < day => SponsorshipTier::Standard,
            _ => self.tier,
        }
    }

    pub fn is_cpc(&self) -> bool {
        self.inventory_type == InventoryType::CostPerClick
    }
}

// ─── Events ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Impression,
    Click,
    Conversion,
}

text_enum!(EventType {
    Impression => "impression",
    Click => "click",
    Conversion => "conversion",
});

/// Immutable audit-trail record. Never updated or deleted after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignEvent {
    pub id: Uuid,
    /// `None` for organic, non-campaign clicks
    pub campaign_id: Option<CampaignId>,
    pub advertiser_slug: Option<AdvertiserSlug>,
    pub event_type: EventType,
    /// 0 for impressions, `rate_cents` for billed clicks, declared value for conversions
    pub cost_cents: Cents,
    pub click_id: Option<ClickId>,
    pub placement: Option<Placement>,
    pub occurred_at: DateTime<Utc>,
}

impl CampaignEvent {
    pub fn new(
        event_type: EventType,
        campaign_id: Option<CampaignId>,
        advertiser_slug: Option<String>,
        cost_cents: Cents,
        click_id: Option<ClickId>,
        placement: Option<Placement>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            advertiser_slug,
            event_type,
            cost_cents,
            click_id,
            placement,
            occurred_at: Utc::now(),
        }
    }

    pub fn day(&self) -> NaiveDate {
        self.occurred_at.date_naive()
    }
}

/// Written exactly once per outbound redirect. Visitor identifiers are
/// stored hashed, never raw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickRecord {
    pub click_id: ClickId,
    pub advertiser_slug: AdvertiserSlug,
    /// Campaign the click was attributed to at click time
    pub campaign_id: Option<CampaignId>,
    pub placement: Option<Placement>,
    pub ip_hash: Option<String>,
    pub user_agent_hash: Option<String>,
    pub referrer: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ─── Conversions ───────────────────────────────────────────────────────────

/// Fixed set of advertiser-reportable conversion types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionType {
    Opened,
    Funded,
    FirstTrade,
    Custom,
}

text_enum!(ConversionType {
    Opened => "opened",
    Funded => "funded",
    FirstTrade => "first_trade",
    Custom => "custom",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionEvent {
    pub id: Uuid,
    pub click_id: ClickId,
    pub advertiser_slug: AdvertiserSlug,
    pub campaign_id: Option<CampaignId>,
    pub event_type: ConversionType,
    pub value_cents: Option<Cents>,
    pub metadata: serde_json::Value,
    /// Duplicate-suppression key; unique
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

// ─── Rollups ───────────────────────────────────────────────────────────────

/// Per campaign per day aggregate, always rebuildable from campaign events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStat {
    pub campaign_id: CampaignId,
    pub day: NaiveDate,
    pub impressions: i64,
    pub clicks: i64,
    pub conversions: i64,
    pub spend_cents: Cents,
    pub conversion_value_cents: Cents,
    pub updated_at: DateTime<Utc>,
}

impl DailyStat {
    pub fn empty(campaign_id: CampaignId, day: NaiveDate) -> Self {
        Self {
            campaign_id,
            day,
            impressions: 0,
            clicks: 0,
            conversions: 0,
            spend_cents: 0,
            conversion_value_cents: 0,
            updated_at: Utc::now(),
        }
    }

    /// Folds one event into the aggregate.
    pub fn absorb(&mut self, event: &CampaignEvent) {
        match event.event_type {
            EventType::Impression => self.impressions += 1,
            EventType::Click => {
                self.clicks += 1;
                self.spend_cents += event.cost_cents;
            }
            EventType::Conversion => {
                self.conversions += 1;
                self.conversion_value_cents += event.cost_cents;
            }
        }
    }

    /// Counters only; `updated_at` is ignored.
    pub fn same_totals(&self, other: &DailyStat) -> bool {
        self.impressions == other.impressions
            && self.clicks == other.clicks
            && self.conversions == other.conversions
            && self.spend_cents == other.spend_cents
            && self.conversion_value_cents == other.conversion_value_cents
    }
}

// ─── Webhooks ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

text_enum!(DeliveryStatus {
    Pending => "pending",
    Delivered => "delivered",
    Failed => "failed",
});

/// One outbound notification owed to an advertiser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub advertiser_slug: AdvertiserSlug,
    pub target_url: String,
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

// ─── Promotions ────────────────────────────────────────────────────────────

/// Time-bounded promotional deal shown alongside an advertiser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoOffer {
    pub id: Uuid,
    pub advertiser_slug: AdvertiserSlug,
    pub title: String,
    pub starts_on: NaiveDate,
    pub ends_on: Option<NaiveDate>,
    pub active: bool,
}

// ─── Notifications & audit ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    LowBalance,
    WalletDepleted,
    AutoTopUpRequested,
    WebhookFailed,
}

text_enum!(NotificationKind {
    LowBalance => "low_balance",
    WalletDepleted => "wallet_depleted",
    AutoTopUpRequested => "auto_top_up_requested",
    WebhookFailed => "webhook_failed",
});

/// Internal advertiser notification picked up by the external email sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub advertiser_slug: AdvertiserSlug,
    pub kind: NotificationKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        advertiser_slug: impl Into<String>,
        kind: NotificationKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            advertiser_slug: advertiser_slug.into(),
            kind,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

/// Audit log record for dispute resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    /// Human-readable reason ("budget exhausted", "end_date passed", ...)
    pub cause: String,
    pub actor: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        cause: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            cause: cause.into(),
            actor: actor.into(),
            details: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_lifecycle_edges() {
        use CampaignState::*;

        assert!(Draft.can_transition_to(PendingReview));
        assert!(PendingReview.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Active));
        assert!(Active.can_transition_to(BudgetExhausted));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Approved.can_transition_to(Completed));
        assert!(Draft.can_transition_to(Rejected));

        assert!(!Draft.can_transition_to(Active));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Rejected.can_transition_to(Draft));
        assert!(!Completed.can_transition_to(Rejected));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn test_tier_ordering_is_total() {
        assert!(SponsorshipTier::Platinum > SponsorshipTier::Gold);
        assert!(SponsorshipTier::Gold > SponsorshipTier::Silver);
        assert!(SponsorshipTier::Silver > SponsorshipTier::Standard);
    }

    #[test]
    fn test_expired_tier_counts_as_standard() {
        let mut campaign = Campaign::new(
            "acme",
            "spring",
            Placement::DealsFeatured,
            0,
            None,
            day("2026-01-01"),
            None,
        );
        campaign.tier = SponsorshipTier::Gold;
        campaign.tier_expires_on = Some(day("2026-03-31"));

        assert_eq!(campaign.effective_tier(day("2026-03-31")), SponsorshipTier::Gold);
        assert_eq!(
            campaign.effective_tier(day("2026-04-01")),
            SponsorshipTier::Standard
        );
    }

    #[test]
    fn test_window_contains_is_inclusive() {
        let campaign = Campaign::new(
            "acme",
            "q2",
            Placement::CpcListing,
            200,
            Some(1000),
            day("2026-04-01"),
            Some(day("2026-06-30")),
        );

        assert!(!campaign.window_contains(day("2026-03-31")));
        assert!(campaign.window_contains(day("2026-04-01")));
        assert!(campaign.window_contains(day("2026-06-30")));
        assert!(!campaign.window_contains(day("2026-07-01")));
        assert!(campaign.is_cpc());
    }

    #[test]
    fn test_cpc_campaign_exhausts_when_next_click_does_not_fit() {
        let mut campaign = Campaign::new(
            "acme",
            "q2",
            Placement::CpcListing,
            300,
            Some(1000),
            day("2026-04-01"),
            None,
        );
        campaign.total_spent_cents = 900;

        assert!(!campaign.budget_reached());
        assert!(!campaign.can_afford(300));
        assert!(campaign.can_afford(100));
        assert!(campaign.spend_exhausted());
    }

    #[test]
    fn test_text_enums_parse_back() {
        assert_eq!("deals-featured".parse::<Placement>().unwrap(), Placement::DealsFeatured);
        assert_eq!(
            "first_trade".parse::<ConversionType>().unwrap(),
            ConversionType::FirstTrade
        );
        assert!("signup".parse::<ConversionType>().is_err());
        assert_eq!(
            serde_json::to_value(Placement::CompareSidebar).unwrap(),
            serde_json::json!("compare-sidebar")
        );
    }
}
