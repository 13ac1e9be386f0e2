//! Fixtures shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{MarketplaceError, MarketplaceResult};
use crate::store::{
    ConversionInsert, InMemoryStore, LedgerOutcome, LedgerRequest, MarketplaceStore,
    WalletSettings,
};
use crate::types::{
    Advertiser, AdvertiserStatus, AuditEntry, Campaign, CampaignEvent, CampaignId, CampaignState,
    Cents, ClickRecord, ConversionEvent, DailyStat, LedgerEntry, LedgerEntryKind, Notification,
    Placement, PromoOffer, SponsorshipTier, Wallet, WebhookDelivery,
};

pub fn api_key_for(slug: &str) -> String {
    format!("key-{}-0123456789abcdef", slug)
}

/// Inserts an `active` advertiser with an empty wallet.
pub async fn register_active(store: &Arc<dyn MarketplaceStore>, slug: &str) -> Advertiser {
    register_with_webhook(store, slug, None).await
}

pub async fn register_with_webhook(
    store: &Arc<dyn MarketplaceStore>,
    slug: &str,
    webhook_url: Option<&str>,
) -> Advertiser {
    let advertiser = Advertiser {
        slug: slug.to_string(),
        display_name: slug.to_uppercase(),
        status: AdvertiserStatus::Active,
        api_key: api_key_for(slug),
        webhook_url: webhook_url.map(str::to_string),
        destination_url: Some(format!("https://{}.example/open-account", slug)),
        created_at: Utc::now(),
    };
    store
        .insert_advertiser(advertiser.clone(), Wallet::new(slug))
        .await
        .unwrap();
    advertiser
}

/// Draft campaign whose window started yesterday and has no end.
pub fn sample_campaign(
    slug: &str,
    placement: Placement,
    rate_cents: Cents,
    budget_cents: Option<Cents>,
) -> Campaign {
    let yesterday = Utc::now().date_naive() - Duration::days(1);
    Campaign::new(
        slug,
        format!("{} {}", slug, placement),
        placement,
        rate_cents,
        budget_cents,
        yesterday,
        None,
    )
}

/// Stores `campaign` directly in `active`.
pub async fn insert_active(store: &Arc<dyn MarketplaceStore>, mut campaign: Campaign) -> Campaign {
    campaign.state = CampaignState::Active;
    store.insert_campaign(campaign.clone()).await.unwrap();
    campaign
}

pub async fn fund(store: &Arc<dyn MarketplaceStore>, slug: &str, amount_cents: Cents) {
    store
        .apply_ledger_entry(LedgerRequest {
            advertiser_slug: slug.to_string(),
            kind: LedgerEntryKind::Credit,
            amount_cents,
            reference_id: format!("seed-{}-{}", slug, Uuid::new_v4()),
            source: Some("test".to_string()),
        })
        .await
        .unwrap();
}

/// Wraps [`InMemoryStore`], failing or delaying chosen operations by name.
/// A delay sleeps before the inner call, so a cancelled caller writes nothing.
#[derive(Default)]
pub struct FaultyStore {
    inner: InMemoryStore,
    fail_once: Mutex<HashSet<&'static str>>,
    delays: Mutex<HashMap<&'static str, std::time::Duration>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_once(&self, operation: &'static str) {
        self.fail_once.lock().insert(operation);
    }

    pub fn delay(&self, operation: &'static str, delay: std::time::Duration) {
        self.delays.lock().insert(operation, delay);
    }

    async fn gate(&self, operation: &'static str) -> MarketplaceResult<()> {
        let delay = self.delays.lock().get(operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_once.lock().remove(operation) {
            return Err(MarketplaceError::storage("connection reset"));
        }
        Ok(())
    }
}

#[async_trait]
impl MarketplaceStore for FaultyStore {
    async fn insert_advertiser(
        &self,
        advertiser: Advertiser,
        wallet: Wallet,
    ) -> MarketplaceResult<()> {
        self.gate("insert_advertiser").await?;
        self.inner.insert_advertiser(advertiser, wallet).await
    }

    async fn get_advertiser(&self, slug: &str) -> MarketplaceResult<Option<Advertiser>> {
        self.gate("get_advertiser").await?;
        self.inner.get_advertiser(slug).await
    }

    async fn find_advertiser_by_api_key(
        &self,
        api_key: &str,
    ) -> MarketplaceResult<Option<Advertiser>> {
        self.gate("find_advertiser_by_api_key").await?;
        self.inner.find_advertiser_by_api_key(api_key).await
    }

    async fn set_advertiser_status(
        &self,
        slug: &str,
        status: AdvertiserStatus,
    ) -> MarketplaceResult<bool> {
        self.gate("set_advertiser_status").await?;
        self.inner.set_advertiser_status(slug, status).await
    }

    async fn get_wallet(&self, slug: &str) -> MarketplaceResult<Option<Wallet>> {
        self.gate("get_wallet").await?;
        self.inner.get_wallet(slug).await
    }

    async fn list_wallets(&self) -> MarketplaceResult<Vec<Wallet>> {
        self.gate("list_wallets").await?;
        self.inner.list_wallets().await
    }

    async fn apply_ledger_entry(&self, request: LedgerRequest) -> MarketplaceResult<LedgerOutcome> {
        self.gate("apply_ledger_entry").await?;
        self.inner.apply_ledger_entry(request).await
    }

    async fn ledger_entry(
        &self,
        slug: &str,
        kind: LedgerEntryKind,
        reference_id: &str,
    ) -> MarketplaceResult<Option<LedgerEntry>> {
        self.gate("ledger_entry").await?;
        self.inner.ledger_entry(slug, kind, reference_id).await
    }

    async fn ledger_entries(&self, slug: &str) -> MarketplaceResult<Vec<LedgerEntry>> {
        self.gate("ledger_entries").await?;
        self.inner.ledger_entries(slug).await
    }

    async fn configure_wallet(
        &self,
        slug: &str,
        settings: WalletSettings,
    ) -> MarketplaceResult<Wallet> {
        self.gate("configure_wallet").await?;
        self.inner.configure_wallet(slug, settings).await
    }

    async fn claim_low_balance_alert(
        &self,
        slug: &str,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> MarketplaceResult<bool> {
        self.gate("claim_low_balance_alert").await?;
        self.inner.claim_low_balance_alert(slug, now, cooldown).await
    }

    async fn insert_campaign(&self, campaign: Campaign) -> MarketplaceResult<()> {
        self.gate("insert_campaign").await?;
        self.inner.insert_campaign(campaign).await
    }

    async fn get_campaign(&self, id: CampaignId) -> MarketplaceResult<Option<Campaign>> {
        self.gate("get_campaign").await?;
        self.inner.get_campaign(id).await
    }

    async fn list_campaigns(&self) -> MarketplaceResult<Vec<Campaign>> {
        self.gate("list_campaigns").await?;
        self.inner.list_campaigns().await
    }

    async fn campaigns_for_advertiser(&self, slug: &str) -> MarketplaceResult<Vec<Campaign>> {
        self.gate("campaigns_for_advertiser").await?;
        self.inner.campaigns_for_advertiser(slug).await
    }

    async fn transition_campaign(
        &self,
        id: CampaignId,
        from: &[CampaignState],
        to: CampaignState,
    ) -> MarketplaceResult<bool> {
        self.gate("transition_campaign").await?;
        self.inner.transition_campaign(id, from, to).await
    }

    async fn reserve_click_spend(
        &self,
        id: CampaignId,
        amount_cents: Cents,
        event: CampaignEvent,
    ) -> MarketplaceResult<Option<Campaign>> {
        self.gate("reserve_click_spend").await?;
        self.inner.reserve_click_spend(id, amount_cents, event).await
    }

    async fn set_campaign_tier(
        &self,
        id: CampaignId,
        tier: SponsorshipTier,
        expires_on: Option<NaiveDate>,
    ) -> MarketplaceResult<bool> {
        self.gate("set_campaign_tier").await?;
        self.inner.set_campaign_tier(id, tier, expires_on).await
    }

    async fn append_event(&self, event: CampaignEvent) -> MarketplaceResult<()> {
        self.gate("append_event").await?;
        self.inner.append_event(event).await
    }

    async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> MarketplaceResult<Vec<CampaignEvent>> {
        self.gate("events_between").await?;
        self.inner.events_between(from, to).await
    }

    async fn insert_click(&self, click: ClickRecord) -> MarketplaceResult<()> {
        self.gate("insert_click").await?;
        self.inner.insert_click(click).await
    }

    async fn get_click(&self, click_id: &str) -> MarketplaceResult<Option<ClickRecord>> {
        self.gate("get_click").await?;
        self.inner.get_click(click_id).await
    }

    async fn record_conversion(
        &self,
        conversion: ConversionEvent,
        event: CampaignEvent,
        delivery: Option<WebhookDelivery>,
    ) -> MarketplaceResult<ConversionInsert> {
        self.gate("record_conversion").await?;
        self.inner.record_conversion(conversion, event, delivery).await
    }

    async fn conversions_for_click(
        &self,
        click_id: &str,
    ) -> MarketplaceResult<Vec<ConversionEvent>> {
        self.gate("conversions_for_click").await?;
        self.inner.conversions_for_click(click_id).await
    }

    async fn upsert_daily_stat(&self, stat: DailyStat) -> MarketplaceResult<()> {
        self.gate("upsert_daily_stat").await?;
        self.inner.upsert_daily_stat(stat).await
    }

    async fn get_daily_stat(
        &self,
        campaign_id: CampaignId,
        day: NaiveDate,
    ) -> MarketplaceResult<Option<DailyStat>> {
        self.gate("get_daily_stat").await?;
        self.inner.get_daily_stat(campaign_id, day).await
    }

    async fn enqueue_delivery(&self, delivery: WebhookDelivery) -> MarketplaceResult<()> {
        self.gate("enqueue_delivery").await?;
        self.inner.enqueue_delivery(delivery).await
    }

    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease_until: DateTime<Utc>,
    ) -> MarketplaceResult<Vec<WebhookDelivery>> {
        self.gate("claim_due_deliveries").await?;
        self.inner.claim_due_deliveries(now, limit, lease_until).await
    }

    async fn renew_delivery_lease(
        &self,
        id: Uuid,
        held_until: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> MarketplaceResult<bool> {
        self.gate("renew_delivery_lease").await?;
        self.inner.renew_delivery_lease(id, held_until, lease_until).await
    }

    async fn save_delivery(
        &self,
        delivery: WebhookDelivery,
        held_until: DateTime<Utc>,
    ) -> MarketplaceResult<bool> {
        self.gate("save_delivery").await?;
        self.inner.save_delivery(delivery, held_until).await
    }

    async fn get_delivery(&self, id: Uuid) -> MarketplaceResult<Option<WebhookDelivery>> {
        self.gate("get_delivery").await?;
        self.inner.get_delivery(id).await
    }

    async fn insert_promotion(&self, offer: PromoOffer) -> MarketplaceResult<()> {
        self.gate("insert_promotion").await?;
        self.inner.insert_promotion(offer).await
    }

    async fn list_promotions(&self) -> MarketplaceResult<Vec<PromoOffer>> {
        self.gate("list_promotions").await?;
        self.inner.list_promotions().await
    }

    async fn deactivate_promotion(&self, id: Uuid) -> MarketplaceResult<bool> {
        self.gate("deactivate_promotion").await?;
        self.inner.deactivate_promotion(id).await
    }

    async fn insert_notification(&self, notification: Notification) -> MarketplaceResult<()> {
        self.gate("insert_notification").await?;
        self.inner.insert_notification(notification).await
    }

    async fn notifications_for(&self, slug: &str) -> MarketplaceResult<Vec<Notification>> {
        self.gate("notifications_for").await?;
        self.inner.notifications_for(slug).await
    }

    async fn append_audit(&self, entry: AuditEntry) -> MarketplaceResult<()> {
        self.gate("append_audit").await?;
        self.inner.append_audit(entry).await
    }

    async fn list_audit(&self) -> MarketplaceResult<Vec<AuditEntry>> {
        self.gate("list_audit").await?;
        self.inner.list_audit().await
    }
}
