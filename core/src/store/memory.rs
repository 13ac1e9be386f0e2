//! In-process [`MarketplaceStore`] for tests and single-instance deployments.
//!
//! All state lives behind one mutex, so every trait method is linearizable.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use super::{ConversionInsert, LedgerOutcome, LedgerRequest, MarketplaceStore, WalletSettings};
use crate::error::{MarketplaceError, MarketplaceResult};
use crate::types::{
    Advertiser, AdvertiserStatus, AuditEntry, Campaign, CampaignEvent, CampaignId, CampaignState,
    Cents, ClickRecord, ConversionEvent, DailyStat, DeliveryStatus, LedgerEntry, LedgerEntryKind,
    Notification, PromoOffer, SponsorshipTier, Wallet, WebhookDelivery,
};

/// `(advertiser_slug, kind, reference_id)`
type LedgerKey = (String, LedgerEntryKind, String);

#[derive(Default)]
struct State {
    advertisers: HashMap<String, Advertiser>,
    wallets: HashMap<String, Wallet>,
    ledger: HashMap<LedgerKey, LedgerEntry>,
    campaigns: BTreeMap<CampaignId, Campaign>,
    events: Vec<CampaignEvent>,
    clicks: HashMap<String, ClickRecord>,
    conversions: HashMap<String, ConversionEvent>,
    daily_stats: HashMap<(CampaignId, NaiveDate), DailyStat>,
    deliveries: BTreeMap<Uuid, WebhookDelivery>,
    promotions: BTreeMap<Uuid, PromoOffer>,
    notifications: Vec<Notification>,
    audit: Vec<AuditEntry>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing_wallet(slug: &str) -> MarketplaceError {
    MarketplaceError::not_found(format!("wallet for advertiser {}", slug))
}

fn missing_campaign(id: CampaignId) -> MarketplaceError {
    MarketplaceError::not_found(format!("campaign {}", id))
}

#[async_trait]
impl MarketplaceStore for InMemoryStore {
    async fn insert_advertiser(
        &self,
        advertiser: Advertiser,
        wallet: Wallet,
    ) -> MarketplaceResult<()> {
        let mut state = self.state.lock();
        if state.advertisers.contains_key(&advertiser.slug) {
            return Err(MarketplaceError::Conflict(format!(
                "advertiser slug {} already registered",
                advertiser.slug
            )));
        }
        if state
            .advertisers
            .values()
            .any(|existing| existing.api_key == advertiser.api_key)
        {
            return Err(MarketplaceError::Conflict("api key already in use".into()));
        }
        state.wallets.insert(advertiser.slug.clone(), wallet);
        state.advertisers.insert(advertiser.slug.clone(), advertiser);
        Ok(())
    }

    async fn get_advertiser(&self, slug: &str) -> MarketplaceResult<Option<Advertiser>> {
        Ok(self.state.lock().advertisers.get(slug).cloned())
    }

    async fn find_advertiser_by_api_key(
        &self,
        api_key: &str,
    ) -> MarketplaceResult<Option<Advertiser>> {
        let state = self.state.lock();
        Ok(state
            .advertisers
            .values()
            .find(|advertiser| advertiser.api_key == api_key)
            .cloned())
    }

    async fn set_advertiser_status(
        &self,
        slug: &str,
        status: AdvertiserStatus,
    ) -> MarketplaceResult<bool> {
        let mut state = self.state.lock();
        match state.advertisers.get_mut(slug) {
            Some(advertiser) if advertiser.status != status => {
                advertiser.status = status;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(MarketplaceError::not_found(format!("advertiser {}", slug))),
        }
    }

    async fn get_wallet(&self, slug: &str) -> MarketplaceResult<Option<Wallet>> {
        Ok(self.state.lock().wallets.get(slug).cloned())
    }

    async fn list_wallets(&self) -> MarketplaceResult<Vec<Wallet>> {
        let state = self.state.lock();
        let mut wallets: Vec<Wallet> = state.wallets.values().cloned().collect();
        wallets.sort_by(|a, b| a.advertiser_slug.cmp(&b.advertiser_slug));
        Ok(wallets)
    }

    async fn apply_ledger_entry(&self, request: LedgerRequest) -> MarketplaceResult<LedgerOutcome> {
        let mut state = self.state.lock();
        let key = (
            request.advertiser_slug.clone(),
            request.kind,
            request.reference_id.clone(),
        );

        if let Some(existing) = state.ledger.get(&key).cloned() {
            let wallet = state
                .wallets
                .get(&request.advertiser_slug)
                .cloned()
                .ok_or_else(|| missing_wallet(&request.advertiser_slug))?;
            return Ok(LedgerOutcome {
                applied: false,
                entry: existing,
                balance_before_cents: wallet.balance_cents,
                balance_after_cents: wallet.balance_cents,
                wallet,
            });
        }

        let wallet = state
            .wallets
            .get_mut(&request.advertiser_slug)
            .ok_or_else(|| missing_wallet(&request.advertiser_slug))?;

        let balance_before = wallet.balance_cents;
        match request.kind {
            LedgerEntryKind::Credit => {
                wallet.balance_cents += request.amount_cents;
                wallet.lifetime_deposited_cents += request.amount_cents;
            }
            LedgerEntryKind::Debit => {
                wallet.balance_cents -= request.amount_cents;
                wallet.lifetime_spent_cents += request.amount_cents;
            }
        }
        wallet.updated_at = Utc::now();
        let wallet = wallet.clone();

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            advertiser_slug: request.advertiser_slug,
            kind: request.kind,
            amount_cents: request.amount_cents,
            reference_id: request.reference_id,
            source: request.source,
            balance_after_cents: wallet.balance_cents,
            created_at: wallet.updated_at,
        };
        state.ledger.insert(key, entry.clone());

        Ok(LedgerOutcome {
            applied: true,
            entry,
            balance_before_cents: balance_before,
            balance_after_cents: wallet.balance_cents,
            wallet,
        })
    }

    async fn ledger_entry(
        &self,
        slug: &str,
        kind: LedgerEntryKind,
        reference_id: &str,
    ) -> MarketplaceResult<Option<LedgerEntry>> {
        let state = self.state.lock();
        let key = (slug.to_string(), kind, reference_id.to_string());
        Ok(state.ledger.get(&key).cloned())
    }

    async fn ledger_entries(&self, slug: &str) -> MarketplaceResult<Vec<LedgerEntry>> {
        let state = self.state.lock();
        let mut entries: Vec<LedgerEntry> = state
            .ledger
            .values()
            .filter(|entry| entry.advertiser_slug == slug)
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.created_at);
        Ok(entries)
    }

    async fn configure_wallet(
        &self,
        slug: &str,
        settings: WalletSettings,
    ) -> MarketplaceResult<Wallet> {
        let mut state = self.state.lock();
        let wallet = state.wallets.get_mut(slug).ok_or_else(|| missing_wallet(slug))?;
        wallet.low_balance_threshold_cents = settings.low_balance_threshold_cents;
        wallet.low_balance_alerts_enabled = settings.low_balance_alerts_enabled;
        wallet.auto_top_up = settings.auto_top_up;
        wallet.updated_at = Utc::now();
        Ok(wallet.clone())
    }

    async fn claim_low_balance_alert(
        &self,
        slug: &str,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> MarketplaceResult<bool> {
        let mut state = self.state.lock();
        let wallet = state.wallets.get_mut(slug).ok_or_else(|| missing_wallet(slug))?;
        match wallet.last_low_balance_alert_at {
            Some(last) if now - last < cooldown => Ok(false),
            _ => {
                wallet.last_low_balance_alert_at = Some(now);
                Ok(true)
            }
        }
    }

    async fn insert_campaign(&self, campaign: Campaign) -> MarketplaceResult<()> {
        let mut state = self.state.lock();
        if state.campaigns.contains_key(&campaign.id) {
            return Err(MarketplaceError::Conflict(format!(
                "campaign {} already exists",
                campaign.id
            )));
        }
        state.campaigns.insert(campaign.id, campaign);
        Ok(())
    }

    async fn get_campaign(&self, id: CampaignId) -> MarketplaceResult<Option<Campaign>> {
        Ok(self.state.lock().campaigns.get(&id).cloned())
    }

    async fn list_campaigns(&self) -> MarketplaceResult<Vec<Campaign>> {
        let state = self.state.lock();
        let mut campaigns: Vec<Campaign> = state.campaigns.values().cloned().collect();
        campaigns.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(campaigns)
    }

    async fn campaigns_for_advertiser(&self, slug: &str) -> MarketplaceResult<Vec<Campaign>> {
        let state = self.state.lock();
        Ok(state
            .campaigns
            .values()
            .filter(|campaign| campaign.advertiser_slug == slug)
            .cloned()
            .collect())
    }

    async fn transition_campaign(
        &self,
        id: CampaignId,
        from: &[CampaignState],
        to: CampaignState,
    ) -> MarketplaceResult<bool> {
        let mut state = self.state.lock();
        let campaign = state.campaigns.get_mut(&id).ok_or_else(|| missing_campaign(id))?;
        if !from.contains(&campaign.state) {
            return Ok(false);
        }
        campaign.state = to;
        campaign.updated_at = Utc::now();
        Ok(true)
    }

    async fn reserve_click_spend(
        &self,
        id: CampaignId,
        amount_cents: Cents,
        event: CampaignEvent,
    ) -> MarketplaceResult<Option<Campaign>> {
        let mut state = self.state.lock();
        let campaign = state.campaigns.get_mut(&id).ok_or_else(|| missing_campaign(id))?;
        if campaign.state != CampaignState::Active || !campaign.can_afford(amount_cents) {
            return Ok(None);
        }
        campaign.total_spent_cents += amount_cents;
        campaign.updated_at = Utc::now();
        let updated = campaign.clone();
        state.events.push(event);
        Ok(Some(updated))
    }

    async fn set_campaign_tier(
        &self,
        id: CampaignId,
        tier: SponsorshipTier,
        expires_on: Option<NaiveDate>,
    ) -> MarketplaceResult<bool> {
        let mut state = self.state.lock();
        let campaign = state.campaigns.get_mut(&id).ok_or_else(|| missing_campaign(id))?;
        if campaign.tier == tier && campaign.tier_expires_on == expires_on {
            return Ok(false);
        }
        campaign.tier = tier;
        campaign.tier_expires_on = expires_on;
        campaign.updated_at = Utc::now();
        Ok(true)
    }

    async fn append_event(&self, event: CampaignEvent) -> MarketplaceResult<()> {
        self.state.lock().events.push(event);
        Ok(())
    }

    async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> MarketplaceResult<Vec<CampaignEvent>> {
        let state = self.state.lock();
        let mut events: Vec<CampaignEvent> = state
            .events
            .iter()
            .filter(|event| event.occurred_at >= from && event.occurred_at < to)
            .cloned()
            .collect();
        events.sort_by_key(|event| event.occurred_at);
        Ok(events)
    }

    async fn insert_click(&self, click: ClickRecord) -> MarketplaceResult<()> {
        let mut state = self.state.lock();
        if state.clicks.contains_key(&click.click_id) {
            return Err(MarketplaceError::Conflict(format!(
                "click {} already recorded",
                click.click_id
            )));
        }
        state.clicks.insert(click.click_id.clone(), click);
        Ok(())
    }

    async fn get_click(&self, click_id: &str) -> MarketplaceResult<Option<ClickRecord>> {
        Ok(self.state.lock().clicks.get(click_id).cloned())
    }

    async fn record_conversion(
        &self,
        conversion: ConversionEvent,
        event: CampaignEvent,
        delivery: Option<WebhookDelivery>,
    ) -> MarketplaceResult<ConversionInsert> {
        let mut state = self.state.lock();
        if let Some(existing) = state.conversions.get(&conversion.idempotency_key) {
            return Ok(ConversionInsert::Duplicate(existing.clone()));
        }

        if let Some(campaign_id) = conversion.campaign_id {
            let day = conversion.created_at.date_naive();
            let stat = state
                .daily_stats
                .entry((campaign_id, day))
                .or_insert_with(|| DailyStat::empty(campaign_id, day));
            stat.conversions += 1;
            stat.conversion_value_cents += conversion.value_cents.unwrap_or(0);
            stat.updated_at = Utc::now();
        }
        state.events.push(event);
        if let Some(delivery) = delivery {
            state.deliveries.insert(delivery.id, delivery);
        }
        state
            .conversions
            .insert(conversion.idempotency_key.clone(), conversion.clone());
        Ok(ConversionInsert::Inserted(conversion))
    }

    async fn conversions_for_click(
        &self,
        click_id: &str,
    ) -> MarketplaceResult<Vec<ConversionEvent>> {
        let state = self.state.lock();
        let mut conversions: Vec<ConversionEvent> = state
            .conversions
            .values()
            .filter(|conversion| conversion.click_id == click_id)
            .cloned()
            .collect();
        conversions.sort_by_key(|conversion| conversion.created_at);
        Ok(conversions)
    }

    async fn upsert_daily_stat(&self, stat: DailyStat) -> MarketplaceResult<()> {
        self.state
            .lock()
            .daily_stats
            .insert((stat.campaign_id, stat.day), stat);
        Ok(())
    }

    async fn get_daily_stat(
        &self,
        campaign_id: CampaignId,
        day: NaiveDate,
    ) -> MarketplaceResult<Option<DailyStat>> {
        Ok(self.state.lock().daily_stats.get(&(campaign_id, day)).cloned())
    }

    async fn enqueue_delivery(&self, delivery: WebhookDelivery) -> MarketplaceResult<()> {
        self.state.lock().deliveries.insert(delivery.id, delivery);
        Ok(())
    }

    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease_until: DateTime<Utc>,
    ) -> MarketplaceResult<Vec<WebhookDelivery>> {
        let mut state = self.state.lock();
        let mut due: Vec<&mut WebhookDelivery> = state
            .deliveries
            .values_mut()
            .filter(|d| d.status == DeliveryStatus::Pending && d.next_retry_at <= now)
            .collect();
        due.sort_by(|a, b| {
            a.next_retry_at
                .cmp(&b.next_retry_at)
                .then(a.created_at.cmp(&b.created_at))
        });

        let mut claimed = Vec::new();
        for delivery in due.into_iter().take(limit) {
            delivery.next_retry_at = lease_until;
            claimed.push((*delivery).clone());
        }
        Ok(claimed)
    }

    async fn renew_delivery_lease(
        &self,
        id: Uuid,
        held_until: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> MarketplaceResult<bool> {
        let mut state = self.state.lock();
        match state.deliveries.get_mut(&id) {
            Some(d) if d.status == DeliveryStatus::Pending && d.next_retry_at == held_until => {
                d.next_retry_at = lease_until;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(MarketplaceError::not_found(format!("webhook delivery {}", id))),
        }
    }

    async fn save_delivery(
        &self,
        delivery: WebhookDelivery,
        held_until: DateTime<Utc>,
    ) -> MarketplaceResult<bool> {
        let mut state = self.state.lock();
        match state.deliveries.get_mut(&delivery.id) {
            Some(d) if d.status == DeliveryStatus::Pending && d.next_retry_at == held_until => {
                *d = delivery;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(MarketplaceError::not_found(format!(
                "webhook delivery {}",
                delivery.id
            ))),
        }
    }

    async fn get_delivery(&self, id: Uuid) -> MarketplaceResult<Option<WebhookDelivery>> {
        Ok(self.state.lock().deliveries.get(&id).cloned())
    }

    async fn insert_promotion(&self, offer: PromoOffer) -> MarketplaceResult<()> {
        self.state.lock().promotions.insert(offer.id, offer);
        Ok(())
    }

    async fn list_promotions(&self) -> MarketplaceResult<Vec<PromoOffer>> {
        Ok(self.state.lock().promotions.values().cloned().collect())
    }

    async fn deactivate_promotion(&self, id: Uuid) -> MarketplaceResult<bool> {
        let mut state = self.state.lock();
        match state.promotions.get_mut(&id) {
            Some(offer) if offer.active => {
                offer.active = false;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(MarketplaceError::not_found(format!("promotion {}", id))),
        }
    }

    async fn insert_notification(&self, notification: Notification) -> MarketplaceResult<()> {
        self.state.lock().notifications.push(notification);
        Ok(())
    }

    async fn notifications_for(&self, slug: &str) -> MarketplaceResult<Vec<Notification>> {
        let state = self.state.lock();
        Ok(state
            .notifications
            .iter()
            .filter(|notification| notification.advertiser_slug == slug)
            .cloned()
            .collect())
    }

    async fn append_audit(&self, entry: AuditEntry) -> MarketplaceResult<()> {
        self.state.lock().audit.push(entry);
        Ok(())
    }

    async fn list_audit(&self) -> MarketplaceResult<Vec<AuditEntry>> {
        Ok(self.state.lock().audit.clone())
    }
}
