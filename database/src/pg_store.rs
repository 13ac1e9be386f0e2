//! PostgreSQL implementation of [`MarketplaceStore`].
//!
//! Every mutation is a single guarded statement or one short transaction:
//! wallet mutations lock the wallet row, lifecycle changes are conditional
//! `UPDATE ... RETURNING`, click spend and conversions commit with their
//! dependent rows in one transaction, and delivery claims use
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never share a row.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use marketplace_core::store::{
    ConversionInsert, LedgerOutcome, LedgerRequest, MarketplaceStore, WalletSettings,
};
use marketplace_core::types::{
    Advertiser, AdvertiserStatus, AuditEntry, AutoTopUp, Campaign, CampaignEvent, CampaignId,
    CampaignState, Cents, ClickRecord, ConversionEvent, DailyStat, LedgerEntry, LedgerEntryKind,
    Notification, PromoOffer, SponsorshipTier, Wallet, WebhookDelivery,
};
use marketplace_core::{MarketplaceError, MarketplaceResult};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Row};
use std::str::FromStr;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{store_err, DatabaseError};

const ADVERTISER_COLUMNS: &str =
    "slug, display_name, status, api_key, webhook_url, destination_url, created_at";

const WALLET_COLUMNS: &str = "advertiser_slug, balance_cents, lifetime_deposited_cents, \
     lifetime_spent_cents, low_balance_threshold_cents, low_balance_alerts_enabled, \
     last_low_balance_alert_at, auto_top_up, updated_at";

const LEDGER_COLUMNS: &str = "id, advertiser_slug, kind, amount_cents, reference_id, source, \
     balance_after_cents, created_at";

const CAMPAIGN_COLUMNS: &str = "id, advertiser_slug, name, placement, inventory_type, rate_cents, \
     total_budget_cents, total_spent_cents, start_date, end_date, state, tier, tier_expires_on, \
     created_at, updated_at";

const EVENT_COLUMNS: &str =
    "id, campaign_id, advertiser_slug, event_type, cost_cents, click_id, placement, occurred_at";

const CLICK_COLUMNS: &str = "click_id, advertiser_slug, campaign_id, placement, ip_hash, \
     user_agent_hash, referrer, created_at";

const CONVERSION_COLUMNS: &str = "id, click_id, advertiser_slug, campaign_id, event_type, \
     value_cents, metadata, idempotency_key, created_at";

const STAT_COLUMNS: &str = "campaign_id, day, impressions, clicks, conversions, spend_cents, \
     conversion_value_cents, updated_at";

const DELIVERY_COLUMNS: &str = "id, advertiser_slug, target_url, payload, status, attempt_count, \
     max_attempts, next_retry_at, last_error, created_at, delivered_at";

const PROMO_COLUMNS: &str = "id, advertiser_slug, title, starts_on, ends_on, active";

const NOTIFICATION_COLUMNS: &str = "id, advertiser_slug, kind, message, created_at";

const AUDIT_COLUMNS: &str =
    "id, action, resource_type, resource_id, cause, actor, details, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn wallet_exists(&self, slug: &str) -> MarketplaceResult<()> {
        let found = sqlx::query("SELECT 1 FROM wallets WHERE advertiser_slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        match found {
            Some(_) => Ok(()),
            None => Err(MarketplaceError::not_found(format!(
                "wallet for advertiser {}",
                slug
            ))),
        }
    }

    async fn campaign_exists(&self, id: CampaignId) -> MarketplaceResult<()> {
        let found = sqlx::query("SELECT 1 FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        match found {
            Some(_) => Ok(()),
            None => Err(MarketplaceError::not_found(format!("campaign {}", id))),
        }
    }

    async fn delivery_exists(&self, id: Uuid) -> MarketplaceResult<()> {
        let found = sqlx::query("SELECT 1 FROM webhook_deliveries WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        match found {
            Some(_) => Ok(()),
            None => Err(MarketplaceError::not_found(format!("webhook delivery {}", id))),
        }
    }
}

// ─── shared inserts (pool or open transaction) ─────────────────────────────

async fn insert_event<'e>(
    executor: impl PgExecutor<'e>,
    event: &CampaignEvent,
) -> MarketplaceResult<()> {
    sqlx::query(&format!(
        "INSERT INTO campaign_events ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        EVENT_COLUMNS
    ))
    .bind(event.id)
    .bind(event.campaign_id)
    .bind(&event.advertiser_slug)
    .bind(event.event_type.as_str())
    .bind(event.cost_cents)
    .bind(&event.click_id)
    .bind(event.placement.map(|placement| placement.as_str()))
    .bind(event.occurred_at)
    .execute(executor)
    .await
    .map_err(store_err)?;
    Ok(())
}

async fn insert_delivery<'e>(
    executor: impl PgExecutor<'e>,
    delivery: &WebhookDelivery,
) -> MarketplaceResult<()> {
    sqlx::query(&format!(
        "INSERT INTO webhook_deliveries ({})
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        DELIVERY_COLUMNS
    ))
    .bind(delivery.id)
    .bind(&delivery.advertiser_slug)
    .bind(&delivery.target_url)
    .bind(&delivery.payload)
    .bind(delivery.status.as_str())
    .bind(to_i32(delivery.attempt_count, "attempt_count")?)
    .bind(to_i32(delivery.max_attempts, "max_attempts")?)
    .bind(delivery.next_retry_at)
    .bind(&delivery.last_error)
    .bind(delivery.created_at)
    .bind(delivery.delivered_at)
    .execute(executor)
    .await
    .map_err(store_err)?;
    Ok(())
}

// ─── row decoding ──────────────────────────────────────────────────────────

fn get<'r, T>(row: &'r PgRow, column: &str) -> MarketplaceResult<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column).map_err(store_err)
}

/// Decodes a text column holding one of the snake_case domain enums.
fn text<T>(row: &PgRow, column: &str) -> MarketplaceResult<T>
where
    T: FromStr<Err = MarketplaceError>,
{
    let raw: String = get(row, column)?;
    raw.parse().map_err(|err: MarketplaceError| {
        MarketplaceError::from(DatabaseError::Decode(format!("{}: {}", column, err)))
    })
}

fn opt_text<T>(row: &PgRow, column: &str) -> MarketplaceResult<Option<T>>
where
    T: FromStr<Err = MarketplaceError>,
{
    let raw: Option<String> = get(row, column)?;
    raw.map(|value| {
        value.parse().map_err(|err: MarketplaceError| {
            MarketplaceError::from(DatabaseError::Decode(format!("{}: {}", column, err)))
        })
    })
    .transpose()
}

fn count(row: &PgRow, column: &str) -> MarketplaceResult<u32> {
    let raw: i32 = get(row, column)?;
    u32::try_from(raw).map_err(|_| {
        MarketplaceError::from(DatabaseError::Decode(format!(
            "{}: negative value {}",
            column, raw
        )))
    })
}

fn advertiser_from_row(row: &PgRow) -> MarketplaceResult<Advertiser> {
    Ok(Advertiser {
        slug: get(row, "slug")?,
        display_name: get(row, "display_name")?,
        status: text(row, "status")?,
        api_key: get(row, "api_key")?,
        webhook_url: get(row, "webhook_url")?,
        destination_url: get(row, "destination_url")?,
        created_at: get(row, "created_at")?,
    })
}

fn wallet_from_row(row: &PgRow) -> MarketplaceResult<Wallet> {
    let auto_top_up: Option<Json<AutoTopUp>> = get(row, "auto_top_up")?;
    Ok(Wallet {
        advertiser_slug: get(row, "advertiser_slug")?,
        balance_cents: get(row, "balance_cents")?,
        lifetime_deposited_cents: get(row, "lifetime_deposited_cents")?,
        lifetime_spent_cents: get(row, "lifetime_spent_cents")?,
        low_balance_threshold_cents: get(row, "low_balance_threshold_cents")?,
        low_balance_alerts_enabled: get(row, "low_balance_alerts_enabled")?,
        last_low_balance_alert_at: get(row, "last_low_balance_alert_at")?,
        auto_top_up: auto_top_up.map(|Json(config)| config),
        updated_at: get(row, "updated_at")?,
    })
}

fn ledger_from_row(row: &PgRow) -> MarketplaceResult<LedgerEntry> {
    Ok(LedgerEntry {
        id: get(row, "id")?,
        advertiser_slug: get(row, "advertiser_slug")?,
        kind: text(row, "kind")?,
        amount_cents: get(row, "amount_cents")?,
        reference_id: get(row, "reference_id")?,
        source: get(row, "source")?,
        balance_after_cents: get(row, "balance_after_cents")?,
        created_at: get(row, "created_at")?,
    })
}

fn campaign_from_row(row: &PgRow) -> MarketplaceResult<Campaign> {
    Ok(Campaign {
        id: get(row, "id")?,
        advertiser_slug: get(row, "advertiser_slug")?,
        name: get(row, "name")?,
        placement: text(row, "placement")?,
        inventory_type: text(row, "inventory_type")?,
        rate_cents: get(row, "rate_cents")?,
        total_budget_cents: get(row, "total_budget_cents")?,
        total_spent_cents: get(row, "total_spent_cents")?,
        start_date: get(row, "start_date")?,
        end_date: get(row, "end_date")?,
        state: text(row, "state")?,
        tier: text(row, "tier")?,
        tier_expires_on: get(row, "tier_expires_on")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn event_from_row(row: &PgRow) -> MarketplaceResult<CampaignEvent> {
    Ok(CampaignEvent {
        id: get(row, "id")?,
        campaign_id: get(row, "campaign_id")?,
        advertiser_slug: get(row, "advertiser_slug")?,
        event_type: text(row, "event_type")?,
        cost_cents: get(row, "cost_cents")?,
        click_id: get(row, "click_id")?,
        placement: opt_text(row, "placement")?,
        occurred_at: get(row, "occurred_at")?,
    })
}

fn click_from_row(row: &PgRow) -> MarketplaceResult<ClickRecord> {
    Ok(ClickRecord {
        click_id: get(row, "click_id")?,
        advertiser_slug: get(row, "advertiser_slug")?,
        campaign_id: get(row, "campaign_id")?,
        placement: opt_text(row, "placement")?,
        ip_hash: get(row, "ip_hash")?,
        user_agent_hash: get(row, "user_agent_hash")?,
        referrer: get(row, "referrer")?,
        created_at: get(row, "created_at")?,
    })
}

fn conversion_from_row(row: &PgRow) -> MarketplaceResult<ConversionEvent> {
    Ok(ConversionEvent {
        id: get(row, "id")?,
        click_id: get(row, "click_id")?,
        advertiser_slug: get(row, "advertiser_slug")?,
        campaign_id: get(row, "campaign_id")?,
        event_type: text(row, "event_type")?,
        value_cents: get(row, "value_cents")?,
        metadata: get(row, "metadata")?,
        idempotency_key: get(row, "idempotency_key")?,
        created_at: get(row, "created_at")?,
    })
}

fn stat_from_row(row: &PgRow) -> MarketplaceResult<DailyStat> {
    Ok(DailyStat {
        campaign_id: get(row, "campaign_id")?,
        day: get(row, "day")?,
        impressions: get(row, "impressions")?,
        clicks: get(row, "clicks")?,
        conversions: get(row, "conversions")?,
        spend_cents: get(row, "spend_cents")?,
        conversion_value_cents: get(row, "conversion_value_cents")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn delivery_from_row(row: &PgRow) -> MarketplaceResult<WebhookDelivery> {
    Ok(WebhookDelivery {
        id: get(row, "id")?,
        advertiser_slug: get(row, "advertiser_slug")?,
        target_url: get(row, "target_url")?,
        payload: get(row, "payload")?,
        status: text(row, "status")?,
        attempt_count: count(row, "attempt_count")?,
        max_attempts: count(row, "max_attempts")?,
        next_retry_at: get(row, "next_retry_at")?,
        last_error: get(row, "last_error")?,
        created_at: get(row, "created_at")?,
        delivered_at: get(row, "delivered_at")?,
    })
}

fn promo_from_row(row: &PgRow) -> MarketplaceResult<PromoOffer> {
    Ok(PromoOffer {
        id: get(row, "id")?,
        advertiser_slug: get(row, "advertiser_slug")?,
        title: get(row, "title")?,
        starts_on: get(row, "starts_on")?,
        ends_on: get(row, "ends_on")?,
        active: get(row, "active")?,
    })
}

fn notification_from_row(row: &PgRow) -> MarketplaceResult<Notification> {
    Ok(Notification {
        id: get(row, "id")?,
        advertiser_slug: get(row, "advertiser_slug")?,
        kind: text(row, "kind")?,
        message: get(row, "message")?,
        created_at: get(row, "created_at")?,
    })
}

fn audit_from_row(row: &PgRow) -> MarketplaceResult<AuditEntry> {
    Ok(AuditEntry {
        id: get(row, "id")?,
        action: get(row, "action")?,
        resource_type: get(row, "resource_type")?,
        resource_id: get(row, "resource_id")?,
        cause: get(row, "cause")?,
        actor: get(row, "actor")?,
        details: get(row, "details")?,
        created_at: get(row, "created_at")?,
    })
}

fn collect<T>(
    rows: Vec<PgRow>,
    decode: fn(&PgRow) -> MarketplaceResult<T>,
) -> MarketplaceResult<Vec<T>> {
    rows.iter().map(decode).collect()
}

fn to_i32(value: u32, column: &str) -> MarketplaceResult<i32> {
    i32::try_from(value)
        .map_err(|_| MarketplaceError::validation(format!("{} out of range: {}", column, value)))
}

#[async_trait]
impl MarketplaceStore for PgStore {
    #[instrument(skip(self, advertiser, wallet), fields(slug = %advertiser.slug))]
    async fn insert_advertiser(
        &self,
        advertiser: Advertiser,
        wallet: Wallet,
    ) -> MarketplaceResult<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        sqlx::query(&format!(
            "INSERT INTO advertisers ({}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            ADVERTISER_COLUMNS
        ))
        .bind(&advertiser.slug)
        .bind(&advertiser.display_name)
        .bind(advertiser.status.as_str())
        .bind(&advertiser.api_key)
        .bind(&advertiser.webhook_url)
        .bind(&advertiser.destination_url)
        .bind(advertiser.created_at)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        sqlx::query(&format!(
            "INSERT INTO wallets ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            WALLET_COLUMNS
        ))
        .bind(&wallet.advertiser_slug)
        .bind(wallet.balance_cents)
        .bind(wallet.lifetime_deposited_cents)
        .bind(wallet.lifetime_spent_cents)
        .bind(wallet.low_balance_threshold_cents)
        .bind(wallet.low_balance_alerts_enabled)
        .bind(wallet.last_low_balance_alert_at)
        .bind(wallet.auto_top_up.map(Json))
        .bind(wallet.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)
    }

    async fn get_advertiser(&self, slug: &str) -> MarketplaceResult<Option<Advertiser>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM advertisers WHERE slug = $1",
            ADVERTISER_COLUMNS
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(advertiser_from_row).transpose()
    }

    async fn find_advertiser_by_api_key(
        &self,
        api_key: &str,
    ) -> MarketplaceResult<Option<Advertiser>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM advertisers WHERE api_key = $1",
            ADVERTISER_COLUMNS
        ))
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(advertiser_from_row).transpose()
    }

    async fn set_advertiser_status(
        &self,
        slug: &str,
        status: AdvertiserStatus,
    ) -> MarketplaceResult<bool> {
        let result = sqlx::query(
            "UPDATE advertisers SET status = $2 WHERE slug = $1 AND status <> $2",
        )
        .bind(slug)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.get_advertiser(slug).await? {
            Some(_) => Ok(false),
            None => Err(MarketplaceError::not_found(format!("advertiser {}", slug))),
        }
    }

    async fn get_wallet(&self, slug: &str) -> MarketplaceResult<Option<Wallet>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM wallets WHERE advertiser_slug = $1",
            WALLET_COLUMNS
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn list_wallets(&self) -> MarketplaceResult<Vec<Wallet>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM wallets ORDER BY advertiser_slug",
            WALLET_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        collect(rows, wallet_from_row)
    }

    #[instrument(skip(self, request), fields(slug = %request.advertiser_slug, kind = %request.kind, reference_id = %request.reference_id))]
    async fn apply_ledger_entry(&self, request: LedgerRequest) -> MarketplaceResult<LedgerOutcome> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        // Row lock serializes every mutation of this wallet.
        let locked = sqlx::query(&format!(
            "SELECT {} FROM wallets WHERE advertiser_slug = $1 FOR UPDATE",
            WALLET_COLUMNS
        ))
        .bind(&request.advertiser_slug)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;
        let wallet = match locked {
            Some(row) => wallet_from_row(&row)?,
            None => {
                return Err(MarketplaceError::not_found(format!(
                    "wallet for advertiser {}",
                    request.advertiser_slug
                )))
            }
        };

        let balance_before = wallet.balance_cents;
        let (balance_after, deposited_delta, spent_delta) = match request.kind {
            LedgerEntryKind::Credit => (
                balance_before + request.amount_cents,
                request.amount_cents,
                0,
            ),
            LedgerEntryKind::Debit => (
                balance_before - request.amount_cents,
                0,
                request.amount_cents,
            ),
        };

        let inserted = sqlx::query(&format!(
            "INSERT INTO ledger_entries ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (advertiser_slug, kind, reference_id) DO NOTHING
             RETURNING {}",
            LEDGER_COLUMNS, LEDGER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&request.advertiser_slug)
        .bind(request.kind.as_str())
        .bind(request.amount_cents)
        .bind(&request.reference_id)
        .bind(&request.source)
        .bind(balance_after)
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;

        let entry = match inserted {
            Some(row) => ledger_from_row(&row)?,
            None => {
                let existing = sqlx::query(&format!(
                    "SELECT {} FROM ledger_entries
                     WHERE advertiser_slug = $1 AND kind = $2 AND reference_id = $3",
                    LEDGER_COLUMNS
                ))
                .bind(&request.advertiser_slug)
                .bind(request.kind.as_str())
                .bind(&request.reference_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(store_err)?;
                tx.commit().await.map_err(store_err)?;

                debug!("Ledger reference already applied");
                return Ok(LedgerOutcome {
                    applied: false,
                    entry: ledger_from_row(&existing)?,
                    balance_before_cents: balance_before,
                    balance_after_cents: balance_before,
                    wallet,
                });
            }
        };

        let updated = sqlx::query(&format!(
            "UPDATE wallets
             SET balance_cents = balance_cents + $2 - $3,
                 lifetime_deposited_cents = lifetime_deposited_cents + $2,
                 lifetime_spent_cents = lifetime_spent_cents + $3,
                 updated_at = NOW()
             WHERE advertiser_slug = $1
             RETURNING {}",
            WALLET_COLUMNS
        ))
        .bind(&request.advertiser_slug)
        .bind(deposited_delta)
        .bind(spent_delta)
        .fetch_one(&mut *tx)
        .await
        .map_err(store_err)?;
        let wallet = wallet_from_row(&updated)?;

        tx.commit().await.map_err(store_err)?;

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
        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries
             WHERE advertiser_slug = $1 AND kind = $2 AND reference_id = $3",
            LEDGER_COLUMNS
        ))
        .bind(slug)
        .bind(kind.as_str())
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(ledger_from_row).transpose()
    }

    async fn ledger_entries(&self, slug: &str) -> MarketplaceResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE advertiser_slug = $1 ORDER BY created_at, id",
            LEDGER_COLUMNS
        ))
        .bind(slug)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        collect(rows, ledger_from_row)
    }

    async fn configure_wallet(
        &self,
        slug: &str,
        settings: WalletSettings,
    ) -> MarketplaceResult<Wallet> {
        let row = sqlx::query(&format!(
            "UPDATE wallets
             SET low_balance_threshold_cents = $2,
                 low_balance_alerts_enabled = $3,
                 auto_top_up = $4,
                 updated_at = NOW()
             WHERE advertiser_slug = $1
             RETURNING {}",
            WALLET_COLUMNS
        ))
        .bind(slug)
        .bind(settings.low_balance_threshold_cents)
        .bind(settings.low_balance_alerts_enabled)
        .bind(settings.auto_top_up.map(Json))
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        match row {
            Some(row) => wallet_from_row(&row),
            None => Err(MarketplaceError::not_found(format!(
                "wallet for advertiser {}",
                slug
            ))),
        }
    }

    async fn claim_low_balance_alert(
        &self,
        slug: &str,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> MarketplaceResult<bool> {
        let result = sqlx::query(
            "UPDATE wallets SET last_low_balance_alert_at = $2
             WHERE advertiser_slug = $1
               AND (last_low_balance_alert_at IS NULL OR last_low_balance_alert_at <= $3)",
        )
        .bind(slug)
        .bind(now)
        .bind(now - cooldown)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.wallet_exists(slug).await?;
        Ok(false)
    }

    async fn insert_campaign(&self, campaign: Campaign) -> MarketplaceResult<()> {
        sqlx::query(&format!(
            "INSERT INTO campaigns ({})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            CAMPAIGN_COLUMNS
        ))
        .bind(campaign.id)
        .bind(&campaign.advertiser_slug)
        .bind(&campaign.name)
        .bind(campaign.placement.as_str())
        .bind(campaign.inventory_type.as_str())
        .bind(campaign.rate_cents)
        .bind(campaign.total_budget_cents)
        .bind(campaign.total_spent_cents)
        .bind(campaign.start_date)
        .bind(campaign.end_date)
        .bind(campaign.state.as_str())
        .bind(campaign.tier.as_str())
        .bind(campaign.tier_expires_on)
        .bind(campaign.created_at)
        .bind(campaign.updated_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_campaign(&self, id: CampaignId) -> MarketplaceResult<Option<Campaign>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM campaigns WHERE id = $1",
            CAMPAIGN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(campaign_from_row).transpose()
    }

    async fn list_campaigns(&self) -> MarketplaceResult<Vec<Campaign>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM campaigns ORDER BY created_at, id",
            CAMPAIGN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        collect(rows, campaign_from_row)
    }

    async fn campaigns_for_advertiser(&self, slug: &str) -> MarketplaceResult<Vec<Campaign>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM campaigns WHERE advertiser_slug = $1 ORDER BY created_at, id",
            CAMPAIGN_COLUMNS
        ))
        .bind(slug)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        collect(rows, campaign_from_row)
    }

    async fn transition_campaign(
        &self,
        id: CampaignId,
        from: &[CampaignState],
        to: CampaignState,
    ) -> MarketplaceResult<bool> {
        let from: Vec<String> = from.iter().map(|state| state.as_str().to_string()).collect();
        let result = sqlx::query(
            "UPDATE campaigns SET state = $3, updated_at = NOW()
             WHERE id = $1 AND state = ANY($2)",
        )
        .bind(id)
        .bind(from)
        .bind(to.as_str())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.campaign_exists(id).await?;
        Ok(false)
    }

    #[instrument(skip(self, event))]
    async fn reserve_click_spend(
        &self,
        id: CampaignId,
        amount_cents: Cents,
        event: CampaignEvent,
    ) -> MarketplaceResult<Option<Campaign>> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let row = sqlx::query(&format!(
            "UPDATE campaigns
             SET total_spent_cents = total_spent_cents + $2, updated_at = NOW()
             WHERE id = $1
               AND state = 'active'
               AND (total_budget_cents IS NULL OR total_spent_cents + $2 <= total_budget_cents)
             RETURNING {}",
            CAMPAIGN_COLUMNS
        ))
        .bind(id)
        .bind(amount_cents)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(store_err)?;
            self.campaign_exists(id).await?;
            return Ok(None);
        };
        let campaign = campaign_from_row(&row)?;
        insert_event(&mut *tx, &event).await?;
        tx.commit().await.map_err(store_err)?;
        Ok(Some(campaign))
    }

    async fn set_campaign_tier(
        &self,
        id: CampaignId,
        tier: SponsorshipTier,
        expires_on: Option<NaiveDate>,
    ) -> MarketplaceResult<bool> {
        let result = sqlx::query(
            "UPDATE campaigns SET tier = $2, tier_expires_on = $3, updated_at = NOW()
             WHERE id = $1 AND (tier <> $2 OR tier_expires_on IS DISTINCT FROM $3)",
        )
        .bind(id)
        .bind(tier.as_str())
        .bind(expires_on)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.campaign_exists(id).await?;
        Ok(false)
    }

    async fn append_event(&self, event: CampaignEvent) -> MarketplaceResult<()> {
        insert_event(&self.pool, &event).await
    }

    async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> MarketplaceResult<Vec<CampaignEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM campaign_events
             WHERE occurred_at >= $1 AND occurred_at < $2
             ORDER BY occurred_at, id",
            EVENT_COLUMNS
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        collect(rows, event_from_row)
    }

    async fn insert_click(&self, click: ClickRecord) -> MarketplaceResult<()> {
        sqlx::query(&format!(
            "INSERT INTO clicks ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            CLICK_COLUMNS
        ))
        .bind(&click.click_id)
        .bind(&click.advertiser_slug)
        .bind(click.campaign_id)
        .bind(click.placement.map(|placement| placement.as_str()))
        .bind(&click.ip_hash)
        .bind(&click.user_agent_hash)
        .bind(&click.referrer)
        .bind(click.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_click(&self, click_id: &str) -> MarketplaceResult<Option<ClickRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM clicks WHERE click_id = $1",
            CLICK_COLUMNS
        ))
        .bind(click_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(click_from_row).transpose()
    }

    #[instrument(skip_all, fields(click_id = %conversion.click_id))]
    async fn record_conversion(
        &self,
        conversion: ConversionEvent,
        event: CampaignEvent,
        delivery: Option<WebhookDelivery>,
    ) -> MarketplaceResult<ConversionInsert> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let inserted = sqlx::query(&format!(
            "INSERT INTO conversions ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (idempotency_key) DO NOTHING
             RETURNING id",
            CONVERSION_COLUMNS
        ))
        .bind(conversion.id)
        .bind(&conversion.click_id)
        .bind(&conversion.advertiser_slug)
        .bind(conversion.campaign_id)
        .bind(conversion.event_type.as_str())
        .bind(conversion.value_cents)
        .bind(&conversion.metadata)
        .bind(&conversion.idempotency_key)
        .bind(conversion.created_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;

        if inserted.is_none() {
            let existing = sqlx::query(&format!(
                "SELECT {} FROM conversions WHERE idempotency_key = $1",
                CONVERSION_COLUMNS
            ))
            .bind(&conversion.idempotency_key)
            .fetch_one(&mut *tx)
            .await
            .map_err(store_err)?;
            tx.rollback().await.map_err(store_err)?;
            return Ok(ConversionInsert::Duplicate(conversion_from_row(&existing)?));
        }

        insert_event(&mut *tx, &event).await?;
        if let Some(campaign_id) = conversion.campaign_id {
            sqlx::query(
                "INSERT INTO daily_stats (campaign_id, day, conversions, conversion_value_cents)
                 VALUES ($1, $2, 1, $3)
                 ON CONFLICT (campaign_id, day) DO UPDATE SET
                     conversions = daily_stats.conversions + 1,
                     conversion_value_cents = daily_stats.conversion_value_cents + EXCLUDED.conversion_value_cents,
                     updated_at = NOW()",
            )
            .bind(campaign_id)
            .bind(conversion.created_at.date_naive())
            .bind(conversion.value_cents.unwrap_or(0))
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }
        if let Some(delivery) = &delivery {
            insert_delivery(&mut *tx, delivery).await?;
        }

        tx.commit().await.map_err(store_err)?;
        Ok(ConversionInsert::Inserted(conversion))
    }

    async fn conversions_for_click(
        &self,
        click_id: &str,
    ) -> MarketplaceResult<Vec<ConversionEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM conversions WHERE click_id = $1 ORDER BY created_at, id",
            CONVERSION_COLUMNS
        ))
        .bind(click_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        collect(rows, conversion_from_row)
    }

    async fn upsert_daily_stat(&self, stat: DailyStat) -> MarketplaceResult<()> {
        sqlx::query(&format!(
            "INSERT INTO daily_stats ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (campaign_id, day) DO UPDATE SET
                 impressions = EXCLUDED.impressions,
                 clicks = EXCLUDED.clicks,
                 conversions = EXCLUDED.conversions,
                 spend_cents = EXCLUDED.spend_cents,
                 conversion_value_cents = EXCLUDED.conversion_value_cents,
                 updated_at = EXCLUDED.updated_at",
            STAT_COLUMNS
        ))
        .bind(stat.campaign_id)
        .bind(stat.day)
        .bind(stat.impressions)
        .bind(stat.clicks)
        .bind(stat.conversions)
        .bind(stat.spend_cents)
        .bind(stat.conversion_value_cents)
        .bind(stat.updated_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_daily_stat(
        &self,
        campaign_id: CampaignId,
        day: NaiveDate,
    ) -> MarketplaceResult<Option<DailyStat>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM daily_stats WHERE campaign_id = $1 AND day = $2",
            STAT_COLUMNS
        ))
        .bind(campaign_id)
        .bind(day)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(stat_from_row).transpose()
    }

    async fn enqueue_delivery(&self, delivery: WebhookDelivery) -> MarketplaceResult<()> {
        insert_delivery(&self.pool, &delivery).await
    }

    #[instrument(skip(self))]
    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease_until: DateTime<Utc>,
    ) -> MarketplaceResult<Vec<WebhookDelivery>> {
        let rows = sqlx::query(&format!(
            "UPDATE webhook_deliveries SET next_retry_at = $3
             WHERE id IN (
                 SELECT id FROM webhook_deliveries
                 WHERE status = 'pending' AND next_retry_at <= $1
                 ORDER BY next_retry_at, created_at
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {}",
            DELIVERY_COLUMNS
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(lease_until)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut claimed = collect(rows, delivery_from_row)?;
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        debug!(claimed = claimed.len(), "Claimed due webhook deliveries");
        Ok(claimed)
    }

    async fn renew_delivery_lease(
        &self,
        id: Uuid,
        held_until: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> MarketplaceResult<bool> {
        let result = sqlx::query(
            "UPDATE webhook_deliveries SET next_retry_at = $3
             WHERE id = $1 AND status = 'pending' AND next_retry_at = $2",
        )
        .bind(id)
        .bind(held_until)
        .bind(lease_until)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.delivery_exists(id).await?;
        Ok(false)
    }

    async fn save_delivery(
        &self,
        delivery: WebhookDelivery,
        held_until: DateTime<Utc>,
    ) -> MarketplaceResult<bool> {
        let result = sqlx::query(
            "UPDATE webhook_deliveries SET
                 status = $3,
                 attempt_count = $4,
                 next_retry_at = $5,
                 last_error = $6,
                 delivered_at = $7
             WHERE id = $1 AND status = 'pending' AND next_retry_at = $2",
        )
        .bind(delivery.id)
        .bind(held_until)
        .bind(delivery.status.as_str())
        .bind(to_i32(delivery.attempt_count, "attempt_count")?)
        .bind(delivery.next_retry_at)
        .bind(&delivery.last_error)
        .bind(delivery.delivered_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.delivery_exists(delivery.id).await?;
        Ok(false)
    }

    async fn get_delivery(&self, id: Uuid) -> MarketplaceResult<Option<WebhookDelivery>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM webhook_deliveries WHERE id = $1",
            DELIVERY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(delivery_from_row).transpose()
    }

    async fn insert_promotion(&self, offer: PromoOffer) -> MarketplaceResult<()> {
        sqlx::query(&format!(
            "INSERT INTO promo_offers ({}) VALUES ($1, $2, $3, $4, $5, $6)",
            PROMO_COLUMNS
        ))
        .bind(offer.id)
        .bind(&offer.advertiser_slug)
        .bind(&offer.title)
        .bind(offer.starts_on)
        .bind(offer.ends_on)
        .bind(offer.active)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn list_promotions(&self) -> MarketplaceResult<Vec<PromoOffer>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM promo_offers ORDER BY id",
            PROMO_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        collect(rows, promo_from_row)
    }

    async fn deactivate_promotion(&self, id: Uuid) -> MarketplaceResult<bool> {
        let result =
            sqlx::query("UPDATE promo_offers SET active = FALSE WHERE id = $1 AND active")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM promo_offers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(MarketplaceError::not_found(format!("promotion {}", id))),
        }
    }

    async fn insert_notification(&self, notification: Notification) -> MarketplaceResult<()> {
        sqlx::query(&format!(
            "INSERT INTO notifications ({}) VALUES ($1, $2, $3, $4, $5)",
            NOTIFICATION_COLUMNS
        ))
        .bind(notification.id)
        .bind(&notification.advertiser_slug)
        .bind(notification.kind.as_str())
        .bind(&notification.message)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn notifications_for(&self, slug: &str) -> MarketplaceResult<Vec<Notification>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM notifications WHERE advertiser_slug = $1 ORDER BY created_at, id",
            NOTIFICATION_COLUMNS
        ))
        .bind(slug)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        collect(rows, notification_from_row)
    }

    async fn append_audit(&self, entry: AuditEntry) -> MarketplaceResult<()> {
        sqlx::query(&format!(
            "INSERT INTO audit_log ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            AUDIT_COLUMNS
        ))
        .bind(entry.id)
        .bind(&entry.action)
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(&entry.cause)
        .bind(&entry.actor)
        .bind(&entry.details)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn list_audit(&self) -> MarketplaceResult<Vec<AuditEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM audit_log ORDER BY created_at, id",
            AUDIT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        collect(rows, audit_from_row)
    }
}
