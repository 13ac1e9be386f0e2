//! Wallet Ledger: prepaid advertiser balances.
//!
//! Balances move only through [`WalletLedger::credit`] and [`WalletLedger::debit`],
//! each idempotent under its reference id. Debits are never refused for lack of
//! funds; a debit that takes the balance from positive to zero or below pauses
//! the advertiser's active campaigns before it returns.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::error::{MarketplaceError, MarketplaceResult};
use crate::lifecycle::CampaignLifecycle;
use crate::notify::{Notifier, ACTOR_BILLING};
use crate::store::{LedgerRequest, MarketplaceStore, WalletSettings};
use crate::types::{
    AuditEntry, CampaignId, Cents, LedgerEntry, LedgerEntryKind, NotificationKind, Wallet,
};

/// Minimum spacing between two low-balance alerts for one wallet.
pub fn low_balance_alert_cooldown() -> Duration {
    Duration::hours(24)
}

/// What a credit or debit did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerReceipt {
    /// False on replay of an already applied reference, and for zero debits
    pub applied: bool,
    pub entry: Option<LedgerEntry>,
    pub balance_before_cents: Cents,
    pub balance_after_cents: Cents,
    /// Campaigns paused because this debit crossed zero
    pub paused_campaigns: Vec<CampaignId>,
}

/// Result of [`WalletLedger::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletCheck {
    pub advertiser_slug: String,
    pub balance_cents: Cents,
    pub lifetime_deposited_cents: Cents,
    pub lifetime_spent_cents: Cents,
    /// Credits minus debits over the stored ledger entries
    pub ledger_balance_cents: Cents,
    pub consistent: bool,
}

#[derive(Clone)]
pub struct WalletLedger {
    store: Arc<dyn MarketplaceStore>,
    notifier: Notifier,
    lifecycle: CampaignLifecycle,
}

impl WalletLedger {
    pub fn new(store: Arc<dyn MarketplaceStore>) -> Self {
        Self {
            notifier: Notifier::new(store.clone()),
            lifecycle: CampaignLifecycle::new(store.clone()),
            store,
        }
    }

    pub async fn wallet(&self, advertiser_slug: &str) -> MarketplaceResult<Wallet> {
        self.store
            .get_wallet(advertiser_slug)
            .await?
            .ok_or_else(|| {
                MarketplaceError::not_found(format!("wallet for advertiser {}", advertiser_slug))
            })
    }

    /// Adds funds. Replaying a `reference_id` leaves the balance untouched.
    #[instrument(skip(self, source))]
    pub async fn credit(
        &self,
        advertiser_slug: &str,
        amount_cents: Cents,
        reference_id: &str,
        source: Option<&str>,
    ) -> MarketplaceResult<LedgerReceipt> {
        if amount_cents <= 0 {
            return Err(MarketplaceError::validation("credit amount must be positive"));
        }
        validate_reference(reference_id)?;

        let outcome = self
            .store
            .apply_ledger_entry(LedgerRequest {
                advertiser_slug: advertiser_slug.to_string(),
                kind: LedgerEntryKind::Credit,
                amount_cents,
                reference_id: reference_id.to_string(),
                source: source.map(str::to_string),
            })
            .await?;

        if outcome.applied {
            info!(
                advertiser = advertiser_slug,
                amount_cents,
                balance_cents = outcome.balance_after_cents,
                "Wallet credited"
            );
            metrics::increment_counter!("marketplace_wallet_credits_total");
            self.notifier
                .audit(
                    AuditEntry::new(
                        "wallet.credit",
                        "wallet",
                        advertiser_slug,
                        "top-up",
                        source.unwrap_or("payment_processor"),
                    )
                    .with_details(serde_json::json!({
                        "reference_id": reference_id,
                        "amount_cents": amount_cents,
                        "balance_after_cents": outcome.balance_after_cents,
                    })),
                )
                .await;
        } else {
            info!(advertiser = advertiser_slug, reference_id, "Credit replay ignored");
        }

        Ok(LedgerReceipt {
            applied: outcome.applied,
            entry: Some(outcome.entry),
            balance_before_cents: outcome.balance_before_cents,
            balance_after_cents: outcome.balance_after_cents,
            paused_campaigns: Vec::new(),
        })
    }

    /// Charges the wallet, possibly below zero.
    #[instrument(skip(self))]
    pub async fn debit(
        &self,
        advertiser_slug: &str,
        amount_cents: Cents,
        reference_id: &str,
    ) -> MarketplaceResult<LedgerReceipt> {
        if amount_cents < 0 {
            return Err(MarketplaceError::validation("debit amount must not be negative"));
        }
        validate_reference(reference_id)?;

        if amount_cents == 0 {
            let wallet = self.wallet(advertiser_slug).await?;
            return Ok(LedgerReceipt {
                applied: false,
                entry: None,
                balance_before_cents: wallet.balance_cents,
                balance_after_cents: wallet.balance_cents,
                paused_campaigns: Vec::new(),
            });
        }

        let outcome = self
            .store
            .apply_ledger_entry(LedgerRequest {
                advertiser_slug: advertiser_slug.to_string(),
                kind: LedgerEntryKind::Debit,
                amount_cents,
                reference_id: reference_id.to_string(),
                source: None,
            })
            .await?;

        let mut receipt = LedgerReceipt {
            applied: outcome.applied,
            entry: Some(outcome.entry),
            balance_before_cents: outcome.balance_before_cents,
            balance_after_cents: outcome.balance_after_cents,
            paused_campaigns: Vec::new(),
        };
        if !outcome.applied {
            return Ok(receipt);
        }

        metrics::increment_counter!("marketplace_wallet_debits_total");
        let before = outcome.balance_before_cents;
        let after = outcome.balance_after_cents;

        if before > 0 && after <= 0 {
            receipt.paused_campaigns = self.handle_depletion(advertiser_slug, after).await?;
        }

        let wallet = outcome.wallet;
        if after <= wallet.low_balance_threshold_cents {
            self.maybe_alert_low_balance(&wallet, Utc::now()).await;
        }
        if let Some(auto) = &wallet.auto_top_up {
            if before > auto.threshold_cents && after <= auto.threshold_cents {
                let amount = (auto.target_cents - after).max(0);
                let message = format!(
                    "Balance fell to {} cents; requesting auto top-up of {} cents using {}",
                    after, amount, auto.payment_method_ref
                );
                if let Err(e) = self
                    .notifier
                    .raise(advertiser_slug, NotificationKind::AutoTopUpRequested, message)
                    .await
                {
                    warn!(advertiser = advertiser_slug, "Failed to request auto top-up: {}", e);
                }
            }
        }

        Ok(receipt)
    }

    /// Raises a low-balance alert unless one went out in the last 24h.
    /// Returns whether an alert was raised.
    pub async fn maybe_alert_low_balance(&self, wallet: &Wallet, now: DateTime<Utc>) -> bool {
        if !wallet.low_balance_alerts_enabled {
            return false;
        }
        let slug = wallet.advertiser_slug.as_str();
        match self
            .store
            .claim_low_balance_alert(slug, now, low_balance_alert_cooldown())
            .await
        {
            Ok(true) => {
                let message = format!(
                    "Wallet balance is {} cents, at or below your alert threshold of {} cents",
                    wallet.balance_cents, wallet.low_balance_threshold_cents
                );
                if let Err(e) = self
                    .notifier
                    .raise(slug, NotificationKind::LowBalance, message)
                    .await
                {
                    warn!(advertiser = slug, "Failed to store low-balance alert: {}", e);
                    return false;
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(advertiser = slug, "Failed to claim low-balance alert slot: {}", e);
                false
            }
        }
    }

    pub async fn configure(
        &self,
        advertiser_slug: &str,
        settings: WalletSettings,
    ) -> MarketplaceResult<Wallet> {
        if settings.low_balance_threshold_cents < 0 {
            return Err(MarketplaceError::validation(
                "low_balance_threshold_cents must not be negative",
            ));
        }
        if let Some(auto) = &settings.auto_top_up {
            if auto.threshold_cents < 0 || auto.target_cents <= auto.threshold_cents {
                return Err(MarketplaceError::validation(
                    "auto top-up target must exceed a non-negative threshold",
                ));
            }
            if auto.payment_method_ref.trim().is_empty() {
                return Err(MarketplaceError::validation("payment_method_ref is required"));
            }
        }
        let wallet = self.store.configure_wallet(advertiser_slug, settings).await?;
        info!(advertiser = advertiser_slug, "Wallet settings updated");
        Ok(wallet)
    }

    /// Checks `balance = deposited - spent` and the ledger sum.
    pub async fn verify(&self, advertiser_slug: &str) -> MarketplaceResult<WalletCheck> {
        let wallet = self.wallet(advertiser_slug).await?;
        let ledger_balance_cents = self
            .store
            .ledger_entries(advertiser_slug)
            .await?
            .iter()
            .map(|entry| match entry.kind {
                LedgerEntryKind::Credit => entry.amount_cents,
                LedgerEntryKind::Debit => -entry.amount_cents,
            })
            .sum();

        let consistent = wallet.identity_holds() && ledger_balance_cents == wallet.balance_cents;
        if !consistent {
            warn!(
                advertiser = advertiser_slug,
                balance_cents = wallet.balance_cents,
                ledger_balance_cents,
                "Wallet identity does not hold"
            );
        }
        Ok(WalletCheck {
            advertiser_slug: wallet.advertiser_slug,
            balance_cents: wallet.balance_cents,
            lifetime_deposited_cents: wallet.lifetime_deposited_cents,
            lifetime_spent_cents: wallet.lifetime_spent_cents,
            ledger_balance_cents,
            consistent,
        })
    }

    async fn handle_depletion(
        &self,
        advertiser_slug: &str,
        balance_cents: Cents,
    ) -> MarketplaceResult<Vec<CampaignId>> {
        warn!(advertiser = advertiser_slug, balance_cents, "Wallet depleted");
        let paused = self
            .lifecycle
            .pause_advertiser_campaigns(advertiser_slug, "wallet balance reached zero", ACTOR_BILLING)
            .await?;

        let message = format!(
            "Wallet balance is {} cents. {} active campaign(s) were paused until you top up.",
            balance_cents,
            paused.len()
        );
        if let Err(e) = self
            .notifier
            .raise(advertiser_slug, NotificationKind::WalletDepleted, message)
            .await
        {
            warn!(advertiser = advertiser_slug, "Failed to store depletion notice: {}", e);
        }
        Ok(paused)
    }
}

fn validate_reference(reference_id: &str) -> MarketplaceResult<()> {
    if reference_id.trim().is_empty() {
        return Err(MarketplaceError::validation("reference_id is required"));
    }
    Ok(())
}
