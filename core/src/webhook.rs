//! Webhook Delivery Queue bookkeeping.
//!
//! The HTTP side lives in the `webhook-delivery` crate; this module owns the
//! delivery rows: enqueue, leased claiming, and the state change after each
//! attempt (backoff ladder, terminal failure, advertiser notification).

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{MarketplaceError, MarketplaceResult};
use crate::notify::{Notifier, ACTOR_WEBHOOKS};
use crate::store::MarketplaceStore;
use crate::types::{AuditEntry, DeliveryStatus, NotificationKind, WebhookDelivery};

/// Retry delays in seconds: 1m, 5m, 30m, 2h, 12h. The last step repeats.
pub const BACKOFF_LADDER_SECS: [i64; 5] = [60, 300, 1_800, 7_200, 43_200];
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Delivery timestamps are compared for lease ownership, so they are kept at
/// the microsecond precision the database stores.
fn lease_instant(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

/// Delay before the next attempt after `attempt_count` failed attempts.
pub fn backoff_delay(attempt_count: u32) -> Duration {
    let step = (attempt_count.max(1) as usize - 1).min(BACKOFF_LADDER_SECS.len() - 1);
    Duration::seconds(BACKOFF_LADDER_SECS[step])
}

/// Result of one POST attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Delivered,
    Failed(String),
}

/// Applies an attempt result to a delivery row.
pub fn apply_attempt(
    mut delivery: WebhookDelivery,
    result: &AttemptResult,
    now: DateTime<Utc>,
) -> WebhookDelivery {
    delivery.attempt_count += 1;
    match result {
        AttemptResult::Delivered => {
            delivery.status = DeliveryStatus::Delivered;
            delivery.delivered_at = Some(now);
            delivery.last_error = None;
        }
        AttemptResult::Failed(error) => {
            delivery.last_error = Some(error.clone());
            if delivery.attempt_count >= delivery.max_attempts {
                delivery.status = DeliveryStatus::Failed;
            } else {
                delivery.next_retry_at = lease_instant(now + backoff_delay(delivery.attempt_count));
            }
        }
    }
    delivery
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub batch_size: usize,
    /// How long a claimed delivery stays invisible to other workers; renewed
    /// right before each POST
    pub lease_secs: i64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            batch_size: DEFAULT_BATCH_SIZE,
            lease_secs: 60,
        }
    }
}

#[derive(Clone)]
pub struct WebhookQueue {
    store: Arc<dyn MarketplaceStore>,
    notifier: Notifier,
    settings: QueueSettings,
}

impl WebhookQueue {
    pub fn new(store: Arc<dyn MarketplaceStore>, settings: QueueSettings) -> Self {
        Self {
            notifier: Notifier::new(store.clone()),
            store,
            settings,
        }
    }

    pub fn settings(&self) -> QueueSettings {
        self.settings
    }

    /// Queues a delivery due immediately.
    pub async fn enqueue(
        &self,
        advertiser_slug: &str,
        target_url: &str,
        payload: serde_json::Value,
    ) -> MarketplaceResult<WebhookDelivery> {
        let delivery = self.new_delivery(advertiser_slug, target_url, payload)?;
        self.store.enqueue_delivery(delivery.clone()).await?;
        info!(delivery = %delivery.id, advertiser = advertiser_slug, "Webhook delivery queued");
        Ok(delivery)
    }

    /// Builds a pending delivery, due now, without storing it. Callers that
    /// must commit the delivery together with other rows hand it to the store.
    pub fn new_delivery(
        &self,
        advertiser_slug: &str,
        target_url: &str,
        payload: serde_json::Value,
    ) -> MarketplaceResult<WebhookDelivery> {
        if target_url.trim().is_empty() {
            return Err(MarketplaceError::validation("webhook target url is empty"));
        }
        let now = lease_instant(Utc::now());
        Ok(WebhookDelivery {
            id: Uuid::new_v4(),
            advertiser_slug: advertiser_slug.to_string(),
            target_url: target_url.to_string(),
            payload,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            max_attempts: self.settings.max_attempts.max(1),
            next_retry_at: now,
            last_error: None,
            created_at: now,
            delivered_at: None,
        })
    }

    fn lease_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        lease_instant(now + Duration::seconds(self.settings.lease_secs.max(1)))
    }

    /// Claims up to one batch of due deliveries under a lease. Each returned
    /// row carries its lease expiry in `next_retry_at`.
    pub async fn claim_batch(&self, now: DateTime<Utc>) -> MarketplaceResult<Vec<WebhookDelivery>> {
        self.store
            .claim_due_deliveries(now, self.settings.batch_size, self.lease_from(now))
            .await
    }

    /// Restarts the lease on a claimed row so it covers one full POST.
    /// Returns false when another worker has since claimed the row; the
    /// caller must then leave it alone.
    pub async fn renew_lease(
        &self,
        delivery: &mut WebhookDelivery,
        now: DateTime<Utc>,
    ) -> MarketplaceResult<bool> {
        let lease_until = self.lease_from(now);
        let renewed = self
            .store
            .renew_delivery_lease(delivery.id, delivery.next_retry_at, lease_until)
            .await?;
        if renewed {
            delivery.next_retry_at = lease_until;
        }
        Ok(renewed)
    }

    /// Stores the outcome of one attempt and escalates terminal failures.
    /// `delivery` must be the row as claimed; a lost lease is a `Conflict`.
    #[instrument(skip(self, delivery), fields(delivery = %delivery.id))]
    pub async fn record_attempt(
        &self,
        delivery: WebhookDelivery,
        result: AttemptResult,
        now: DateTime<Utc>,
    ) -> MarketplaceResult<WebhookDelivery> {
        let held_until = delivery.next_retry_at;
        let updated = apply_attempt(delivery, &result, now);
        if !self.store.save_delivery(updated.clone(), held_until).await? {
            metrics::increment_counter!("marketplace_webhooks_lease_lost_total");
            return Err(MarketplaceError::Conflict(format!(
                "lease on webhook delivery {} was lost",
                updated.id
            )));
        }

        match updated.status {
            DeliveryStatus::Delivered => {
                metrics::increment_counter!("marketplace_webhooks_delivered_total");
                info!(attempts = updated.attempt_count, "Webhook delivered");
            }
            DeliveryStatus::Pending => {
                metrics::increment_counter!("marketplace_webhooks_retried_total");
                warn!(
                    attempts = updated.attempt_count,
                    next_retry_at = %updated.next_retry_at,
                    "Webhook attempt failed: {}",
                    updated.last_error.as_deref().unwrap_or("unknown error")
                );
            }
            DeliveryStatus::Failed => {
                metrics::increment_counter!("marketplace_webhooks_failed_total");
                self.escalate(&updated).await?;
            }
        }
        Ok(updated)
    }

    async fn escalate(&self, delivery: &WebhookDelivery) -> MarketplaceResult<()> {
        let error = delivery.last_error.as_deref().unwrap_or("unknown error");
        warn!(
            advertiser = %delivery.advertiser_slug,
            attempts = delivery.attempt_count,
            "Webhook delivery failed permanently: {}",
            error
        );
        self.notifier
            .raise(
                &delivery.advertiser_slug,
                NotificationKind::WebhookFailed,
                format!(
                    "Conversion webhook to {} failed after {} attempts: {}",
                    delivery.target_url, delivery.attempt_count, error
                ),
            )
            .await?;
        self.notifier
            .audit(
                AuditEntry::new(
                    "webhook.failed",
                    "webhook_delivery",
                    delivery.id.to_string(),
                    "max attempts exhausted",
                    ACTOR_WEBHOOKS,
                )
                .with_details(serde_json::json!({
                    "target_url": delivery.target_url,
                    "attempts": delivery.attempt_count,
                    "last_error": error,
                })),
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn queue(max_attempts: u32) -> (Arc<dyn MarketplaceStore>, WebhookQueue) {
        let store: Arc<dyn MarketplaceStore> = Arc::new(InMemoryStore::new());
        let queue = WebhookQueue::new(
            store.clone(),
            QueueSettings {
                max_attempts,
                ..QueueSettings::default()
            },
        );
        (store, queue)
    }

    #[test]
    fn test_backoff_ladder_repeats_last_step() {
        let minutes: Vec<i64> = (1..=7).map(|n| backoff_delay(n).num_minutes()).collect();
        assert_eq!(minutes, vec![1, 5, 30, 120, 720, 720, 720]);
    }

    #[tokio::test]
    async fn test_five_failures_follow_ladder_then_fail() {
        let (store, queue) = queue(5);
        let delivery = queue
            .enqueue("acme", "https://acme.example/hooks", serde_json::json!({"event": "conversion"}))
            .await
            .unwrap();

        let mut now = Utc::now();
        let mut current = delivery;
        let mut gaps = Vec::new();
        for _ in 0..5 {
            current = queue
                .record_attempt(current, AttemptResult::Failed("HTTP 503".into()), now)
                .await
                .unwrap();
            if current.status == DeliveryStatus::Pending {
                gaps.push((current.next_retry_at - now).num_minutes());
                now = current.next_retry_at;
            }
        }

        assert_eq!(gaps, vec![1, 5, 30, 120]);
        assert_eq!(current.status, DeliveryStatus::Failed);
        assert_eq!(current.attempt_count, 5);

        let later = now + Duration::days(2);
        assert!(queue.claim_batch(later).await.unwrap().is_empty());

        let notes = store.notifications_for("acme").await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, NotificationKind::WebhookFailed);
    }

    #[tokio::test]
    async fn test_longer_budget_reaches_twelve_hour_step() {
        let (_store, queue) = queue(7);
        let mut current = queue
            .enqueue("acme", "https://acme.example/hooks", serde_json::json!({}))
            .await
            .unwrap();
        let now = Utc::now();
        for _ in 0..6 {
            current = apply_attempt(current, &AttemptResult::Failed("timeout".into()), now);
        }
        assert_eq!(current.status, DeliveryStatus::Pending);
        assert_eq!((current.next_retry_at - now).num_hours(), 12);
    }

    #[tokio::test]
    async fn test_claim_leases_each_delivery_once() {
        let (_store, queue) = queue(5);
        for i in 0..3 {
            queue
                .enqueue("acme", &format!("https://acme.example/{}", i), serde_json::json!({}))
                .await
                .unwrap();
        }

        let now = Utc::now() + Duration::seconds(1);
        let first = queue.claim_batch(now).await.unwrap();
        let second = queue.claim_batch(now).await.unwrap();
        assert_eq!(first.len(), 3);
        assert!(second.is_empty());

        let after_lease = now + Duration::seconds(queue.settings().lease_secs + 1);
        assert_eq!(queue.claim_batch(after_lease).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_reclaimed_delivery_rejects_the_stale_holder() {
        let (store, queue) = queue(5);
        let queued = queue
            .enqueue("acme", "https://acme.example/hooks", serde_json::json!({}))
            .await
            .unwrap();

        let now = Utc::now() + Duration::seconds(1);
        let mut stale = queue.claim_batch(now).await.unwrap().remove(0);
        let after_lease = now + Duration::seconds(queue.settings().lease_secs + 1);
        let mut fresh = queue.claim_batch(after_lease).await.unwrap().remove(0);
        assert_eq!(fresh.id, stale.id);

        assert!(!queue.renew_lease(&mut stale, after_lease).await.unwrap());
        let err = queue
            .record_attempt(stale, AttemptResult::Delivered, after_lease)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketplaceError::Conflict(_)));

        assert!(queue.renew_lease(&mut fresh, after_lease).await.unwrap());
        let done = queue
            .record_attempt(fresh, AttemptResult::Delivered, after_lease)
            .await
            .unwrap();
        assert_eq!(done.attempt_count, 1);

        let stored = store.get_delivery(queued.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Delivered);
        assert_eq!(stored.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_renewed_lease_hides_row_from_next_claim() {
        let (_store, queue) = queue(5);
        queue
            .enqueue("acme", "https://acme.example/hooks", serde_json::json!({}))
            .await
            .unwrap();

        let now = Utc::now() + Duration::seconds(1);
        let mut claimed = queue.claim_batch(now).await.unwrap().remove(0);
        let lease = Duration::seconds(queue.settings().lease_secs);

        // Renewed just before the first lease ends; still hidden after it.
        let renew_at = now + lease - Duration::seconds(1);
        assert!(queue.renew_lease(&mut claimed, renew_at).await.unwrap());
        assert!(queue.claim_batch(now + lease + Duration::seconds(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_success_marks_delivered() {
        let (store, queue) = queue(5);
        let delivery = queue
            .enqueue("acme", "https://acme.example/hooks", serde_json::json!({}))
            .await
            .unwrap();

        let done = queue
            .record_attempt(delivery.clone(), AttemptResult::Delivered, Utc::now())
            .await
            .unwrap();
        assert_eq!(done.status, DeliveryStatus::Delivered);
        let stored = store.get_delivery(delivery.id).await.unwrap().unwrap();
        assert!(stored.delivered_at.is_some());
    }
}
