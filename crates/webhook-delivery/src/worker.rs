//! The delivery loop: claim a leased batch, then for each row renew its lease,
//! POST it and record the result.

use chrono::Utc;
use marketplace_core::types::DeliveryStatus;
use marketplace_core::webhook::{AttemptResult, WebhookQueue};
use marketplace_core::MarketplaceResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::transport::WebhookTransport;

/// Counts for one worker pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSummary {
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    /// Rows another worker re-claimed before this one reached them
    pub skipped: usize,
}

#[derive(Clone)]
pub struct DeliveryWorker {
    queue: WebhookQueue,
    transport: Arc<dyn WebhookTransport>,
}

impl DeliveryWorker {
    pub fn new(queue: WebhookQueue, transport: Arc<dyn WebhookTransport>) -> Self {
        Self { queue, transport }
    }

    /// Processes at most one batch of due deliveries.
    pub async fn run_once(&self) -> MarketplaceResult<PassSummary> {
        let batch = self.queue.claim_batch(Utc::now()).await?;
        let mut summary = PassSummary {
            claimed: batch.len(),
            ..PassSummary::default()
        };

        for mut delivery in batch {
            let id = delivery.id;
            match self.queue.renew_lease(&mut delivery, Utc::now()).await {
                Ok(true) => {}
                Ok(false) => {
                    summary.skipped += 1;
                    continue;
                }
                Err(err) => {
                    warn!(delivery = %id, "Failed to renew webhook lease: {}", err);
                    summary.skipped += 1;
                    continue;
                }
            }

            let result = match self
                .transport
                .post(id, &delivery.target_url, &delivery.payload)
                .await
            {
                Ok(()) => AttemptResult::Delivered,
                Err(err) => AttemptResult::Failed(err.to_string()),
            };

            // A row that cannot be saved stays leased and comes due again.
            match self.queue.record_attempt(delivery, result, Utc::now()).await {
                Ok(updated) => match updated.status {
                    DeliveryStatus::Delivered => summary.delivered += 1,
                    DeliveryStatus::Pending => summary.retried += 1,
                    DeliveryStatus::Failed => summary.failed += 1,
                },
                Err(err) => warn!(delivery = %id, "Failed to record webhook attempt: {}", err),
            }
        }

        if summary.claimed > 0 {
            info!(
                claimed = summary.claimed,
                delivered = summary.delivered,
                retried = summary.retried,
                failed = summary.failed,
                skipped = summary.skipped,
                "Webhook pass finished"
            );
        }
        Ok(summary)
    }

    /// Runs passes every `poll_interval` until `shutdown` flips to true or
    /// its sender is dropped.
    pub async fn run(self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(?poll_interval, "Webhook delivery worker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        error!("Webhook pass failed: {}", err);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Webhook delivery worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use crate::transport::MockWebhookTransport;
    use marketplace_core::store::MarketplaceStore;
    use marketplace_core::types::NotificationKind;
    use marketplace_core::webhook::QueueSettings;
    use marketplace_core::InMemoryStore;
    use crate::error::DeliveryResult;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn queue(store: &Arc<InMemoryStore>, max_attempts: u32) -> WebhookQueue {
        WebhookQueue::new(
            store.clone(),
            QueueSettings {
                max_attempts,
                ..QueueSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn test_successful_post_marks_delivered() {
        let store = Arc::new(InMemoryStore::new());
        let queue = queue(&store, 5);
        let queued = queue
            .enqueue("acme", "https://hooks.acme.test/conv", json!({"event": "conversion"}))
            .await
            .unwrap();

        let mut transport = MockWebhookTransport::new();
        let expected_id = queued.id;
        transport
            .expect_post()
            .withf(move |id, url, payload| {
                *id == expected_id
                    && url == "https://hooks.acme.test/conv"
                    && payload["event"] == "conversion"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let worker = DeliveryWorker::new(queue, Arc::new(transport));
        let summary = worker.run_once().await.unwrap();

        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.delivered, 1);
        let stored = store.get_delivery(queued.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Delivered);
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_post_is_rescheduled_one_minute_out() {
        let store = Arc::new(InMemoryStore::new());
        let queue = queue(&store, 5);
        let queued = queue
            .enqueue("acme", "https://hooks.acme.test/conv", json!({}))
            .await
            .unwrap();

        let mut transport = MockWebhookTransport::new();
        transport
            .expect_post()
            .times(1)
            .returning(|_, _, _| Err(DeliveryError::Status(503)));

        let before = Utc::now();
        let worker = DeliveryWorker::new(queue, Arc::new(transport));
        let summary = worker.run_once().await.unwrap();

        assert_eq!(summary.retried, 1);
        let stored = store.get_delivery(queued.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Pending);
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.last_error.as_deref().unwrap().contains("503"));
        let delay = stored.next_retry_at - before;
        assert!(delay >= chrono::Duration::seconds(59) && delay <= chrono::Duration::seconds(61));
    }

    #[tokio::test]
    async fn test_exhausted_delivery_fails_and_notifies() {
        let store = Arc::new(InMemoryStore::new());
        let queue = queue(&store, 1);
        let queued = queue
            .enqueue("acme", "https://hooks.acme.test/conv", json!({}))
            .await
            .unwrap();

        let mut transport = MockWebhookTransport::new();
        transport
            .expect_post()
            .times(1)
            .returning(|_, _, _| Err(DeliveryError::Timeout(Duration::from_secs(10))));

        let worker = DeliveryWorker::new(queue, Arc::new(transport));
        let summary = worker.run_once().await.unwrap();

        assert_eq!(summary.failed, 1);
        let stored = store.get_delivery(queued.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);

        let notifications = store.notifications_for("acme").await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, NotificationKind::WebhookFailed);
    }

    #[tokio::test]
    async fn test_claimed_delivery_is_not_posted_twice() {
        let store = Arc::new(InMemoryStore::new());
        let queue = queue(&store, 5);
        queue
            .enqueue("acme", "https://hooks.acme.test/conv", json!({}))
            .await
            .unwrap();

        // The first pass fails, leaving the row pending but scheduled out.
        let mut transport = MockWebhookTransport::new();
        transport
            .expect_post()
            .times(1)
            .returning(|_, _, _| Err(DeliveryError::Transport("connection reset".into())));

        let worker = DeliveryWorker::new(queue, Arc::new(transport));
        assert_eq!(worker.run_once().await.unwrap().claimed, 1);
        assert_eq!(worker.run_once().await.unwrap().claimed, 0);
    }

    /// Slow receiver that counts POSTs per delivery.
    struct SlowTransport {
        delay: Duration,
        posts: parking_lot::Mutex<HashMap<Uuid, usize>>,
    }

    #[async_trait]
    impl WebhookTransport for SlowTransport {
        async fn post(&self, delivery_id: Uuid, _url: &str, _payload: &Value) -> DeliveryResult<()> {
            *self.posts.lock().entry(delivery_id).or_insert(0) += 1;
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_overlapping_workers_post_each_delivery_once() {
        let store = Arc::new(InMemoryStore::new());
        let queue = WebhookQueue::new(
            store.clone(),
            QueueSettings {
                lease_secs: 1,
                ..QueueSettings::default()
            },
        );
        let mut ids = Vec::new();
        for i in 0..4 {
            let queued = queue
                .enqueue("acme", &format!("https://hooks.acme.test/{}", i), json!({}))
                .await
                .unwrap();
            ids.push(queued.id);
        }

        // The whole batch takes longer than one lease.
        let transport = Arc::new(SlowTransport {
            delay: Duration::from_millis(600),
            posts: parking_lot::Mutex::new(HashMap::new()),
        });
        let first = DeliveryWorker::new(queue.clone(), transport.clone());
        let second = DeliveryWorker::new(queue, transport.clone());

        let a = tokio::spawn(async move { first.run_once().await.unwrap() });
        tokio::time::sleep(Duration::from_millis(1_150)).await;
        let b = tokio::spawn(async move { second.run_once().await.unwrap() });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let posts = transport.posts.lock().clone();
        assert!(posts.values().all(|count| *count == 1), "{:?}", posts);
        assert_eq!(posts.len(), 4);
        assert_eq!(a.delivered + b.delivered, 4);
        for id in ids {
            let stored = store.get_delivery(id).await.unwrap().unwrap();
            assert_eq!(stored.status, DeliveryStatus::Delivered);
            assert_eq!(stored.attempt_count, 1);
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let mut transport = MockWebhookTransport::new();
        transport.expect_post().times(0);
        let worker = DeliveryWorker::new(queue(&store, 5), Arc::new(transport));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(Duration::from_millis(10), rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
