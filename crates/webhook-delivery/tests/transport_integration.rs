//! Integration tests for the reqwest webhook transport and worker
//!
//! - Uses wiremock for real HTTP endpoints
//! - Covers 2xx acknowledgement, non-2xx failure and slow responders

use marketplace_core::store::MarketplaceStore;
use marketplace_core::types::DeliveryStatus;
use marketplace_core::webhook::{QueueSettings, WebhookQueue};
use marketplace_core::InMemoryStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use webhook_delivery::{
    DeliveryError, DeliveryWorker, ReqwestTransport, WebhookTransport, DELIVERY_ID_HEADER,
};
use wiremock::{
    matchers::{body_json, header, header_exists, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn transport(timeout: Duration) -> ReqwestTransport {
    ReqwestTransport::new(timeout).unwrap()
}

#[tokio::test]
async fn test_2xx_is_acknowledged() {
    let server = MockServer::start().await;
    let payload = json!({"event": "conversion", "conversion_id": "c-1"});
    let delivery_id = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path("/hooks/conversions"))
        .and(header(DELIVERY_ID_HEADER, delivery_id.to_string().as_str()))
        .and(header("content-type", "application/json"))
        .and(body_json(&payload))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/hooks/conversions", server.uri());
    let result = transport(Duration::from_secs(5))
        .post(delivery_id, &url, &payload)
        .await;

    assert!(result.is_ok());
}

#[tokio::test]
async fn test_non_2xx_is_a_failure() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let result = transport(Duration::from_secs(5))
        .post(Uuid::new_v4(), &server.uri(), &json!({}))
        .await;

    assert!(matches!(result, Err(DeliveryError::Status(500))));
}

#[tokio::test]
async fn test_redirect_status_is_not_acknowledgement() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;

    let result = transport(Duration::from_secs(5))
        .post(Uuid::new_v4(), &server.uri(), &json!({}))
        .await;

    assert!(matches!(result, Err(DeliveryError::Status(304))));
}

#[tokio::test]
async fn test_slow_responder_times_out() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let result = transport(Duration::from_millis(200))
        .post(Uuid::new_v4(), &server.uri(), &json!({}))
        .await;

    assert!(matches!(result, Err(DeliveryError::Timeout(_))));
}

#[tokio::test]
async fn test_worker_end_to_end_against_failing_endpoint() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header_exists(DELIVERY_ID_HEADER))
        .respond_with(ResponseTemplate::new(502))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryStore::new());
    let queue = WebhookQueue::new(store.clone(), QueueSettings::default());
    let queued = queue
        .enqueue("acme", &format!("{}/hook", server.uri()), json!({"event": "conversion"}))
        .await
        .unwrap();

    let worker = DeliveryWorker::new(queue, Arc::new(transport(Duration::from_secs(5))));
    let summary = worker.run_once().await.unwrap();
    assert_eq!(summary.retried, 1);

    let stored = store.get_delivery(queued.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Pending);
    assert_eq!(stored.attempt_count, 1);
}

#[tokio::test]
async fn test_worker_end_to_end_delivers() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryStore::new());
    let queue = WebhookQueue::new(store.clone(), QueueSettings::default());
    for advertiser in ["acme", "globex"] {
        queue
            .enqueue(advertiser, &server.uri(), json!({"event": "conversion"}))
            .await
            .unwrap();
    }

    let worker = DeliveryWorker::new(queue, Arc::new(transport(Duration::from_secs(5))));
    let summary = worker.run_once().await.unwrap();

    assert_eq!(summary.claimed, 2);
    assert_eq!(summary.delivered, 2);
}
