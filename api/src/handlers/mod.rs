//! HTTP request handlers for the marketplace API
//!
//! - Placements: auction winners and impression reporting
//! - Redirect: the tracked `/go/{slug}` click endpoint
//! - Postback: advertiser conversion reports
//! - Wallet: payment-processor top-up completion
//! - Cron: reconciler jobs and webhook worker passes
//! - Admin: advertiser and campaign management

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;

use crate::{error::ApiError, AppState};

pub mod admin;
pub mod cron;
pub mod placements;
pub mod postback;
pub mod redirect;
pub mod wallet;

pub use admin::{
    campaign_action, configure_wallet, create_campaign, register_advertiser,
    set_advertiser_status, verify_wallet,
};
pub use cron::{
    audit_campaign_spend, backfill_debits, expire_promotions, process_webhooks, rollup_stats, scan_low_balances,
    advance_lifecycle,
};
pub use placements::{get_winners, record_impressions};
pub use postback::record_postback;
pub use redirect::redirect;
pub use wallet::top_up;

/// Health check endpoint
///
/// Returns the current health status of the API server and its store.
/// This endpoint is used for monitoring and load balancer health checks.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let store_ok = match &state.database {
        Some(database) => database.health_check().await.is_ok(),
        None => state.store.get_advertiser("health-probe").await.is_ok(),
    };
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if store_ok { "healthy" } else { "degraded" },
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION"),
            "service": "broker-marketplace-api",
            "storage": format!("{:?}", state.config.storage).to_lowercase(),
        })),
    )
        .into_response()
}

/// Prometheus scrape endpoint; 404 when no recorder is installed.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let handle = state
        .metrics
        .as_ref()
        .ok_or_else(|| ApiError::not_found("metrics exporter"))?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response())
}
