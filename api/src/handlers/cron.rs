//! Reconciler and webhook worker triggers for an external scheduler.
//!
//! Every job is idempotent, so overlapping or repeated calls are safe.

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::HeaderMap,
    response::Json,
};
use chrono::{Days, NaiveDate, Utc};
use marketplace_core::reconciler::JobSummary;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{auth::require_bearer, error::ApiResult, models::DayQuery, AppState};

fn authorize(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    require_bearer(headers, &state.config.cron_token, "cron")
}

/// `?day=` or yesterday (UTC).
fn target_day(query: Result<Query<DayQuery>, QueryRejection>) -> ApiResult<NaiveDate> {
    let Query(query) = query?;
    let today = Utc::now().date_naive();
    Ok(query
        .day
        .unwrap_or_else(|| today.checked_sub_days(Days::new(1)).unwrap_or(today)))
}

/// Job 1: recompute daily rollups for one day.
pub async fn rollup_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Result<Query<DayQuery>, QueryRejection>,
) -> ApiResult<Json<JobSummary>> {
    authorize(&state, &headers)?;
    let day = target_day(query)?;
    Ok(Json(state.reconciler.rollup_day(day).await?))
}

/// Job 2: start, complete and budget-exhaust campaigns.
pub async fn advance_lifecycle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<JobSummary>> {
    authorize(&state, &headers)?;
    let today = Utc::now().date_naive();
    Ok(Json(state.reconciler.advance_lifecycle(today).await?))
}

/// Job 3: deactivate expired offers and reset expired tiers.
pub async fn expire_promotions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<JobSummary>> {
    authorize(&state, &headers)?;
    let today = Utc::now().date_naive();
    Ok(Json(state.reconciler.expire_promotions(today).await?))
}

/// Job 4: low-balance alerts.
pub async fn scan_low_balances(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<JobSummary>> {
    authorize(&state, &headers)?;
    Ok(Json(state.reconciler.scan_low_balances(Utc::now()).await?))
}

/// Job 5: re-issue debits missing for billed clicks of one day.
pub async fn backfill_debits(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Result<Query<DayQuery>, QueryRejection>,
) -> ApiResult<Json<JobSummary>> {
    authorize(&state, &headers)?;
    let day = target_day(query)?;
    Ok(Json(state.reconciler.backfill_debits(day).await?))
}

/// Job 6: compare campaign spend against billed click events.
pub async fn audit_campaign_spend(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<JobSummary>> {
    authorize(&state, &headers)?;
    Ok(Json(state.reconciler.audit_campaign_spend(Utc::now()).await?))
}

/// One webhook worker pass, reported in the reconciler job shape.
pub async fn process_webhooks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<JobSummary>> {
    authorize(&state, &headers)?;
    let ran_at = Utc::now();
    let pass = state.webhook_worker.run_once().await?;

    let actions = BTreeMap::from([
        ("claimed".to_string(), pass.claimed as u64),
        ("delivered".to_string(), pass.delivered as u64),
        ("retried".to_string(), pass.retried as u64),
        ("failed".to_string(), pass.failed as u64),
        ("skipped".to_string(), pass.skipped as u64),
    ]);
    Ok(Json(JobSummary {
        job: "webhooks".to_string(),
        ran_at,
        actions,
    }))
}
