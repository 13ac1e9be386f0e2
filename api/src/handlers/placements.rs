//! Auction and impression endpoints

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    response::Json,
};
use chrono::Utc;
use marketplace_core::frequency_cap::FrequencyCap;
use marketplace_core::types::Placement;
use std::sync::Arc;
use tracing::debug;

use crate::{
    error::{ApiError, ApiResult},
    models::{
        ImpressionReport, ImpressionReportResponse, WinnersQuery, WinnersResponse,
        MAX_IMPRESSIONS_PER_REPORT,
    },
    AppState,
};

/// Default and maximum number of winners returned.
const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 50;

fn parse_placement(raw: &str) -> ApiResult<Placement> {
    raw.parse::<Placement>()
        .map_err(|_| ApiError::validation(format!("unknown placement '{}'", raw), Some("placement".to_string())))
}

/// Ordered auction winners for a placement, after frequency capping.
pub async fn get_winners(
    State(state): State<Arc<AppState>>,
    Path(placement): Path<String>,
    query: Result<Query<WinnersQuery>, QueryRejection>,
) -> ApiResult<Json<WinnersResponse>> {
    let Query(query) = query?;
    let placement = parse_placement(&placement)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

    let now = Utc::now();
    let today = now.date_naive();
    let mut winners = state.auction.get_winners(placement, today).await?;

    let history = query.impression_history(placement)?;
    if !history.is_empty() {
        let default_cap = FrequencyCap::default();
        let cap = FrequencyCap::new(
            query.cap.unwrap_or(default_cap.cap_per_window),
            default_cap.window,
        );
        let before = winners.len();
        winners = cap.filter(winners, placement, &history, now);
        debug!(%placement, dropped = before - winners.len(), "Frequency cap applied");
    }
    winners.truncate(limit);

    Ok(Json(WinnersResponse {
        placement,
        day: today,
        winners,
    }))
}

/// Appends impression events for the winners a page rendered.
pub async fn record_impressions(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ImpressionReport>, JsonRejection>,
) -> ApiResult<Json<ImpressionReportResponse>> {
    let Json(report) = body?;
    if report.campaign_ids.len() > MAX_IMPRESSIONS_PER_REPORT {
        return Err(ApiError::validation(
            format!("at most {} campaign ids per report", MAX_IMPRESSIONS_PER_REPORT),
            Some("campaign_ids".to_string()),
        ));
    }

    let recorded = state
        .attribution
        .record_impressions(report.placement, &report.campaign_ids)
        .await?;

    Ok(Json(ImpressionReportResponse { recorded }))
}
