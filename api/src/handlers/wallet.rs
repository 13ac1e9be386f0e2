//! Payment-processor completion of wallet top-ups

use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    response::Json,
};
use std::sync::Arc;
use tracing::info;

use crate::{
    auth::require_bearer,
    error::{ApiError, ApiResult},
    models::{TopUpRequest, TopUpResponse},
    AppState,
};

/// Credits a wallet for a completed payment. Replaying a `reference_id`
/// returns the current balance with `applied = false`.
pub async fn top_up(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<TopUpRequest>, JsonRejection>,
) -> ApiResult<Json<TopUpResponse>> {
    require_bearer(&headers, &state.config.payment_token, "payment")?;
    let Json(request) = body?;

    if request.reference_id.trim().is_empty() {
        return Err(ApiError::validation(
            "reference_id is required",
            Some("reference_id"),
        ));
    }

    let receipt = state
        .wallet
        .credit(
            &request.advertiser_slug,
            request.amount_cents,
            &request.reference_id,
            request.source.as_deref(),
        )
        .await?;

    info!(
        advertiser = %request.advertiser_slug,
        applied = receipt.applied,
        balance_cents = receipt.balance_after_cents,
        "Top-up processed"
    );

    Ok(Json(TopUpResponse {
        applied: receipt.applied,
        balance_cents: receipt.balance_after_cents,
        entry_id: receipt.entry.map(|entry| entry.id),
    }))
}
