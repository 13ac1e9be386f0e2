//! Conversion postbacks from advertisers

use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    response::Json,
};
use marketplace_core::conversion::{PostbackRequest, RecordedConversion};
use std::sync::Arc;

use crate::{auth::ApiKey, error::ApiResult, AppState};

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Records a conversion. Rejections follow a fixed order: api key, click,
/// ownership, event type. A malformed body is only reported to an
/// authenticated caller.
pub async fn record_postback(
    State(state): State<Arc<AppState>>,
    api_key: ApiKey,
    headers: HeaderMap,
    body: Result<Json<PostbackRequest>, JsonRejection>,
) -> ApiResult<Json<RecordedConversion>> {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            state.conversions.authenticate(api_key.as_deref()).await?;
            return Err(rejection.into());
        }
    };

    let nonce = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    let recorded = state
        .conversions
        .record(api_key.as_deref(), request, nonce)
        .await?;

    Ok(Json(recorded))
}
