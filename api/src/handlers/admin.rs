//! Admin endpoints: advertiser onboarding, wallet settings, campaign review.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use marketplace_core::store::WalletSettings;
use marketplace_core::types::{Advertiser, Campaign, CampaignId, Wallet};
use marketplace_core::wallet::WalletCheck;
use std::sync::Arc;
use tracing::info;

use crate::{
    auth::require_bearer,
    error::{ApiError, ApiResult},
    models::{
        AdvertiserStatusRequest, AdvertiserStatusResponse, CampaignActionRequest,
        CreateCampaignRequest, RegisterAdvertiserRequest,
    },
    AppState,
};

const DEFAULT_ACTOR: &str = "admin";

fn authorize(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    require_bearer(headers, &state.config.admin_token, "admin")
}

pub async fn register_advertiser(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<RegisterAdvertiserRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Advertiser>)> {
    authorize(&state, &headers)?;
    let Json(request) = body?;
    let advertiser = state.advertisers.register(request.into()).await?;
    Ok((StatusCode::CREATED, Json(advertiser)))
}

pub async fn set_advertiser_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(slug): Path<String>,
    body: Result<Json<AdvertiserStatusRequest>, JsonRejection>,
) -> ApiResult<Json<AdvertiserStatusResponse>> {
    authorize(&state, &headers)?;
    let Json(request) = body?;
    let actor = request.actor.as_deref().unwrap_or(DEFAULT_ACTOR);

    state.advertisers.get(&slug).await?;
    let changed = state
        .advertisers
        .set_status(&slug, request.status, actor)
        .await?;

    Ok(Json(AdvertiserStatusResponse {
        slug,
        status: request.status,
        changed,
    }))
}

/// Checks `balance = deposited - spent` against the ledger.
pub async fn verify_wallet(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(slug): Path<String>,
) -> ApiResult<Json<WalletCheck>> {
    authorize(&state, &headers)?;
    Ok(Json(state.wallet.verify(&slug).await?))
}

pub async fn configure_wallet(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(slug): Path<String>,
    body: Result<Json<WalletSettings>, JsonRejection>,
) -> ApiResult<Json<Wallet>> {
    authorize(&state, &headers)?;
    let Json(settings) = body?;
    Ok(Json(state.wallet.configure(&slug, settings).await?))
}

pub async fn create_campaign(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<CreateCampaignRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Campaign>)> {
    authorize(&state, &headers)?;
    let Json(request) = body?;
    let campaign = state.lifecycle.create(request.into()).await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

/// `submit`, `approve`, `reject`, `pause` or `resume`.
pub async fn campaign_action(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, action)): Path<(CampaignId, String)>,
    body: Option<Json<CampaignActionRequest>>,
) -> ApiResult<Json<Campaign>> {
    authorize(&state, &headers)?;
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let actor = request.actor.as_deref().unwrap_or(DEFAULT_ACTOR);
    let lifecycle = &state.lifecycle;

    let campaign = match action.as_str() {
        "submit" => lifecycle.submit_for_review(id, actor).await?,
        "approve" => lifecycle.approve(id, actor).await?,
        "reject" => {
            let reason = request
                .reason
                .as_deref()
                .map(str::trim)
                .filter(|reason| !reason.is_empty())
                .ok_or_else(|| ApiError::validation("reason is required to reject", Some("reason")))?;
            lifecycle.reject(id, reason, actor).await?
        }
        "pause" => lifecycle.pause(id, actor).await?,
        "resume" => lifecycle.resume(id, actor).await?,
        other => {
            return Err(ApiError::not_found(format!("campaign action '{}'", other)));
        }
    };

    info!(campaign = %id, action = %action, state = %campaign.state, "Campaign action applied");
    Ok(Json(campaign))
}
