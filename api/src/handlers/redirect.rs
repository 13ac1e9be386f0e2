//! Tracked redirect: record the click, bill it in the background, send the
//! visitor on. This endpoint answers with a redirect no matter what fails.

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use marketplace_core::attribution::{ensure_advertiser, ClickRequest};
use marketplace_core::types::{Advertiser, CampaignId, ClickRecord, Placement};
use marketplace_core::MarketplaceError;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{config::ApiConfig, middleware::client_ip, models::RedirectQuery, AppState};

pub const CLICK_ID_PARAM: &str = "click_id";

pub async fn redirect(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    query: Option<Query<RedirectQuery>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let query = query.map(|Query(query)| query).unwrap_or_default();

    let advertiser = match ensure_advertiser(&state.store, &slug).await {
        Ok(advertiser) => advertiser,
        Err(MarketplaceError::NotFound(_)) => {
            info!(advertiser = %slug, "Redirect for unknown advertiser");
            return found(&review_url(&state.config, None));
        }
        Err(err) => {
            error!(advertiser = %slug, "Advertiser lookup failed during redirect: {}", err);
            let slug = is_slug(&slug).then_some(slug.as_str());
            return found(&review_url(&state.config, slug));
        }
    };

    let request = ClickRequest {
        advertiser_slug: advertiser.slug.clone(),
        campaign_id: parse_campaign(query.campaign.as_deref()),
        placement: parse_placement(query.placement.as_deref()),
        ip: client_ip(&headers, connect_info.as_ref(), state.config.trusted_proxies)
            .map(|ip| ip.to_string()),
        user_agent: header_text(&headers, header::USER_AGENT),
        referrer: header_text(&headers, header::REFERER),
    };

    let click_id = match state.attribution.issue_click(&request).await {
        Ok(click) => {
            let click_id = click.click_id.clone();
            spawn_billing(&state, click);
            Some(click_id)
        }
        Err(err) => {
            error!(advertiser = %advertiser.slug, "Failed to record click: {}", err);
            metrics::increment_counter!("marketplace_click_record_failures_total");
            None
        }
    };

    found(&destination_url(&state.config, &advertiser, click_id.as_deref()))
}

/// Bills off the response path. The task runs to completion; billing never
/// propagates errors, and a debit lost to a crash is re-issued by the backfill job.
fn spawn_billing(state: &AppState, click: ClickRecord) {
    let attribution = state.attribution.clone();
    tokio::spawn(async move {
        let outcome = attribution.bill_click(&click).await;
        debug!(click_id = %click.click_id, ?outcome, "Click billing finished");
    });
}

fn parse_campaign(raw: Option<&str>) -> Option<CampaignId> {
    let raw = raw.map(str::trim).filter(|value| !value.is_empty())?;
    match raw.parse() {
        Ok(id) => Some(id),
        Err(_) => {
            warn!(campaign = raw, "Ignoring malformed campaign reference");
            None
        }
    }
}

fn parse_placement(raw: Option<&str>) -> Option<Placement> {
    let raw = raw.map(str::trim).filter(|value| !value.is_empty())?;
    raw.parse().ok()
}

fn header_text(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn is_slug(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Internal review page, optionally for one advertiser.
pub fn review_url(config: &ApiConfig, slug: Option<&str>) -> String {
    let base = config.review_page_base_url.trim_end_matches('/');
    match slug {
        Some(slug) => format!("{}/{}", base, slug),
        None => base.to_string(),
    }
}

/// Advertiser destination with the click id appended, or the review page.
pub fn destination_url(config: &ApiConfig, advertiser: &Advertiser, click_id: Option<&str>) -> String {
    let destination = advertiser
        .destination_url
        .as_deref()
        .and_then(|raw| Url::parse(raw).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"));

    match destination {
        Some(mut url) => {
            if let Some(click_id) = click_id {
                url.query_pairs_mut().append_pair(CLICK_ID_PARAM, click_id);
            }
            url.into()
        }
        None => review_url(config, Some(&advertiser.slug)),
    }
}

fn found(location: &str) -> Response {
    let location = HeaderValue::from_str(location).unwrap_or_else(|_| HeaderValue::from_static("/"));
    (
        StatusCode::FOUND,
        [
            (header::LOCATION, location),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-store, no-cache, must-revalidate, max-age=0"),
            ),
            (header::PRAGMA, HeaderValue::from_static("no-cache")),
            (HeaderName::from_static("x-robots-tag"), HeaderValue::from_static("noindex, nofollow")),
        ],
    )
        .into_response()
}
