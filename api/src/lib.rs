//! # Marketplace API
//!
//! HTTP surface of the broker marketplace, built on Axum.
//!
//! ## Features
//! - Placement auction and impression reporting
//! - Tracked redirects with background CPC billing
//! - Conversion postbacks authenticated by advertiser api keys
//! - Wallet top-up completion for the payment processor
//! - Reconciler and webhook triggers for an external scheduler
//! - Admin endpoints for advertisers, wallets and campaigns
//!
//! ## Architecture
//! - `handlers`: HTTP request handlers
//! - `middleware`: tracing, security headers, request ids, rate limiting
//! - `auth`: api key and bearer token checks
//! - `models`: request/response models
//! - `config`: server configuration
//! - `error`: error types and handling

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post, put},
    Router,
};
use marketplace_core::{
    advertisers::AdvertiserRegistry,
    attribution::Attribution,
    auction::PlacementAuction,
    conversion::ConversionHandler,
    lifecycle::CampaignLifecycle,
    reconciler::Reconciler,
    wallet::WalletLedger,
    webhook::{QueueSettings, WebhookQueue},
    InMemoryStore, MarketplaceStore,
};
use marketplace_database::{DatabaseConfig, DatabaseManager, PgStore};
use metrics_exporter_prometheus::PrometheusHandle;
use secrecy::ExposeSecret;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use webhook_delivery::{DeliveryWorker, ReqwestTransport, WebhookTransport};

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;

use crate::config::{ApiConfig, StorageBackend};
use crate::error::ApiError;
use crate::middleware::rate_limit::{self, RateLimitConfig, RateLimiter};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<ApiConfig>,
    pub store: Arc<dyn MarketplaceStore>,
    /// Present when running on PostgreSQL
    pub database: Option<Arc<DatabaseManager>>,
    pub advertisers: AdvertiserRegistry,
    pub lifecycle: CampaignLifecycle,
    pub auction: PlacementAuction,
    pub attribution: Attribution,
    pub conversions: ConversionHandler,
    pub wallet: WalletLedger,
    pub reconciler: Reconciler,
    pub webhook_worker: DeliveryWorker,
    pub rate_limiter: RateLimiter,
    /// Prometheus render handle, when a recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Wires every service onto `store`.
    pub fn new(
        config: ApiConfig,
        store: Arc<dyn MarketplaceStore>,
        transport: Arc<dyn WebhookTransport>,
    ) -> Self {
        let queue = WebhookQueue::new(
            store.clone(),
            QueueSettings {
                max_attempts: config.webhook.max_attempts,
                batch_size: config.webhook.batch_size,
                lease_secs: config.webhook.lease_secs,
            },
        );
        let rate_limiter = RateLimiter::new(RateLimitConfig {
            max_requests: config.rate_limiting.max_requests,
            window_secs: config.rate_limiting.window_secs,
            trusted_proxies: config.trusted_proxies,
        });
        let attribution = Attribution::new(
            store.clone(),
            config.visitor_hash_salt.expose_secret().clone(),
        );

        Self {
            advertisers: AdvertiserRegistry::new(store.clone()),
            lifecycle: CampaignLifecycle::new(store.clone()),
            auction: PlacementAuction::new(store.clone()),
            attribution,
            conversions: ConversionHandler::new(store.clone(), queue.clone()),
            wallet: WalletLedger::new(store.clone()),
            reconciler: Reconciler::new(store.clone()),
            webhook_worker: DeliveryWorker::new(queue, transport),
            rate_limiter,
            database: None,
            metrics: None,
            config: Arc::new(config),
            store,
        }
    }

    /// Builds the configured store and the reqwest webhook transport.
    pub async fn from_config(config: ApiConfig) -> Result<Self, ApiError> {
        let transport = ReqwestTransport::new(config.webhook.timeout())
            .map_err(|e| ApiError::internal(format!("Failed to build webhook client: {}", e)))?;

        match config.storage {
            StorageBackend::Memory => {
                info!("Using in-memory store; data is lost on restart");
                Ok(Self::new(config, Arc::new(InMemoryStore::new()), Arc::new(transport)))
            }
            StorageBackend::Postgres => {
                let db_config = DatabaseConfig::new(config.database_url.expose_secret().clone());
                let manager = DatabaseManager::new(db_config)
                    .await
                    .map_err(|e| ApiError::internal(format!("Database initialization failed: {}", e)))?;
                info!("{}", manager.stats());

                let store = Arc::new(PgStore::new(manager.pool().clone()));
                let mut state = Self::new(config, store, Arc::new(transport));
                state.database = Some(Arc::new(manager));
                Ok(state)
            }
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Creates the router with all routes and middleware configured.
pub fn build_router(state: Arc<AppState>) -> Router {
    let mut redirect = Router::new().route("/go/:advertiser_slug", get(handlers::redirect));
    if state.config.rate_limiting.enabled {
        redirect = redirect.route_layer(from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit::rate_limit,
        ));
    }

    let router = Router::new()
        // Operational endpoints
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        // Auction and impressions
        .route(
            "/api/v1/placements/:placement/winners",
            get(handlers::get_winners),
        )
        .route("/api/v1/impressions", post(handlers::record_impressions))
        // Conversions and wallet
        .route("/api/v1/postback", post(handlers::record_postback))
        .route("/api/v1/wallet/top-ups", post(handlers::top_up))
        // Reconciler
        .route("/api/v1/cron/rollups", post(handlers::rollup_stats))
        .route("/api/v1/cron/lifecycle", post(handlers::advance_lifecycle))
        .route("/api/v1/cron/promotions", post(handlers::expire_promotions))
        .route("/api/v1/cron/low-balance", post(handlers::scan_low_balances))
        .route("/api/v1/cron/backfill-debits", post(handlers::backfill_debits))
        .route("/api/v1/cron/spend-audit", post(handlers::audit_campaign_spend))
        .route("/api/v1/cron/webhooks", post(handlers::process_webhooks))
        // Admin
        .route(
            "/api/v1/admin/advertisers",
            post(handlers::register_advertiser),
        )
        .route(
            "/api/v1/admin/advertisers/:slug/status",
            put(handlers::set_advertiser_status),
        )
        .route(
            "/api/v1/admin/advertisers/:slug/wallet",
            get(handlers::verify_wallet).put(handlers::configure_wallet),
        )
        .route("/api/v1/admin/campaigns", post(handlers::create_campaign))
        .route(
            "/api/v1/admin/campaigns/:id/:action",
            post(handlers::campaign_action),
        )
        .merge(redirect)
        .with_state(state);

    middleware::MiddlewareBuilder::new()
        .logging(true)
        .security(true)
        .request_id(true)
        .apply_to(router)
}

/// Main API server structure
pub struct ApiServer {
    /// Axum router with all routes configured
    router: Router,
    /// Server configuration
    config: Arc<ApiConfig>,
    /// Application state
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(state: AppState) -> Self {
        let state = Arc::new(state);
        Self {
            router: build_router(state.clone()),
            config: state.config.clone(),
            state,
        }
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ApiError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.bind_address;

        info!("Starting marketplace API server on {}", addr);
        info!("Health check available at http://{}/health", addr);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ApiError::Internal {
                message: format!("Failed to bind to {}: {}", addr, e),
            })?;

        info!("Server listening on http://{}", addr);

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ApiError::Internal {
            message: format!("Server error: {}", e),
        })?;

        info!("Server stopped");
        Ok(())
    }

    /// Returns server configuration
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Returns application state
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }
}
