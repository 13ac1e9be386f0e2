//! API Configuration Module
//!
//! Handles configuration loading for the marketplace server. Values come from
//! an optional `marketplace.toml`, then `MARKETPLACE_*` environment variables
//! (nested keys use `__`, e.g. `MARKETPLACE_WEBHOOK__MAX_ATTEMPTS=8`).

use config::{Config, ConfigError, Environment, File};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::{info, warn};

/// Which [`MarketplaceStore`](marketplace_core::MarketplaceStore) backs the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Postgres,
}

/// Server configuration for the API
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Server bind address and port
    pub bind_address: SocketAddr,

    /// Server environment (development, staging, production)
    pub environment: String,

    pub storage: StorageBackend,

    /// PostgreSQL connection URL, used when `storage = "postgres"`
    pub database_url: Secret<String>,

    /// Bearer token for the reconciler endpoints
    pub cron_token: Secret<String>,

    /// Bearer token for the admin endpoints
    pub admin_token: Secret<String>,

    /// Bearer token the payment processor presents to complete top-ups
    pub payment_token: Secret<String>,

    /// Salt for hashing visitor IPs and user agents
    pub visitor_hash_salt: Secret<String>,

    /// Fallback redirect target for advertisers without a destination URL
    pub review_page_base_url: String,

    /// Reverse proxies in front of the server that append to
    /// `X-Forwarded-For`. 0 ignores the header and uses the socket peer.
    pub trusted_proxies: usize,

    pub webhook: WebhookConfig,

    /// Redirect endpoint rate limiting
    pub rate_limiting: RateLimitingConfig,

    /// In-process reconciler schedule
    pub scheduler: SchedulerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 8080),
            environment: "development".to_string(),
            storage: StorageBackend::Memory,
            database_url: Secret::new("postgresql://localhost:5432/marketplace".to_string()),
            cron_token: Secret::new(String::new()),
            admin_token: Secret::new(String::new()),
            payment_token: Secret::new(String::new()),
            visitor_hash_salt: Secret::new("development-visitor-salt".to_string()),
            review_page_base_url: "http://localhost:3000/brokers".to_string(),
            trusted_proxies: 0,
            webhook: WebhookConfig::default(),
            rate_limiting: RateLimitingConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ApiConfig {
    /// Loads configuration from config files and environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Like [`ApiConfig::from_env`], with `path` as an extra required file
    /// layered between the default files and the environment.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::with_name("marketplace.toml").required(false))
            .add_source(File::with_name("config/marketplace.toml").required(false));
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("MARKETPLACE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let api_config: ApiConfig = config.try_deserialize()?;

        api_config.validate()?;
        Ok(api_config)
    }

    /// Logs the non-secret settings and warns about disabled endpoints.
    pub fn log_summary(&self) {
        info!("API Configuration loaded:");
        info!("  Environment: {}", self.environment);
        info!("  Bind Address: {}", self.bind_address);
        info!("  Storage: {:?}", self.storage);
        info!(
            "  Rate Limiting: {} ({} req / {}s, trusted proxies: {})",
            self.rate_limiting.enabled,
            self.rate_limiting.max_requests,
            self.rate_limiting.window_secs,
            self.trusted_proxies
        );
        info!(
            "  Webhooks: max_attempts={} batch_size={}",
            self.webhook.max_attempts, self.webhook.batch_size
        );

        for (name, token) in [
            ("cron_token", &self.cron_token),
            ("admin_token", &self.admin_token),
            ("payment_token", &self.payment_token),
        ] {
            if token.expose_secret().is_empty() {
                warn!("{} is not set; its endpoints reject every request", name);
            }
        }
    }

    /// Validates the configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage == StorageBackend::Postgres && self.database_url.expose_secret().is_empty()
        {
            return Err(ConfigError::Message(
                "database_url is required for postgres storage".to_string(),
            ));
        }

        if self.review_page_base_url.trim().is_empty() {
            return Err(ConfigError::Message(
                "review_page_base_url cannot be empty".to_string(),
            ));
        }

        self.webhook.validate()?;

        if self.rate_limiting.enabled
            && (self.rate_limiting.max_requests == 0 || self.rate_limiting.window_secs == 0)
        {
            return Err(ConfigError::Message(
                "rate_limiting needs a positive max_requests and window_secs".to_string(),
            ));
        }

        if self.scheduler.enabled && self.scheduler.reconcile_interval_secs == 0 {
            return Err(ConfigError::Message(
                "scheduler.reconcile_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.is_production() {
            if self.visitor_hash_salt.expose_secret().len() < 16 {
                return Err(ConfigError::Message(
                    "visitor_hash_salt must be at least 16 characters in production".to_string(),
                ));
            }
            if self.visitor_hash_salt.expose_secret() == "development-visitor-salt" {
                return Err(ConfigError::Message(
                    "visitor_hash_salt must be changed in production".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Returns true if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    /// Returns true if running in production mode
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Outbound conversion webhook settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Per-attempt HTTP timeout
    pub timeout_secs: u64,
    pub batch_size: usize,
    /// Attempts before a delivery is marked failed
    pub max_attempts: u32,
    /// How often the background worker looks for due deliveries
    pub poll_interval_secs: u64,
    /// How long a claimed delivery stays invisible to other workers. The
    /// worker renews it before each POST.
    pub lease_secs: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            batch_size: 50,
            max_attempts: 5,
            poll_interval_secs: 30,
            lease_secs: 60,
        }
    }
}

impl WebhookConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 || self.poll_interval_secs == 0 {
            return Err(ConfigError::Message(
                "webhook timeout_secs and poll_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.batch_size == 0 || self.max_attempts == 0 {
            return Err(ConfigError::Message(
                "webhook batch_size and max_attempts must be greater than 0".to_string(),
            ));
        }
        // The lease is renewed per POST, so it has to outlive one request.
        if self.lease_secs <= self.timeout_secs as i64 {
            return Err(ConfigError::Message(
                "webhook lease_secs must exceed timeout_secs".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    /// Enable rate limiting
    pub enabled: bool,

    /// Requests allowed per client IP in one window
    pub max_requests: u32,

    /// Window length in seconds
    pub window_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 60,
            window_secs: 60,
        }
    }
}

/// In-process reconciler loop. Disable when an external cron calls the
/// `/api/v1/cron/*` endpoints instead.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub reconcile_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            reconcile_interval_secs: 3_600,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable structured logging (JSON format)
    pub structured: bool,

    /// Log to file in addition to stdout
    pub log_to_file: bool,

    /// Log directory (if logging to file)
    pub log_file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            structured: true,
            log_to_file: false,
            log_file_path: None,
        }
    }
}
