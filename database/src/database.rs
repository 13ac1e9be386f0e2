//! # PostgreSQL Database Integration
//!
//! Connection pooling and health checks for the marketplace store.

use anyhow::Result;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{debug, error, info, instrument};

use crate::config::DatabaseConfig;
use crate::migrations::MigrationRunner;

/// Database manager for PostgreSQL operations
pub struct DatabaseManager {
    pool: PgPool,
    config: DatabaseConfig,
}

impl DatabaseManager {
    /// Connects the pool, verifies the server and applies pending migrations
    /// when `run_migrations` is set.
    #[instrument(skip(config))]
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        info!("Initializing database connection pool");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(&config.database_url)
            .await?;

        let version: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(&pool)
            .await?;

        info!("Connected to PostgreSQL: {}", version);

        if config.run_migrations {
            let applied = MigrationRunner::new().run(&pool).await?;
            info!(applied, "Schema migrations up to date");
        }

        Ok(Self { pool, config })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<()> {
        debug!("Performing database health check");

        let result: (i32,) = sqlx::query_as("SELECT 1 as health")
            .fetch_one(&self.pool)
            .await?;

        if result.0 == 1 {
            Ok(())
        } else {
            error!("Database health check failed");
            Err(anyhow::anyhow!("Health check returned unexpected result"))
        }
    }

    pub fn stats(&self) -> PoolStats {
        let size = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        PoolStats {
            max_connections: self.config.max_connections,
            size,
            idle,
            in_use: size.saturating_sub(idle),
        }
    }

    /// Get the current database configuration
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }
}

/// Connection pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PoolStats {
    pub max_connections: u32,
    pub size: u32,
    pub idle: u32,
    pub in_use: u32,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: max={}, size={}, idle={}, in_use={}",
            self.max_connections, self.size, self.idle, self.in_use
        )
    }
}
