//! # Database Migration System
//!
//! Versioned SQL migrations compiled into the binary. Each applied version
//! is recorded in `schema_migrations` with a sha256 checksum; a checksum
//! mismatch on an already-applied version aborts startup.

use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{DatabaseError, DatabaseResult};

/// Serializes concurrent migrators across instances.
const MIGRATION_LOCK_KEY: i64 = 0x6d6b_7470_6c63;

/// One embedded schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

impl Migration {
    pub fn checksum(&self) -> String {
        hex::encode(Sha256::digest(self.sql.as_bytes()))
    }
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "marketplace",
    sql: include_str!("../migrations/0001_marketplace.sql"),
}];

#[derive(Debug, Clone)]
pub struct MigrationRunner {
    migrations: Vec<Migration>,
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationRunner {
    pub fn new() -> Self {
        Self {
            migrations: MIGRATIONS.to_vec(),
        }
    }

    pub fn with_migrations(migrations: Vec<Migration>) -> DatabaseResult<Self> {
        let mut versions: Vec<i64> = migrations.iter().map(|m| m.version).collect();
        versions.sort_unstable();
        versions.dedup();
        if versions.len() != migrations.len() {
            return Err(DatabaseError::Migration("duplicate migration version".into()));
        }
        let mut migrations = migrations;
        migrations.sort_by_key(|m| m.version);
        Ok(Self { migrations })
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Applies every pending migration in version order. Returns how many
    /// were applied.
    #[instrument(skip(self, pool))]
    pub async fn run(&self, pool: &PgPool) -> DatabaseResult<usize> {
        let mut conn = pool.acquire().await?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        let result = self.apply_pending(pool).await;

        if let Err(err) = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await
        {
            warn!("Failed to release migration lock: {}", err);
        }

        result
    }

    async fn apply_pending(&self, pool: &PgPool) -> DatabaseResult<usize> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version BIGINT PRIMARY KEY,
                name TEXT NOT NULL,
                checksum TEXT NOT NULL,
                execution_time_ms BIGINT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        )
        .execute(pool)
        .await?;

        let rows = sqlx::query("SELECT version, checksum FROM schema_migrations")
            .fetch_all(pool)
            .await?;
        let mut applied = std::collections::HashMap::new();
        for row in rows {
            let version: i64 = row.try_get("version")?;
            let checksum: String = row.try_get("checksum")?;
            applied.insert(version, checksum);
        }

        let mut count = 0;
        for migration in &self.migrations {
            let checksum = migration.checksum();
            if let Some(recorded) = applied.get(&migration.version) {
                if *recorded != checksum {
                    return Err(DatabaseError::Migration(format!(
                        "checksum mismatch for migration {} ({})",
                        migration.version, migration.name
                    )));
                }
                debug!(version = migration.version, "Migration already applied");
                continue;
            }

            let started = Instant::now();
            let mut tx = pool.begin().await?;
            sqlx::raw_sql(migration.sql).execute(&mut *tx).await.map_err(|err| {
                DatabaseError::Migration(format!(
                    "migration {} ({}) failed: {}",
                    migration.version, migration.name, err
                ))
            })?;
            sqlx::query(
                "INSERT INTO schema_migrations (version, name, checksum, execution_time_ms)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(migration.version)
            .bind(migration.name)
            .bind(&checksum)
            .bind(started.elapsed().as_millis() as i64)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            info!(
                version = migration.version,
                name = migration.name,
                "Applied migration"
            );
            count += 1;
        }
        Ok(count)
    }
}
