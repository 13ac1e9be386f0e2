//! # Database Layer
//!
//! PostgreSQL persistence for the broker marketplace: connection pooling,
//! embedded schema migrations and the [`PgStore`] implementation of
//! `marketplace_core::MarketplaceStore`.

pub mod config;
pub mod database;
pub mod error;
pub mod migrations;
pub mod pg_store;

pub use config::DatabaseConfig;
pub use database::{DatabaseManager, PoolStats};
pub use error::{DatabaseError, DatabaseResult};
pub use migrations::{Migration, MigrationRunner, MIGRATIONS};
pub use pg_store::PgStore;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
