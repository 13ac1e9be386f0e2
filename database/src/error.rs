//! Database error types
//!
//! This module provides error types for database operations.

use marketplace_core::MarketplaceError;
use thiserror::Error;

/// Database-related errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A stored value could not be decoded into a domain type
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("SQL error: {0}")]
    Sql(sqlx::Error),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DatabaseError::UniqueViolation(
                    db.constraint().unwrap_or("unknown constraint").to_string(),
                )
            }
            _ => DatabaseError::Sql(err),
        }
    }
}

impl From<DatabaseError> for MarketplaceError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::UniqueViolation(constraint) => {
                MarketplaceError::Conflict(format!("duplicate value for {}", constraint))
            }
            DatabaseError::Sql(sqlx::Error::RowNotFound) => {
                MarketplaceError::NotFound("row not found".into())
            }
            other => MarketplaceError::Storage(other.to_string()),
        }
    }
}

/// Maps a driver error into the domain error the store seam returns.
pub(crate) fn store_err(err: sqlx::Error) -> MarketplaceError {
    DatabaseError::from(err).into()
}

/// Type alias for database results
pub type DatabaseResult<T> = Result<T, DatabaseError>;
