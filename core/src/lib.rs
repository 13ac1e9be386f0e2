//! # Marketplace Core
//!
//! Allocation and billing engine for the broker marketplace: wallet ledger,
//! campaign lifecycle, placement auction, frequency capping, click
//! attribution with CPC billing, conversion postbacks, webhook delivery
//! bookkeeping and the scheduled reconciler.
//!
//! Every service talks to persistence through [`store::MarketplaceStore`].
//! The in-memory implementation lives here; the PostgreSQL one lives in the
//! `marketplace-database` crate.

pub mod advertisers;
pub mod attribution;
pub mod auction;
pub mod conversion;
pub mod error;
pub mod frequency_cap;
pub mod lifecycle;
pub mod notify;
pub mod reconciler;
pub mod store;
pub mod types;
pub mod wallet;
pub mod webhook;

#[cfg(test)]
mod testing;

pub use error::{MarketplaceError, MarketplaceResult};
pub use store::{InMemoryStore, MarketplaceStore};
