//! Advertiser registration and admin status changes.

use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use crate::error::{MarketplaceError, MarketplaceResult};
use crate::notify::Notifier;
use crate::store::MarketplaceStore;
use crate::types::{Advertiser, AdvertiserStatus, AuditEntry, Wallet};

/// Registration input. The slug becomes the immutable identity key.
#[derive(Debug, Clone)]
pub struct NewAdvertiser {
    pub slug: String,
    pub display_name: String,
    pub api_key: String,
    pub webhook_url: Option<String>,
    pub destination_url: Option<String>,
}

#[derive(Clone)]
pub struct AdvertiserRegistry {
    store: Arc<dyn MarketplaceStore>,
    notifier: Notifier,
}

impl AdvertiserRegistry {
    pub fn new(store: Arc<dyn MarketplaceStore>) -> Self {
        Self {
            notifier: Notifier::new(store.clone()),
            store,
        }
    }

    /// Creates the account in `pending` together with a zero-balance wallet.
    pub async fn register(&self, input: NewAdvertiser) -> MarketplaceResult<Advertiser> {
        validate_slug(&input.slug)?;
        if input.api_key.trim().len() < 16 {
            return Err(MarketplaceError::validation(
                "api_key must be at least 16 characters",
            ));
        }
        for url in [&input.webhook_url, &input.destination_url].into_iter().flatten() {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(MarketplaceError::validation(format!(
                    "'{}' is not an http(s) url",
                    url
                )));
            }
        }

        let advertiser = Advertiser {
            slug: input.slug.clone(),
            display_name: input.display_name,
            status: AdvertiserStatus::Pending,
            api_key: input.api_key,
            webhook_url: input.webhook_url,
            destination_url: input.destination_url,
            created_at: Utc::now(),
        };
        self.store
            .insert_advertiser(advertiser.clone(), Wallet::new(&input.slug))
            .await?;

        info!(advertiser = %advertiser.slug, "Advertiser registered");
        Ok(advertiser)
    }

    pub async fn set_status(
        &self,
        slug: &str,
        status: AdvertiserStatus,
        actor: &str,
    ) -> MarketplaceResult<bool> {
        let changed = self.store.set_advertiser_status(slug, status).await?;
        if changed {
            info!(advertiser = slug, status = %status, "Advertiser status changed");
            self.notifier
                .audit(AuditEntry::new(
                    format!("advertiser.{}", status),
                    "advertiser",
                    slug,
                    "admin status change",
                    actor,
                ))
                .await;
        }
        Ok(changed)
    }

    pub async fn get(&self, slug: &str) -> MarketplaceResult<Advertiser> {
        self.store
            .get_advertiser(slug)
            .await?
            .ok_or_else(|| MarketplaceError::not_found(format!("advertiser {}", slug)))
    }
}

/// Lowercase ascii, digits and single dashes.
fn validate_slug(slug: &str) -> MarketplaceResult<()> {
    let well_formed = !slug.is_empty()
        && slug.len() <= 64
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && !slug.contains("--")
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if well_formed {
        Ok(())
    } else {
        Err(MarketplaceError::validation(format!("invalid advertiser slug '{}'", slug)))
    }
}
