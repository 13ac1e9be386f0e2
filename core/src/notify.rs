//! Advertiser notifications and audit trail helpers.
//!
//! Notifications are stored for the external email sender; nothing here
//! renders or sends mail.

use std::sync::Arc;
use tracing::{info, warn};

use crate::error::MarketplaceResult;
use crate::store::MarketplaceStore;
use crate::types::{AuditEntry, Notification, NotificationKind};

/// Actor recorded on audit entries written by the click billing path.
pub const ACTOR_BILLING: &str = "system:billing";
/// Actor recorded on audit entries written by reconciler jobs.
pub const ACTOR_RECONCILER: &str = "system:reconciler";
/// Actor recorded on audit entries written by the webhook worker.
pub const ACTOR_WEBHOOKS: &str = "system:webhooks";

#[derive(Clone)]
pub struct Notifier {
    store: Arc<dyn MarketplaceStore>,
}

impl Notifier {
    pub fn new(store: Arc<dyn MarketplaceStore>) -> Self {
        Self { store }
    }

    pub async fn raise(
        &self,
        advertiser_slug: &str,
        kind: NotificationKind,
        message: impl Into<String>,
    ) -> MarketplaceResult<()> {
        let notification = Notification::new(advertiser_slug, kind, message);
        info!(
            advertiser = advertiser_slug,
            kind = %kind,
            "Raising advertiser notification: {}",
            notification.message
        );
        metrics::increment_counter!("marketplace_notifications_total", "kind" => kind.as_str());
        self.store.insert_notification(notification).await
    }

    /// Appends an audit entry. Failures are logged and swallowed so that an
    /// audit write never undoes the state change it describes.
    pub async fn audit(&self, entry: AuditEntry) {
        let action = entry.action.clone();
        let resource = entry.resource_id.clone();
        if let Err(e) = self.store.append_audit(entry).await {
            warn!(
                action = %action,
                resource = %resource,
                "Failed to append audit entry: {}",
                e
            );
        }
    }
}
