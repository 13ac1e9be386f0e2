//! Frequency Cap Filter.
//!
//! Best-effort, viewer-local policy: once a viewer has been shown a campaign
//! in a placement `cap_per_window` times within the window, that candidate is
//! dropped. Remaining candidates keep their auction order.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::auction::Winner;
use crate::types::{CampaignId, Placement};

/// One impression the viewer has already seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenImpression {
    pub placement: Placement,
    pub campaign_id: CampaignId,
    pub seen_at: DateTime<Utc>,
}

/// Locally observed impression history for one viewer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImpressionHistory {
    seen: Vec<SeenImpression>,
}

impl ImpressionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, placement: Placement, campaign_id: CampaignId, seen_at: DateTime<Utc>) {
        self.seen.push(SeenImpression {
            placement,
            campaign_id,
            seen_at,
        });
    }

    pub fn count_since(
        &self,
        placement: Placement,
        campaign_id: CampaignId,
        since: DateTime<Utc>,
    ) -> usize {
        self.seen
            .iter()
            .filter(|s| s.placement == placement && s.campaign_id == campaign_id && s.seen_at >= since)
            .count()
    }

    /// Drops entries older than `cutoff`.
    pub fn prune(&mut self, cutoff: DateTime<Utc>) {
        self.seen.retain(|s| s.seen_at >= cutoff);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyCap {
    pub cap_per_window: u32,
    pub window: Duration,
}

impl Default for FrequencyCap {
    fn default() -> Self {
        Self {
            cap_per_window: 3,
            window: Duration::hours(24),
        }
    }
}

impl FrequencyCap {
    pub fn new(cap_per_window: u32, window: Duration) -> Self {
        Self {
            cap_per_window,
            window,
        }
    }

    /// Filters `winners` for `placement`. A cap of zero disables the filter.
    pub fn filter(
        &self,
        winners: Vec<Winner>,
        placement: Placement,
        history: &ImpressionHistory,
        now: DateTime<Utc>,
    ) -> Vec<Winner> {
        if self.cap_per_window == 0 {
            return winners;
        }
        let since = now - self.window;
        winners
            .into_iter()
            .filter(|w| {
                history.count_since(placement, w.campaign_id, since) < self.cap_per_window as usize
            })
            .collect()
    }
}
