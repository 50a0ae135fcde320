//! Placement markers kept next to the quota counters.
//!
//! - last placement time per (user, event), read by the interval gate
//! - consumed flag per candidate, so a candidate is executed once
//!
//! Both live in the quota store with the counters' retention.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::store::{consumed_key, last_placement_key, QuotaStore};
use crate::types::StoreError;

pub struct PlacementMarkers {
    store: Arc<dyn QuotaStore>,
    ttl: Duration,
}

impl PlacementMarkers {
    pub fn new(store: Arc<dyn QuotaStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn last_placement(&self, user_id: &str, event_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let key = last_placement_key(user_id, event_id);
        match self.store.get(&key).await? {
            Some(raw) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(ts) => Ok(Some(ts.with_timezone(&Utc))),
                Err(e) => {
                    warn!(key = %key, value = %raw, error = %e, "Unreadable last-placement marker, ignoring");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn record_placement(&self, user_id: &str, event_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.store
            .set(&last_placement_key(user_id, event_id), at.to_rfc3339(), self.ttl)
            .await
    }

    /// Whether a placement on the event happened less than `min_interval`
    /// before `now`. Store errors let the leg through.
    pub async fn too_soon(
        &self,
        user_id: &str,
        event_id: &str,
        min_interval: chrono::Duration,
        now: DateTime<Utc>,
    ) -> bool {
        if min_interval <= chrono::Duration::zero() {
            return false;
        }
        match self.last_placement(user_id, event_id).await {
            Ok(Some(last)) => now - last < min_interval,
            Ok(None) => false,
            Err(e) => {
                warn!(user = %user_id, event = %event_id, error = %e, "Interval gate unavailable, not gating");
                false
            }
        }
    }

    /// Read errors count as "not consumed".
    pub async fn is_consumed(&self, user_id: &str, candidate_id: &str) -> bool {
        match self.store.get(&consumed_key(user_id, candidate_id)).await {
            Ok(v) => v.is_some(),
            Err(e) => {
                warn!(user = %user_id, candidate = %candidate_id, error = %e, "Consumed marker unreadable");
                false
            }
        }
    }

    pub async fn mark_consumed(&self, user_id: &str, candidate_id: &str) -> Result<(), StoreError> {
        self.store
            .set(&consumed_key(user_id, candidate_id), Utc::now().to_rfc3339(), self.ttl)
            .await
    }
}
