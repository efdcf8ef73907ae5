//! Daily quota tracking and reporting.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

use crate::clock::Clock;
use crate::error::Result;
use crate::ratelimit::{next_midnight, Identity, Limit, Tier, TierTable};
use crate::store::{Outcome, QuotaUsageRecord, Store};

/// Longest history window served by [`QuotaTracker::get_history`].
pub const MAX_HISTORY_DAYS: u32 = 90;

/// Fraction of a daily limit consumed by `request_count`.
///
/// `None` when the limit is unlimited or zero.
pub fn usage_ratio(request_count: u64, limit: Limit) -> Option<f64> {
    match limit {
        Limit::Finite(0) | Limit::Unlimited => None,
        Limit::Finite(n) => Some(request_count as f64 / n as f64),
    }
}

/// Snapshot of an identity's standing against its daily quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub identity: Identity,
    pub tier: Tier,
    pub usage: QuotaUsageRecord,
    pub daily_limit: Limit,
    pub hourly_limit: Limit,
    pub burst_limit: u64,
    /// `None` when the daily limit is unlimited
    pub remaining_daily: Option<u64>,
    /// `None` when the daily limit is unlimited
    pub usage_ratio: Option<f64>,
    pub reset_time: DateTime<Utc>,
}

/// Maintains the per-day request/success/error aggregates.
#[derive(Clone)]
pub struct QuotaTracker {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    tiers: TierTable,
}

impl std::fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaTracker")
            .field("tiers", &self.tiers)
            .finish()
    }
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, tiers: TierTable) -> Self {
        Self {
            store,
            clock,
            tiers,
        }
    }

    /// Current UTC date according to the tracker's clock.
    pub fn today(&self) -> NaiveDate {
        self.clock.now().date_naive()
    }

    /// Count a completed request and its outcome for `date`.
    ///
    /// Both successes and failures count toward `request_count`.
    pub async fn record_request(
        &self,
        identity: &Identity,
        date: NaiveDate,
        success: bool,
    ) -> Result<QuotaUsageRecord> {
        let record = self
            .store
            .record_usage(&identity.partition_key(), date, Outcome::from_success(success))
            .await?;
        trace!(
            identity = %identity,
            date = %date,
            requests = record.request_count,
            "Recorded request"
        );
        Ok(record)
    }

    /// Count only the outcome of a request whose slot was reserved up front.
    pub async fn record_outcome(
        &self,
        identity: &Identity,
        date: NaiveDate,
        success: bool,
    ) -> Result<QuotaUsageRecord> {
        self.store
            .record_outcome(&identity.partition_key(), date, Outcome::from_success(success))
            .await
    }

    /// Usage for `date` (today if `None`). Days without activity read as zero.
    pub async fn get_usage(
        &self,
        identity: &Identity,
        date: Option<NaiveDate>,
    ) -> Result<QuotaUsageRecord> {
        let key = identity.partition_key();
        let date = date.unwrap_or_else(|| self.today());
        Ok(self
            .store
            .usage(&key, date)
            .await?
            .unwrap_or_else(|| QuotaUsageRecord::empty(&key, date)))
    }

    /// The last `days` days of usage, most recent first.
    ///
    /// Days without activity are zero-filled so the sequence always has one
    /// entry per day. `days` is capped at [`MAX_HISTORY_DAYS`].
    pub async fn get_history(&self, identity: &Identity, days: u32) -> Result<Vec<QuotaUsageRecord>> {
        let days = days.min(MAX_HISTORY_DAYS);
        if days == 0 {
            return Ok(Vec::new());
        }

        let key = identity.partition_key();
        let today = self.today();
        let from = today - ChronoDuration::days(i64::from(days) - 1);

        let mut rows: HashMap<NaiveDate, QuotaUsageRecord> = self
            .store
            .usage_range(&key, from, today)
            .await?
            .into_iter()
            .map(|r| (r.date, r))
            .collect();

        Ok((0..days)
            .map(|offset| today - ChronoDuration::days(i64::from(offset)))
            .map(|date| {
                rows.remove(&date)
                    .unwrap_or_else(|| QuotaUsageRecord::empty(&key, date))
            })
            .collect())
    }

    /// Today's usage together with the limits and remaining budget.
    pub async fn get_quota_status(&self, identity: &Identity) -> Result<QuotaStatus> {
        let tier = identity.tier();
        let limits = self.tiers.limits(tier);
        let usage = self.get_usage(identity, None).await?;

        Ok(QuotaStatus {
            identity: identity.clone(),
            tier,
            daily_limit: limits.daily,
            hourly_limit: limits.hourly,
            burst_limit: limits.burst,
            remaining_daily: limits.daily.remaining_after(usage.request_count),
            usage_ratio: usage_ratio(usage.request_count, limits.daily),
            reset_time: next_midnight(self.clock.now()),
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn setup() -> (QuotaTracker, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 10, 15, 0, 0).unwrap());
        let tracker = QuotaTracker::new(
            Arc::new(MemoryStore::new()),
            Arc::new(clock.clone()),
            TierTable::default(),
        );
        (tracker, clock)
    }

    fn ip() -> Identity {
        Identity::from_ip_str("192.0.2.33").unwrap()
    }

    #[test]
    fn test_usage_ratio() {
        assert_eq!(usage_ratio(95, Limit::Finite(100)), Some(0.95));
        assert_eq!(usage_ratio(10, Limit::Unlimited), None);
        assert_eq!(usage_ratio(10, Limit::Finite(0)), None);
    }

    #[tokio::test]
    async fn test_record_request_counts_both_outcomes() {
        let (tracker, _) = setup();
        let today = tracker.today();

        tracker.record_request(&ip(), today, true).await.unwrap();
        let record = tracker.record_request(&ip(), today, false).await.unwrap();

        assert_eq!(record.request_count, 2);
        assert_eq!(record.success_count, 1);
        assert_eq!(record.error_count, 1);
    }

    #[tokio::test]
    async fn test_get_usage_defaults_to_zero() {
        let (tracker, _) = setup();
        let usage = tracker.get_usage(&ip(), None).await.unwrap();
        assert_eq!(usage.request_count, 0);
        assert_eq!(usage.identity, "ip:192.0.2.33");
        assert_eq!(usage.date, tracker.today());
    }

    #[tokio::test]
    async fn test_history_is_zero_filled_most_recent_first() {
        let (tracker, clock) = setup();
        let today = tracker.today();

        tracker.record_request(&ip(), today, true).await.unwrap();
        tracker
            .record_request(&ip(), today - ChronoDuration::days(2), true)
            .await
            .unwrap();
        tracker
            .record_request(&ip(), today - ChronoDuration::days(10), true)
            .await
            .unwrap();

        let history = tracker.get_history(&ip(), 4).await.unwrap();
        let counts: Vec<u64> = history.iter().map(|r| r.request_count).collect();
        assert_eq!(counts, vec![1, 0, 1, 0]);
        assert_eq!(history[0].date, today);
        assert_eq!(history[3].date, today - ChronoDuration::days(3));

        clock.advance(ChronoDuration::days(1));
        let history = tracker.get_history(&ip(), 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].request_count, 0);
    }

    #[tokio::test]
    async fn test_history_bounds() {
        let (tracker, _) = setup();
        assert!(tracker.get_history(&ip(), 0).await.unwrap().is_empty());
        assert_eq!(
            tracker.get_history(&ip(), 365).await.unwrap().len(),
            MAX_HISTORY_DAYS as usize
        );
    }

    #[tokio::test]
    async fn test_quota_status() {
        let (tracker, _) = setup();
        let today = tracker.today();
        for _ in 0..40 {
            tracker.record_request(&ip(), today, true).await.unwrap();
        }

        let status = tracker.get_quota_status(&ip()).await.unwrap();
        assert_eq!(status.tier, Tier::Free);
        assert_eq!(status.remaining_daily, Some(60));
        assert_eq!(status.usage_ratio, Some(0.4));
        assert_eq!(
            status.reset_time,
            Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap()
        );

        let key = Identity::api_key("tk_1").unwrap();
        let status = tracker.get_quota_status(&key).await.unwrap();
        assert_eq!(status.remaining_daily, None);
        assert_eq!(status.usage_ratio, None);
    }
}
