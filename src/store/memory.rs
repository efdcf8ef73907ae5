//! In-process store backed by sharded concurrent maps.

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use tracing::debug;

use super::{CounterStore, Outcome, QuotaUsageRecord, UsageStore};
use crate::error::Result;
use crate::ratelimit::PeriodKey;

#[derive(Debug, Clone, Copy, Default)]
struct UsageCounts {
    requests: u64,
    successes: u64,
    errors: u64,
}

impl UsageCounts {
    fn count_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.successes += 1,
            Outcome::Error => self.errors += 1,
        }
    }

    fn to_record(self, identity: &str, date: NaiveDate) -> QuotaUsageRecord {
        QuotaUsageRecord {
            identity: identity.to_string(),
            date,
            request_count: self.requests,
            success_count: self.successes,
            error_count: self.errors,
        }
    }
}

/// A [`CounterStore`] and [`UsageStore`] held in memory.
///
/// Every mutation happens while holding the map entry, which gives the same
/// guarantee as a row-level upsert: concurrent increments for one key are
/// serialized and none are lost.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: DashMap<(String, PeriodKey), u64>,
    usage: DashMap<(String, NaiveDate), UsageCounts>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live period counters.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment_and_get(
        &self,
        identity: &str,
        period: PeriodKey,
        amount: i64,
    ) -> Result<u64> {
        let mut count = self
            .counters
            .entry((identity.to_string(), period))
            .or_insert(0);
        *count = if amount >= 0 {
            count.saturating_add(amount as u64)
        } else {
            count.saturating_sub(amount.unsigned_abs())
        };
        Ok(*count)
    }

    async fn get_count(&self, identity: &str, period: PeriodKey) -> Result<u64> {
        Ok(self
            .counters
            .get(&(identity.to_string(), period))
            .map(|c| *c)
            .unwrap_or(0))
    }

    async fn increment_if_below(
        &self,
        identity: &str,
        period: PeriodKey,
        amount: u64,
        limit: u64,
    ) -> Result<Option<u64>> {
        let mut count = self
            .counters
            .entry((identity.to_string(), period))
            .or_insert(0);
        let next = count.saturating_add(amount);
        if next > limit {
            return Ok(None);
        }
        *count = next;
        Ok(Some(next))
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn record_usage(
        &self,
        identity: &str,
        date: NaiveDate,
        outcome: Outcome,
    ) -> Result<QuotaUsageRecord> {
        let mut counts = self
            .usage
            .entry((identity.to_string(), date))
            .or_default();
        counts.requests += 1;
        counts.count_outcome(outcome);
        Ok(counts.to_record(identity, date))
    }

    async fn reserve_request(
        &self,
        identity: &str,
        date: NaiveDate,
        limit: u64,
    ) -> Result<Option<u64>> {
        let mut counts = self
            .usage
            .entry((identity.to_string(), date))
            .or_default();
        if counts.requests >= limit {
            return Ok(None);
        }
        counts.requests += 1;
        Ok(Some(counts.requests))
    }

    async fn release_request(&self, identity: &str, date: NaiveDate) -> Result<()> {
        if let Some(mut counts) = self.usage.get_mut(&(identity.to_string(), date)) {
            counts.requests = counts.requests.saturating_sub(1);
        }
        Ok(())
    }

    async fn record_outcome(
        &self,
        identity: &str,
        date: NaiveDate,
        outcome: Outcome,
    ) -> Result<QuotaUsageRecord> {
        let mut counts = self
            .usage
            .entry((identity.to_string(), date))
            .or_default();
        counts.count_outcome(outcome);
        Ok(counts.to_record(identity, date))
    }

    async fn usage(&self, identity: &str, date: NaiveDate) -> Result<Option<QuotaUsageRecord>> {
        Ok(self
            .usage
            .get(&(identity.to_string(), date))
            .map(|counts| counts.to_record(identity, date)))
    }

    async fn usage_range(
        &self,
        identity: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<QuotaUsageRecord>> {
        Ok(self
            .usage
            .iter()
            .filter(|entry| {
                let (id, date) = entry.key();
                id == identity && *date >= from && *date <= to
            })
            .map(|entry| entry.value().to_record(identity, entry.key().1))
            .collect())
    }

    async fn active_usage(&self, date: NaiveDate) -> Result<Vec<QuotaUsageRecord>> {
        Ok(self
            .usage
            .iter()
            .filter(|entry| entry.key().1 == date && entry.value().requests > 0)
            .map(|entry| entry.value().to_record(&entry.key().0, date))
            .collect())
    }

    async fn purge_before(&self, date: NaiveDate) -> Result<u64> {
        let before = self.counters.len() + self.usage.len();
        self.counters
            .retain(|(_, period), _| period.start().date_naive() >= date);
        self.usage.retain(|(_, day), _| *day >= date);
        let removed = before.saturating_sub(self.counters.len() + self.usage.len()) as u64;

        debug!(cutoff = %date, removed = removed, "Purged expired counters");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[tokio::test]
    async fn test_increment_and_get_creates_counter() {
        let store = MemoryStore::new();
        let period = PeriodKey::Day(day(1));

        assert_eq!(store.get_count("ip:1.2.3.4", period).await.unwrap(), 0);
        assert_eq!(store.increment_and_get("ip:1.2.3.4", period, 1).await.unwrap(), 1);
        assert_eq!(store.increment_and_get("ip:1.2.3.4", period, 4).await.unwrap(), 5);
        assert_eq!(store.get_count("ip:1.2.3.4", period).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_negative_increment_floors_at_zero() {
        let store = MemoryStore::new();
        let period = PeriodKey::Day(day(1));

        store.increment_and_get("k", period, 1).await.unwrap();
        assert_eq!(store.increment_and_get("k", period, -3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_periods_are_independent() {
        let store = MemoryStore::new();
        store.increment_and_get("k", PeriodKey::Day(day(1)), 7).await.unwrap();

        assert_eq!(store.get_count("k", PeriodKey::Day(day(2))).await.unwrap(), 0);
        assert_eq!(store.get_count("k", PeriodKey::Day(day(1))).await.unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let period = PeriodKey::hour(Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap());

        let tasks: Vec<_> = (0..500)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.increment_and_get("ip:10.0.0.1", period, 1).await.unwrap()
                })
            })
            .collect();
        let results = futures::future::join_all(tasks).await;

        let mut seen: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (1..=500).collect::<Vec<_>>());
        assert_eq!(store.get_count("ip:10.0.0.1", period).await.unwrap(), 500);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_increment_if_below_never_overshoots() {
        let store = Arc::new(MemoryStore::new());
        let period = PeriodKey::Day(day(1));

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.increment_if_below("k", period, 1, 20).await.unwrap()
                })
            })
            .collect();
        let granted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Some(_))))
            .count();

        assert_eq!(granted, 20);
        assert_eq!(store.get_count("k", period).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_record_usage_counts_outcomes() {
        let store = MemoryStore::new();

        store.record_usage("k", day(1), Outcome::Success).await.unwrap();
        store.record_usage("k", day(1), Outcome::Success).await.unwrap();
        let record = store.record_usage("k", day(1), Outcome::Error).await.unwrap();

        assert_eq!(record.request_count, 3);
        assert_eq!(record.success_count, 2);
        assert_eq!(record.error_count, 1);
        assert_eq!(store.usage("k", day(1)).await.unwrap(), Some(record));
        assert_eq!(store.usage("k", day(2)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let store = MemoryStore::new();

        assert_eq!(store.reserve_request("k", day(1), 2).await.unwrap(), Some(1));
        assert_eq!(store.reserve_request("k", day(1), 2).await.unwrap(), Some(2));
        assert_eq!(store.reserve_request("k", day(1), 2).await.unwrap(), None);

        store.release_request("k", day(1)).await.unwrap();
        let record = store.record_outcome("k", day(1), Outcome::Success).await.unwrap();
        assert_eq!(record.request_count, 1);
        assert_eq!(record.success_count, 1);
    }

    #[tokio::test]
    async fn test_active_usage_and_range() {
        let store = MemoryStore::new();
        store.record_usage("a", day(1), Outcome::Success).await.unwrap();
        store.record_usage("a", day(3), Outcome::Success).await.unwrap();
        store.record_usage("b", day(3), Outcome::Error).await.unwrap();

        let mut active = store.active_usage(day(3)).await.unwrap();
        active.sort_by(|x, y| x.identity.cmp(&y.identity));
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].identity, "a");

        let range = store.usage_range("a", day(1), day(2)).await.unwrap();
        assert_eq!(range.len(), 1);
        assert_eq!(range[0].date, day(1));
    }

    #[tokio::test]
    async fn test_purge_before() {
        let store = MemoryStore::new();
        store.increment_and_get("k", PeriodKey::Day(day(1)), 1).await.unwrap();
        store.increment_and_get("k", PeriodKey::Day(day(5)), 1).await.unwrap();
        store.record_usage("k", day(1), Outcome::Success).await.unwrap();
        store.record_usage("k", day(5), Outcome::Success).await.unwrap();

        let removed = store.purge_before(day(3)).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.counter_count(), 1);
        assert!(store.usage("k", day(5)).await.unwrap().is_some());
    }
}
